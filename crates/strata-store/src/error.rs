//! Error types for storage and directory clients.

use thiserror::Error;

/// Result alias for store/directory operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by storage or directory operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The series the operation targets is not registered.
    #[error("unknown series: class_id={class_id:#x} labels_id={labels_id:#x}")]
    UnknownSeries {
        /// Class id of the missing series.
        class_id: u64,
        /// Labels id of the missing series.
        labels_id: u64,
    },

    /// A value block could not be decoded.
    #[error("malformed value block: {reason}")]
    MalformedValues {
        /// Description of the problem.
        reason: String,
    },

    /// The underlying engine failed.
    #[error("storage engine error: {reason}")]
    Engine {
        /// Description of the failure.
        reason: String,
    },
}
