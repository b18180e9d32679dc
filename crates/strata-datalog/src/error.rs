//! Error taxonomy of the datalog subsystem.
//!
//! Configuration, durability and replay errors are fatal to startup or
//! to the write path; apply, transport and backpressure errors are
//! recoverable and handled where they occur.

use thiserror::Error;

/// Result alias for datalog operations.
pub type DatalogResult<T> = Result<T, DatalogError>;

/// Errors surfaced by the datalog subsystem.
#[derive(Debug, Error)]
pub enum DatalogError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// I/O failure on append, flush, rotation or segment access.
    /// Fatal to the write path: the failing append is rejected.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A segment could not be parsed during replay or tailing.
    /// Fatal at startup.
    #[error("corrupt segment {segment}: {reason}")]
    Corrupt {
        /// Name of the offending segment file.
        segment: String,
        /// Description of the corruption.
        reason: String,
    },

    /// A record failed to encode or decode.
    #[error("record codec error: {0}")]
    Codec(#[from] strata_model::CodecError),

    /// The storage or directory engine rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] strata_store::StoreError),

    /// An apply-pool queue is full. Surfaced to the caller as a
    /// distinct condition, never silently blocked or dropped.
    #[error("apply queue {partition} full")]
    Backpressure {
        /// The partition whose queue rejected the job.
        partition: usize,
    },

    /// The log has not been started yet, or is already shut down.
    #[error("datalog is not ready")]
    NotReady,

    /// Shutdown was requested while the operation was in flight.
    #[error("datalog shut down")]
    Shutdown,

    /// A feeder/consumer session violated the replication protocol.
    #[error("protocol error: {msg}")]
    Protocol {
        /// Description of the violation.
        msg: String,
    },

    /// A protocol frame failed to serialize or deserialize.
    #[error("frame codec error")]
    Frame(#[from] bincode::Error),
}

impl DatalogError {
    /// Shorthand for a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { msg: msg.into() }
    }

    /// Shorthand for a corruption error.
    pub fn corrupt(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol { msg: msg.into() }
    }
}
