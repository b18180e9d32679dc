//! The trait seams between the replication core and the engines it drives.

use crate::error::StoreResult;
use async_trait::async_trait;
use strata_model::{SeriesMetadata, ValueBlock};

/// Opaque write authorization token.
///
/// Issued by the (out-of-scope) token layer; the replication core only
/// forwards it, and replayed deletions carry none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteToken(pub String);

/// Datapoint storage engine, as seen by the replication core.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Upsert the datapoints of a value block into the series.
    ///
    /// Storing the same block twice must yield the same final state as
    /// storing it once (timestamped upsert), which is what makes
    /// at-least-once replication delivery safe.
    async fn store(&self, metadata: &SeriesMetadata, values: &ValueBlock) -> StoreResult<()>;

    /// Delete all datapoints of the series in `[start_ms, end_ms]`.
    ///
    /// Returns the number of datapoints removed.
    async fn delete(
        &self,
        token: Option<&WriteToken>,
        metadata: &SeriesMetadata,
        start_ms: i64,
        end_ms: i64,
    ) -> StoreResult<u64>;
}

/// Series-metadata directory, as seen by the replication core.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Register a series. Registering an already-known series is a
    /// metadata refresh, not an error.
    async fn register(&self, metadata: &SeriesMetadata) -> StoreResult<()>;

    /// Unregister a series. Unregistering an unknown series is a no-op.
    async fn unregister(&self, metadata: &SeriesMetadata) -> StoreResult<()>;
}
