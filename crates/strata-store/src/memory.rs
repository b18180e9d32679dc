//! In-memory reference engines.
//!
//! Backed by ordinary maps under `parking_lot` locks; used by the
//! datalog replay/apply tests and suitable for small single-node runs.

use crate::client::{DirectoryClient, StoreClient, WriteToken};
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use strata_model::{DataPoint, SeriesMetadata, ValueBlock};

/// In-memory datapoint store: series identity to a timestamp-ordered
/// value map. Insertion is a timestamped upsert, so replaying the same
/// value block is idempotent.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<(u64, u64), BTreeMap<i64, f64>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Datapoints of one series in timestamp order.
    pub fn datapoints(&self, class_id: u64, labels_id: u64) -> Vec<DataPoint> {
        self.series
            .read()
            .get(&(class_id, labels_id))
            .map(|points| {
                points
                    .iter()
                    .map(|(&ts, &v)| DataPoint::new(ts, v))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Total datapoint count across all series.
    pub fn total_datapoints(&self) -> usize {
        self.series.read().values().map(|p| p.len()).sum()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn store(&self, metadata: &SeriesMetadata, values: &ValueBlock) -> StoreResult<()> {
        let points = values.decode().map_err(|e| StoreError::MalformedValues {
            reason: e.to_string(),
        })?;
        let mut series = self.series.write();
        let entry = series.entry(metadata.series_ids()).or_default();
        for p in points {
            entry.insert(p.timestamp_ms, p.value);
        }
        Ok(())
    }

    async fn delete(
        &self,
        _token: Option<&WriteToken>,
        metadata: &SeriesMetadata,
        start_ms: i64,
        end_ms: i64,
    ) -> StoreResult<u64> {
        let mut series = self.series.write();
        let Some(points) = series.get_mut(&metadata.series_ids()) else {
            return Ok(0);
        };
        let doomed: Vec<i64> = points
            .range(start_ms..=end_ms)
            .map(|(&ts, _)| ts)
            .collect();
        for ts in &doomed {
            points.remove(ts);
        }
        Ok(doomed.len() as u64)
    }
}

/// In-memory series directory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: RwLock<HashMap<(u64, u64), SeriesMetadata>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a registered series.
    pub fn get(&self, class_id: u64, labels_id: u64) -> Option<SeriesMetadata> {
        self.entries.read().get(&(class_id, labels_id)).cloned()
    }

    /// Number of registered series.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if no series is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DirectoryClient for MemoryDirectory {
    async fn register(&self, metadata: &SeriesMetadata) -> StoreResult<()> {
        self.entries
            .write()
            .insert(metadata.series_ids(), metadata.clone());
        Ok(())
    }

    async fn unregister(&self, metadata: &SeriesMetadata) -> StoreResult<()> {
        self.entries.write().remove(&metadata.series_ids());
        Ok(())
    }
}
