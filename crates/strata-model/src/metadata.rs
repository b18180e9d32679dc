//! Series metadata carried inside register/unregister/update/delete records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity and naming of one time series.
///
/// The `class_id`/`labels_id` pair is the 128-bit series identity the
/// whole subsystem keys on: segment keys, apply-pool partitioning and
/// shard filtering are all derived from it. The textual name and label
/// maps travel with every record so a receiving instance can register
/// the series without a directory lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    /// 64-bit hash of the series class name.
    pub class_id: u64,
    /// 64-bit hash of the sorted label set.
    pub labels_id: u64,
    /// Series class name.
    pub name: String,
    /// Identifying labels (part of the series identity).
    pub labels: BTreeMap<String, String>,
    /// Free-form attributes (mutable, not part of the identity).
    pub attributes: BTreeMap<String, String>,
}

impl SeriesMetadata {
    /// Create metadata with empty label and attribute maps.
    pub fn new(class_id: u64, labels_id: u64, name: impl Into<String>) -> Self {
        Self {
            class_id,
            labels_id,
            name: name.into(),
            labels: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an identifying label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a free-form attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// The `(class_id, labels_id)` pair identifying this series.
    pub fn series_ids(&self) -> (u64, u64) {
        (self.class_id, self.labels_id)
    }
}
