//! Durable replication offsets.
//!
//! A consumer remembers how far into each peer's log it has processed
//! as a `(segment name, byte position)` pair. Segment names sort by
//! creation time, so offsets order lexicographically by segment first
//! and position second. Offsets are persisted as JSON, written to a
//! temp file and renamed so a crash never leaves a half-written file.

use crate::error::{DatalogError, DatalogResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Position in a peer's log.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogOffset {
    /// Segment file name; names sort by creation order.
    pub segment: String,
    /// Entry-boundary byte position inside the segment.
    pub position: u64,
}

/// Offsets for every peer, persisted to one JSON file.
pub struct OffsetStore {
    path: PathBuf,
    offsets: HashMap<String, LogOffset>,
    dirty: bool,
    last_flush: Instant,
}

impl OffsetStore {
    /// Load offsets from `path`; a missing file starts empty.
    pub fn load(path: &Path) -> DatalogResult<Self> {
        let offsets = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                DatalogError::config(format!(
                    "offset file {} is unreadable: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            offsets,
            dirty: false,
            last_flush: Instant::now(),
        })
    }

    /// Last persisted-or-updated offset for a peer.
    pub fn get(&self, peer: &str) -> Option<&LogOffset> {
        self.offsets.get(peer)
    }

    /// Advance a peer's offset. Offsets only move forward; a stale
    /// update (equal or earlier than the stored one) is ignored.
    pub fn update(&mut self, peer: &str, offset: LogOffset) {
        match self.offsets.get(peer) {
            Some(current) if *current >= offset => return,
            _ => {}
        }
        self.offsets.insert(peer.to_string(), offset);
        self.dirty = true;
    }

    /// Flush if there are unpersisted updates and at least `interval`
    /// has passed since the last flush. Returns whether a flush
    /// happened.
    pub fn maybe_flush(&mut self, interval: Duration) -> DatalogResult<bool> {
        if !self.dirty || self.last_flush.elapsed() < interval {
            return Ok(false);
        }
        self.flush()?;
        Ok(true)
    }

    /// Persist unconditionally via temp file and rename.
    pub fn flush(&mut self) -> DatalogResult<()> {
        let tmp = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(&self.offsets)
            .map_err(|e| DatalogError::config(format!("offset serialization failed: {e}")))?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        self.last_flush = Instant::now();
        tracing::debug!(path = %self.path.display(), "flushed replication offsets");
        Ok(())
    }

    /// Whether updates are waiting to be persisted.
    pub fn dirty(&self) -> bool {
        self.dirty
    }
}
