//! Configuration surface of the datalog core.
//!
//! The config loader itself lives outside this subsystem; these are the
//! options it must recognize, with the defaults of the original
//! deployment. Validation failures here are fatal: the instance must
//! not serve traffic without a log directory or an instance id.

use crate::error::{DatalogError, DatalogResult};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum active-segment size before rotation: 128 MiB.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;
/// Default maximum active-segment age before rotation: 600 s.
pub const DEFAULT_MAX_SEGMENT_AGE: Duration = Duration::from_secs(600);
/// Default number of apply-pool partitions.
pub const DEFAULT_PARTITIONS: usize = 8;
/// Default apply-pool queue capacity per partition.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Configuration of the log segment store and datalog manager.
#[derive(Debug, Clone)]
pub struct DatalogConfig {
    /// Directory holding the log segment files. Must exist.
    pub dir: PathBuf,
    /// Identifier of this instance. Required; records created here are
    /// tagged with it and dropped if they ever round-trip back.
    pub instance_id: String,
    /// Active segment is rotated once its entry bytes exceed this.
    pub max_segment_size: u64,
    /// Active segment is rotated once it is older than this.
    pub max_segment_age: Duration,
    /// Sealed segments older than `purge_delay + 2 * max_segment_age`
    /// are deleted. Zero disables purging entirely.
    pub purge_delay: Duration,
    /// Sync every appended record to stable storage immediately. When
    /// false, durability barriers happen on explicit flush requests and
    /// on rotation.
    pub sync_every_record: bool,
    /// Compress entry values inside segment files.
    pub compress: bool,
    /// Number of apply-pool partitions (one worker per partition).
    pub partitions: usize,
    /// Capacity of each apply-pool queue before `offer` signals
    /// backpressure.
    pub queue_capacity: usize,
}

impl DatalogConfig {
    /// Config with original-deployment defaults for the given directory
    /// and instance id.
    pub fn new(dir: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            instance_id: instance_id.into(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_segment_age: DEFAULT_MAX_SEGMENT_AGE,
            purge_delay: Duration::ZERO,
            sync_every_record: false,
            compress: false,
            partitions: DEFAULT_PARTITIONS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Validate the configuration. All failures are fatal at startup.
    pub fn validate(&self) -> DatalogResult<()> {
        if self.instance_id.is_empty() {
            return Err(DatalogError::config("missing instance id"));
        }
        if self.instance_id.len() > u16::MAX as usize {
            return Err(DatalogError::config(
                "instance id exceeds the segment header limit",
            ));
        }
        if !self.dir.is_dir() {
            return Err(DatalogError::config(format!(
                "log directory {} is missing or not a directory",
                self.dir.display()
            )));
        }
        if self.partitions == 0 {
            return Err(DatalogError::config("partitions must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(DatalogError::config("queue capacity must be at least 1"));
        }
        if self.max_segment_size == 0 {
            return Err(DatalogError::config("max segment size must be non-zero"));
        }
        if self.max_segment_age.is_zero() {
            return Err(DatalogError::config("max segment age must be non-zero"));
        }
        Ok(())
    }

    /// The cadence at which purge eligibility is re-checked:
    /// `min(max_segment_age, purge_delay)`. `None` when purging is
    /// disabled.
    pub fn purge_check_interval(&self) -> Option<Duration> {
        if self.purge_delay.is_zero() {
            return None;
        }
        Some(self.max_segment_age.min(self.purge_delay))
    }

    /// Age beyond which a sealed segment is eligible for purge:
    /// `purge_delay + 2 * max_segment_age`. The doubled age term is a
    /// safety margin for segments still being read by slow consumers.
    /// `None` when purging is disabled.
    pub fn purge_cutoff_age(&self) -> Option<Duration> {
        if self.purge_delay.is_zero() {
            return None;
        }
        Some(self.purge_delay + 2 * self.max_segment_age)
    }
}
