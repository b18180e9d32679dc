//! Rotating append-only log built from segment files.
//!
//! One [`SegmentStore`] owns a log directory. It keeps exactly one
//! active [`SegmentWriter`] at a time, rotates it when it grows past
//! the configured size or age, and periodically purges sealed segments
//! older than the retention window. Readers open sealed segments (and
//! the active one, tolerating a torn tail) independently.

use crate::config::DatalogConfig;
use crate::error::{DatalogError, DatalogResult};
use crate::segment::{parse_segment_name, segment_path, SegmentReader, SegmentWriter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use strata_model::{encode_record, Record};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct StoreInner {
    writer: Option<SegmentWriter>,
    /// Sorted names of on-disk segments, active one last.
    segments: Vec<String>,
}

/// The rotating log. Cheap to share behind an [`Arc`]; all mutation of
/// the active writer goes through one async mutex so appends observe a
/// total order.
pub struct SegmentStore {
    config: DatalogConfig,
    inner: Mutex<StoreInner>,
    /// Notified after every successful append; feeders block on this
    /// when they are caught up with the active segment.
    appended: Notify,
    shutdown_tx: watch::Sender<bool>,
    last_purge_ms: AtomicI64,
}

impl SegmentStore {
    /// Open the log directory: validate the configuration and index the
    /// segments already on disk. No writer exists until
    /// [`SegmentStore::start`] runs, so appends fail with
    /// [`DatalogError::NotReady`] until then.
    pub async fn open(config: DatalogConfig) -> DatalogResult<Arc<Self>> {
        config.validate()?;

        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(&config.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if parse_segment_name(&name).is_some() {
                segments.push(name);
            }
        }
        segments.sort();
        tracing::info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            "opened datalog directory"
        );

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            config,
            inner: Mutex::new(StoreInner {
                writer: None,
                segments,
            }),
            appended: Notify::new(),
            shutdown_tx,
            last_purge_ms: AtomicI64::new(0),
        }))
    }

    /// Create the first active segment and spawn the maintenance task
    /// that drives age-based rotation and purging. Returns the task
    /// handle; it exits after [`SegmentStore::request_shutdown`].
    pub async fn start(self: &Arc<Self>) -> DatalogResult<JoinHandle<()>> {
        {
            let mut inner = self.inner.lock().await;
            if inner.writer.is_some() {
                return Err(DatalogError::config("datalog already started"));
            }
            let writer =
                SegmentWriter::create(&self.config.dir, &self.config.instance_id, now_ms()).await?;
            inner.segments.push(writer.name().to_string());
            inner.writer = Some(writer);
        }

        let store = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        Ok(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = store.maybe_rotate(now_ms()).await {
                            tracing::error!(error = %e, "segment rotation failed");
                        }
                        if let Err(e) = store.maybe_purge(now_ms()).await {
                            tracing::error!(error = %e, "segment purge failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = store.close_writer().await {
                tracing::error!(error = %e, "closing active segment failed");
            }
            tracing::info!("datalog maintenance task stopped");
        }))
    }

    /// Append a record, or force a durability barrier.
    ///
    /// `Some(record)` stamps the record's store timestamp, encodes it
    /// and appends it to the active segment; with `sync_every_record`
    /// the segment is synced before returning. `None` appends nothing
    /// and syncs the active segment instead (a no-op under
    /// `sync_every_record`, where every append already synced).
    pub async fn append(&self, record: Option<&mut Record>) -> DatalogResult<()> {
        let mut inner = self.inner.lock().await;
        let writer = inner.writer.as_mut().ok_or(DatalogError::NotReady)?;
        match record {
            Some(record) => {
                if record.store_timestamp_ms == 0 {
                    record.store_timestamp_ms = now_ms();
                }
                let key = record.key();
                let value = encode_record(record)?;
                writer.append(&key, &value, self.config.compress).await?;
                if self.config.sync_every_record {
                    writer.sync().await?;
                }
                drop(inner);
                self.appended.notify_waiters();
            }
            None => {
                if !self.config.sync_every_record {
                    writer.sync().await?;
                }
            }
        }
        Ok(())
    }

    /// Rotate the active segment if it exceeds the size or age limit.
    /// Called from the maintenance tick; public so tests can trigger a
    /// rotation deterministically.
    pub async fn maybe_rotate(&self, now_ms: i64) -> DatalogResult<bool> {
        let mut inner = self.inner.lock().await;
        let writer = match inner.writer.as_ref() {
            Some(w) => w,
            None => return Ok(false),
        };
        let over_size = writer.entry_bytes() >= self.config.max_segment_size;
        let over_age = now_ms.saturating_sub(writer.created_ms())
            >= self.config.max_segment_age.as_millis() as i64;
        if !over_size && !over_age {
            return Ok(false);
        }

        let old = inner.writer.take().ok_or(DatalogError::NotReady)?;
        let old_name = old.name().to_string();
        // Successor names must sort after the sealed one even when the
        // clock did not visibly advance.
        let created = now_ms.max(old.created_ms() + 1);
        if old.close().await? {
            inner.segments.retain(|s| s != &old_name);
        }
        let writer =
            SegmentWriter::create(&self.config.dir, &self.config.instance_id, created).await?;
        tracing::info!(
            previous = %old_name,
            next = %writer.name(),
            over_size,
            over_age,
            "rotated segment"
        );
        inner.segments.push(writer.name().to_string());
        inner.writer = Some(writer);
        drop(inner);
        // Wake feeders so they notice the previous segment is sealed.
        self.appended.notify_waiters();
        Ok(true)
    }

    /// Purge sealed segments that fell out of the retention window.
    /// Rate-limited to at most one scan per purge check interval.
    async fn maybe_purge(&self, now_ms: i64) -> DatalogResult<usize> {
        let interval = match self.config.purge_check_interval() {
            Some(i) => i.as_millis() as i64,
            None => return Ok(0),
        };
        let last = self.last_purge_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < interval {
            return Ok(0);
        }
        self.last_purge_ms.store(now_ms, Ordering::Relaxed);
        self.purge(now_ms).await
    }

    /// Delete every sealed segment older than the retention cutoff.
    /// The active segment is never deleted. Returns how many files
    /// were removed.
    pub async fn purge(&self, now_ms: i64) -> DatalogResult<usize> {
        let cutoff_age = match self.config.purge_cutoff_age() {
            Some(a) => a.as_millis() as i64,
            None => return Ok(0),
        };
        let cutoff = now_ms.saturating_sub(cutoff_age);

        let mut inner = self.inner.lock().await;
        let active = inner.writer.as_ref().map(|w| w.name().to_string());
        let mut removed = 0;
        let mut kept = Vec::with_capacity(inner.segments.len());
        for name in inner.segments.drain(..) {
            let created = parse_segment_name(&name).unwrap_or(i64::MAX);
            let is_active = active.as_deref() == Some(name.as_str());
            if !is_active && created < cutoff {
                match tokio::fs::remove_file(segment_path(&self.config.dir, &name)).await {
                    Ok(()) => {
                        tracing::info!(segment = %name, "purged expired segment");
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        removed += 1;
                    }
                    Err(e) => {
                        tracing::error!(segment = %name, error = %e, "purge failed");
                        kept.push(name);
                    }
                }
            } else {
                kept.push(name);
            }
        }
        inner.segments = kept;
        Ok(removed)
    }

    /// Sorted names of all on-disk segments, active one last.
    pub async fn segments(&self) -> Vec<String> {
        self.inner.lock().await.segments.clone()
    }

    /// Name of the active segment, if the store is started.
    pub async fn current_segment(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .writer
            .as_ref()
            .map(|w| w.name().to_string())
    }

    /// The segment that follows `name` in creation order.
    ///
    /// If `name` is no longer on disk (purged), returns the earliest
    /// segment sorting after it, letting a consumer resume past a
    /// retention gap. Returns `None` when nothing follows.
    pub async fn next_segment(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        match inner.segments.binary_search_by(|s| s.as_str().cmp(name)) {
            Ok(idx) => inner.segments.get(idx + 1).cloned(),
            Err(idx) => inner.segments.get(idx).cloned(),
        }
    }

    /// The segment preceding `name` in creation order, or `None`.
    pub async fn previous_segment(&self, name: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        match inner.segments.binary_search_by(|s| s.as_str().cmp(name)) {
            Ok(0) | Err(0) => None,
            Ok(idx) => inner.segments.get(idx - 1).cloned(),
            Err(idx) => inner.segments.get(idx - 1).cloned(),
        }
    }

    /// Earliest segment on disk, or `None` when the log is empty.
    pub async fn earliest_segment(&self) -> Option<String> {
        self.inner.lock().await.segments.first().cloned()
    }

    /// Open a reader over one segment by name.
    pub async fn open_reader(&self, name: &str) -> DatalogResult<SegmentReader> {
        SegmentReader::open(&segment_path(&self.config.dir, name)).await
    }

    /// Handle feeders wait on for "a record was appended".
    pub fn append_notify(&self) -> &Notify {
        &self.appended
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &DatalogConfig {
        &self.config
    }

    /// Signal the maintenance task to stop. It seals the active
    /// segment on the way out; await the handle from
    /// [`SegmentStore::start`] to know when that finished.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn close_writer(&self) -> DatalogResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(writer) = inner.writer.take() {
            let name = writer.name().to_string();
            if writer.close().await? {
                inner.segments.retain(|s| s != &name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_model::{decode_record, DataPoint, RecordKind, SeriesMetadata, ValueBlock};

    fn test_config(dir: &std::path::Path) -> DatalogConfig {
        DatalogConfig::new(dir, "node-a")
    }

    fn sample_record(origin: &str) -> Record {
        let meta = SeriesMetadata::new(1, 2, "cpu.user").with_label("host", "web-1");
        let values = ValueBlock::encode(1000, &[DataPoint::new(1000, 0.5)]);
        Record::update(origin, meta, values)
    }

    #[tokio::test]
    async fn test_append_before_start_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(test_config(dir.path())).await.unwrap();
        let mut record = sample_record("node-a");
        let err = store.append(Some(&mut record)).await.unwrap_err();
        assert!(matches!(err, DatalogError::NotReady));
    }

    #[tokio::test]
    async fn test_append_stamps_timestamp_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(test_config(dir.path())).await.unwrap();
        let handle = store.start().await.unwrap();

        let mut record = sample_record("node-a");
        assert_eq!(record.store_timestamp_ms, 0);
        store.append(Some(&mut record)).await.unwrap();
        assert!(record.store_timestamp_ms > 0);
        store.append(None).await.unwrap();

        let name = store.current_segment().await.unwrap();
        store.request_shutdown();
        handle.await.unwrap();

        let mut reader = store.open_reader(&name).await.unwrap();
        let entry = reader.next_entry().await.unwrap().unwrap();
        let decoded = decode_record(&entry.value).unwrap();
        assert_eq!(decoded.kind(), RecordKind::Update);
        assert_eq!(decoded.origin, "node-a");
        assert_eq!(decoded.store_timestamp_ms, record.store_timestamp_ms);
        assert!(reader.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_size_rotation_seals_and_opens_new() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_segment_size = 64;
        let store = SegmentStore::open(config).await.unwrap();
        let handle = store.start().await.unwrap();

        let first = store.current_segment().await.unwrap();
        let mut record = sample_record("node-a");
        store.append(Some(&mut record)).await.unwrap();
        assert!(store.maybe_rotate(now_ms()).await.unwrap());
        let second = store.current_segment().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(store.segments().await, vec![first, second]);

        store.request_shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_rotation_deletes_empty_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_segment_age = Duration::from_millis(1);
        let store = SegmentStore::open(config).await.unwrap();
        let handle = store.start().await.unwrap();

        let first = store.current_segment().await.unwrap();
        assert!(store.maybe_rotate(now_ms() + 10).await.unwrap());
        let segments = store.segments().await;
        assert_eq!(segments.len(), 1);
        assert_ne!(segments[0], first);
        assert!(!segment_path(dir.path(), &first).exists());

        store.request_shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_skips_active_and_recent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_segment_size = 1;
        config.purge_delay = Duration::from_secs(1);
        config.max_segment_age = Duration::from_secs(1);
        let store = SegmentStore::open(config).await.unwrap();
        let handle = store.start().await.unwrap();

        let mut record = sample_record("node-a");
        store.append(Some(&mut record)).await.unwrap();
        store.maybe_rotate(now_ms()).await.unwrap();
        assert_eq!(store.segments().await.len(), 2);

        // Within the window nothing goes.
        assert_eq!(store.purge(now_ms()).await.unwrap(), 0);
        // Far in the future the sealed segment goes, the active stays.
        let removed = store.purge(now_ms() + 60_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.segments().await.len(), 1);
        assert_eq!(
            store.segments().await[0],
            store.current_segment().await.unwrap()
        );

        store.request_shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_disabled_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(test_config(dir.path())).await.unwrap();
        let handle = store.start().await.unwrap();
        let mut record = sample_record("node-a");
        store.append(Some(&mut record)).await.unwrap();
        assert_eq!(store.purge(i64::MAX).await.unwrap(), 0);
        store.request_shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_segment_navigation() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_segment_size = 1;
        let store = SegmentStore::open(config).await.unwrap();
        let handle = store.start().await.unwrap();

        for _ in 0..2 {
            let mut record = sample_record("node-a");
            store.append(Some(&mut record)).await.unwrap();
            store.maybe_rotate(now_ms()).await.unwrap();
            // Keep filename timestamps strictly increasing.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let segments = store.segments().await;
        assert_eq!(segments.len(), 3);

        assert_eq!(
            store.next_segment(&segments[0]).await.as_deref(),
            Some(segments[1].as_str())
        );
        assert_eq!(store.next_segment(&segments[2]).await, None);
        assert_eq!(
            store.previous_segment(&segments[1]).await.as_deref(),
            Some(segments[0].as_str())
        );
        assert_eq!(store.previous_segment(&segments[0]).await, None);
        assert_eq!(
            store.earliest_segment().await.as_deref(),
            Some(segments[0].as_str())
        );

        store.request_shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_next_segment_after_purged_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(test_config(dir.path())).await.unwrap();
        let handle = store.start().await.unwrap();
        let current = store.current_segment().await.unwrap();

        // A name sorting before everything resolves to the earliest.
        assert_eq!(
            store.next_segment("0000000000000000.x").await.as_deref(),
            Some(current.as_str())
        );
        // A name sorting after everything resolves to nothing.
        assert_eq!(store.next_segment("ffffffffffffffff.x").await, None);

        store.request_shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_indexes_existing_segments() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SegmentStore::open(test_config(dir.path())).await.unwrap();
            let handle = store.start().await.unwrap();
            let mut record = sample_record("node-a");
            store.append(Some(&mut record)).await.unwrap();
            store.request_shutdown();
            handle.await.unwrap();
        }
        // A stray file must not be indexed as a segment.
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let store = SegmentStore::open(test_config(dir.path())).await.unwrap();
        assert_eq!(store.segments().await.len(), 1);
        assert_eq!(store.current_segment().await, None);
    }
}
