//! Datalog manager: the write-path hook that records every mutation in
//! the log, and the replication entry point that applies records
//! received from peers.
//!
//! Local mutations go through the `on_*` operations, which append a
//! record tagged with this instance's id. Records arriving over a
//! replication link go through [`DatalogManager::on_remote_record`],
//! which drops records that originated here (loop avoidance), applies
//! the rest to the local store, and re-appends them so downstream
//! consumers see them too.

use crate::config::DatalogConfig;
use crate::error::DatalogResult;
use crate::log::SegmentStore;
use std::sync::Arc;
use strata_model::{decode_record, Record, RecordBody, SeriesMetadata, ValueBlock};
use strata_store::{DirectoryClient, StoreClient, WriteToken};
use tokio::task::JoinHandle;

/// Core datalog logic shared by the local write path, the replay pass
/// and the apply workers.
pub struct DatalogManager {
    store_client: Arc<dyn StoreClient>,
    directory: Arc<dyn DirectoryClient>,
    log: Arc<SegmentStore>,
    instance_id: String,
}

impl DatalogManager {
    /// Build a manager over an opened log and the local store clients.
    pub fn new(
        log: Arc<SegmentStore>,
        store_client: Arc<dyn StoreClient>,
        directory: Arc<dyn DirectoryClient>,
    ) -> Self {
        let instance_id = log.config().instance_id.clone();
        Self {
            store_client,
            directory,
            log,
            instance_id,
        }
    }

    /// This instance's origin id, stamped into every record it emits.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The log this manager appends to.
    pub fn log(&self) -> &Arc<SegmentStore> {
        &self.log
    }

    /// Record a series registration. `None` is a flush barrier: no
    /// record is appended and the log is durably synced instead.
    pub async fn on_register(&self, metadata: Option<&SeriesMetadata>) -> DatalogResult<()> {
        match metadata {
            Some(metadata) => {
                let mut record = Record::register(&self.instance_id, metadata.clone());
                self.log.append(Some(&mut record)).await
            }
            None => self.log.append(None).await,
        }
    }

    /// Record a series unregistration, or flush on `None`.
    pub async fn on_unregister(&self, metadata: Option<&SeriesMetadata>) -> DatalogResult<()> {
        match metadata {
            Some(metadata) => {
                let mut record = Record::unregister(&self.instance_id, metadata.clone());
                self.log.append(Some(&mut record)).await
            }
            None => self.log.append(None).await,
        }
    }

    /// Record a batch of data points for one series, or flush on
    /// `None`.
    pub async fn on_store(
        &self,
        update: Option<(&SeriesMetadata, &ValueBlock)>,
    ) -> DatalogResult<()> {
        match update {
            Some((metadata, values)) => {
                let mut record =
                    Record::update(&self.instance_id, metadata.clone(), values.clone());
                self.log.append(Some(&mut record)).await
            }
            None => self.log.append(None).await,
        }
    }

    /// Record a range deletion. Deletions always append; the token is
    /// not persisted, it only authorized the local call.
    pub async fn on_delete(
        &self,
        _token: Option<&WriteToken>,
        metadata: &SeriesMetadata,
        start_ms: i64,
        end_ms: i64,
    ) -> DatalogResult<()> {
        let mut record = Record::delete(&self.instance_id, metadata.clone(), start_ms, end_ms);
        self.log.append(Some(&mut record)).await
    }

    /// Handle a record received over a replication link.
    ///
    /// Returns `Ok(false)` when the record originated on this instance
    /// and was dropped, `Ok(true)` when it was applied and re-appended.
    /// If applying fails the record is not re-appended; the error
    /// propagates so the worker can surface it.
    pub async fn on_remote_record(&self, record: &Record) -> DatalogResult<bool> {
        if record.origin == self.instance_id {
            tracing::debug!(
                origin = %record.origin,
                class_id = record.class_id(),
                labels_id = record.labels_id(),
                "dropping own record returning over replication"
            );
            return Ok(false);
        }
        self.apply(record).await?;
        let mut forwarded = record.clone();
        // Restamped on append so the local log orders by local time.
        forwarded.store_timestamp_ms = 0;
        self.log.append(Some(&mut forwarded)).await?;
        Ok(true)
    }

    /// Apply one record's mutation to the local store and directory.
    pub async fn apply(&self, record: &Record) -> DatalogResult<()> {
        match &record.body {
            RecordBody::Register { metadata } => {
                self.directory.register(metadata).await?;
            }
            RecordBody::Unregister { metadata } => {
                self.directory.unregister(metadata).await?;
            }
            RecordBody::Update { metadata, values } => {
                self.store_client.store(metadata, values).await?;
            }
            RecordBody::Delete {
                metadata,
                start_ms,
                end_ms,
            } => {
                self.store_client
                    .delete(None, metadata, *start_ms, *end_ms)
                    .await?;
            }
        }
        Ok(())
    }

    /// Replay the whole log into the local store, oldest segment first.
    ///
    /// Every record is applied, including records this instance
    /// originated; replay rebuilds local state, it does not replicate,
    /// so nothing is re-appended. Corruption in the middle of a
    /// segment aborts; a torn trailing entry is logged and skipped.
    /// Returns the number of records applied.
    pub async fn replay(&self) -> DatalogResult<u64> {
        self.log.purge(crate::log::now_ms()).await?;
        let mut applied = 0u64;
        for name in self.log.segments().await {
            let mut reader = self.log.open_reader(&name).await?;
            while let Some(entry) = reader.next_entry().await? {
                let record = decode_record(&entry.value)?;
                self.apply(&record).await?;
                applied += 1;
            }
            if reader.partial_tail() {
                tracing::warn!(segment = %name, "ignoring torn trailing entry during replay");
            }
        }
        tracing::info!(records = applied, "log replay complete");
        Ok(applied)
    }
}

/// Handle tying an opened log, its manager and its maintenance task
/// together for a running instance.
pub struct Datalog {
    manager: Arc<DatalogManager>,
    maintenance: Option<JoinHandle<()>>,
}

impl Datalog {
    /// Open the log directory and build the manager. Nothing is
    /// replayed and no segment is writable until [`Datalog::start`].
    pub async fn open(
        config: DatalogConfig,
        store_client: Arc<dyn StoreClient>,
        directory: Arc<dyn DirectoryClient>,
    ) -> DatalogResult<Self> {
        let log = SegmentStore::open(config).await?;
        let manager = Arc::new(DatalogManager::new(log, store_client, directory));
        Ok(Self {
            manager,
            maintenance: None,
        })
    }

    /// Replay existing segments into the local store, then open the
    /// active segment and start background maintenance. Returns the
    /// number of records replayed.
    pub async fn start(&mut self) -> DatalogResult<u64> {
        let replayed = self.manager.replay().await?;
        let handle = self.manager.log().start().await?;
        self.maintenance = Some(handle);
        Ok(replayed)
    }

    /// The shared manager, for wiring into apply workers and feeders.
    pub fn manager(&self) -> &Arc<DatalogManager> {
        &self.manager
    }

    /// The underlying log.
    pub fn log(&self) -> &Arc<SegmentStore> {
        self.manager.log()
    }

    /// Seal the active segment and stop background maintenance.
    pub async fn shutdown(&mut self) -> DatalogResult<()> {
        self.manager.log().request_shutdown();
        if let Some(handle) = self.maintenance.take() {
            handle
                .await
                .map_err(|e| crate::error::DatalogError::config(format!("join error: {e}")))?;
        }
        Ok(())
    }
}
