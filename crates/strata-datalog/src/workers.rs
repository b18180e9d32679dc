//! Partitioned apply workers.
//!
//! Records arriving from replication links are applied by a fixed pool
//! of worker tasks. Each record is routed to a worker by a mix of its
//! class and labels ids, so all records of one series land on the same
//! worker and apply in arrival order, while different series apply
//! concurrently. Queues are bounded; a full queue surfaces as
//! [`DatalogError::Backpressure`] so the caller can slow its link down
//! instead of buffering without limit.

use crate::error::{DatalogError, DatalogResult};
use crate::manager::DatalogManager;
use std::sync::Arc;
use strata_model::Record;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Mix a series' class and labels ids into one 32-bit partitioning
/// value. Takes the low 16 bits of the class id and the high 16 bits
/// of the labels id, so series sharing a class still spread by labels.
pub fn partition_key(class_id: u64, labels_id: u64) -> u32 {
    (((class_id << 16) & 0xFFFF_0000) | ((labels_id >> 48) & 0xFFFF)) as u32
}

/// One record queued for application, with enough context to log
/// failures usefully.
#[derive(Debug)]
pub struct ApplyJob {
    /// Id of the consumer link that received the record.
    pub consumer: String,
    /// Position in the peer's log, for operator correlation.
    pub reference: String,
    /// The record to apply.
    pub record: Record,
}

/// Fixed pool of apply workers over bounded queues.
pub struct ApplyPool {
    senders: Vec<mpsc::Sender<ApplyJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl ApplyPool {
    /// Spawn `partitions` workers, each with its own queue of
    /// `queue_capacity` jobs, all applying through `manager`.
    pub fn new(manager: Arc<DatalogManager>, partitions: usize, queue_capacity: usize) -> Self {
        let mut senders = Vec::with_capacity(partitions);
        let mut handles = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::channel(queue_capacity);
            senders.push(tx);
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&manager),
                partition,
                rx,
            )));
        }
        Self { senders, handles }
    }

    /// Number of partitions.
    pub fn partitions(&self) -> usize {
        self.senders.len()
    }

    /// Partition index a record routes to.
    pub fn partition_of(&self, record: &Record) -> usize {
        (partition_key(record.class_id(), record.labels_id()) as usize) % self.senders.len()
    }

    /// Queue a job on its partition without waiting. A full partition
    /// queue returns [`DatalogError::Backpressure`] so the caller can
    /// slow down and retry.
    pub fn offer(&self, job: ApplyJob) -> DatalogResult<()> {
        let partition = self.partition_of(&job.record);
        match self.senders[partition].try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(DatalogError::Backpressure { partition })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DatalogError::Shutdown),
        }
    }

    /// Close the queues and wait for every worker to drain and exit.
    pub async fn shutdown(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "apply worker panicked");
            }
        }
    }
}

async fn worker_loop(
    manager: Arc<DatalogManager>,
    partition: usize,
    mut rx: mpsc::Receiver<ApplyJob>,
) {
    tracing::debug!(partition, "apply worker started");
    while let Some(job) = rx.recv().await {
        match manager.on_remote_record(&job.record).await {
            Ok(applied) => {
                tracing::trace!(
                    partition,
                    consumer = %job.consumer,
                    reference = %job.reference,
                    applied,
                    "processed replicated record"
                );
            }
            Err(e) => {
                // The record is lost for this link; peers retrying from
                // a stale offset is what recovers it.
                tracing::error!(
                    partition,
                    consumer = %job.consumer,
                    reference = %job.reference,
                    error = %e,
                    "failed to apply replicated record"
                );
            }
        }
    }
    tracing::debug!(partition, "apply worker stopped");
}
