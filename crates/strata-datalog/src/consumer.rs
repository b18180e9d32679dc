//! Consumer: pulls a peer feeder's log into the local instance.
//!
//! The consumer dials the feeder, resumes from its persisted offset
//! and hands every received record to the apply pool. The offset only
//! advances after a record is queued, and is persisted on a delay, so
//! a crash replays a short tail of records; applying is idempotent, so
//! at-least-once delivery is safe. Origins on the exclusion list are
//! skipped without applying but still advance the offset.

use crate::error::{DatalogError, DatalogResult};
use crate::offsets::{LogOffset, OffsetStore};
use crate::protocol::{read_frame, write_frame, Frame, ShardFilter, PROTOCOL_VERSION};
use crate::workers::{ApplyJob, ApplyPool};
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_model::decode_record;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Consumer tunables.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// This consumer's identity, sent in the hello and used as the
    /// offset key.
    pub consumer_id: String,
    /// Feeder host to dial.
    pub feeder_host: String,
    /// Feeder port to dial.
    pub feeder_port: u16,
    /// Optional shard subscription.
    pub shards: Option<ShardFilter>,
    /// Origins whose records are skipped without applying.
    pub excluded_origins: Vec<String>,
    /// File the resume offset is persisted in.
    pub offset_file: PathBuf,
    /// Minimum delay between offset flushes.
    pub offset_flush_interval: Duration,
    /// Base delay before re-dialing after a broken session; jittered.
    pub reconnect_delay: Duration,
    /// How long to wait before retrying when the apply pool pushes
    /// back.
    pub backpressure_delay: Duration,
}

impl ConsumerConfig {
    /// Config dialing `host:port` with the stock delays.
    pub fn new(
        consumer_id: impl Into<String>,
        feeder_host: impl Into<String>,
        feeder_port: u16,
        offset_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            feeder_host: feeder_host.into(),
            feeder_port,
            shards: None,
            excluded_origins: Vec::new(),
            offset_file: offset_file.into(),
            offset_flush_interval: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            backpressure_delay: Duration::from_millis(50),
        }
    }

    fn peer_key(&self) -> String {
        format!("{}:{}", self.feeder_host, self.feeder_port)
    }
}

/// Running consumer link.
pub struct Consumer {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Consumer {
    /// Spawn the reconnect loop. Records go to `pool`; the link keeps
    /// retrying until [`Consumer::shutdown`].
    pub fn start(config: ConsumerConfig, pool: Arc<ApplyPool>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run(config, pool, shutdown_rx));
        Self { shutdown_tx, task }
    }

    /// Stop the link; flushes the offset before returning.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "consumer task panicked");
        }
    }
}

async fn run(config: ConsumerConfig, pool: Arc<ApplyPool>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        match session(&config, &pool, &mut shutdown_rx).await {
            Ok(()) => break,
            Err(e) => {
                tracing::warn!(
                    consumer = %config.consumer_id,
                    peer = %config.peer_key(),
                    error = %e,
                    "replication session broke, reconnecting"
                );
            }
        }
        // Jitter so a fleet of consumers does not re-dial in lockstep.
        let base = config.reconnect_delay;
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=base);
        tokio::select! {
            _ = tokio::time::sleep(base + jitter) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
    tracing::info!(consumer = %config.consumer_id, "consumer stopped");
}

async fn session(
    config: &ConsumerConfig,
    pool: &ApplyPool,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> DatalogResult<()> {
    let mut offsets = OffsetStore::load(&config.offset_file)?;
    let peer = config.peer_key();
    let resume = offsets.get(&peer).cloned();

    let mut stream = TcpStream::connect((config.feeder_host.as_str(), config.feeder_port)).await?;
    write_frame(
        &mut stream,
        &Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            consumer_id: config.consumer_id.clone(),
            resume: resume.clone(),
            shards: config.shards.clone(),
        },
    )
    .await?;
    tracing::info!(
        consumer = %config.consumer_id,
        peer = %peer,
        resume = ?resume,
        "replication session established"
    );

    loop {
        if *shutdown_rx.borrow() {
            offsets.flush()?;
            return Ok(());
        }
        let frame = tokio::select! {
            frame = read_frame(&mut stream) => frame?,
            _ = shutdown_rx.changed() => continue,
        };
        let (segment, position, payload) = match frame {
            Some(Frame::Record {
                segment,
                position,
                payload,
            }) => (segment, position, payload),
            Some(Frame::Heartbeat { .. }) => {
                if offsets.maybe_flush(config.offset_flush_interval)? {
                    if let Some(offset) = offsets.get(&peer).cloned() {
                        write_frame(&mut stream, &Frame::Ack { offset }).await?;
                    }
                }
                continue;
            }
            Some(other) => {
                return Err(DatalogError::protocol(format!(
                    "unexpected frame from feeder: {other:?}"
                )))
            }
            None => return Err(DatalogError::protocol("feeder closed the connection")),
        };

        let record = decode_record(&payload)?;
        if config.excluded_origins.contains(&record.origin) {
            tracing::debug!(
                consumer = %config.consumer_id,
                origin = %record.origin,
                "skipping excluded origin"
            );
        } else {
            // Backpressure stalls the link rather than buffering; the
            // feeder's TCP window fills up behind us.
            loop {
                let job = ApplyJob {
                    consumer: config.consumer_id.clone(),
                    reference: format!("{segment}@{position}"),
                    record: record.clone(),
                };
                match pool.offer(job) {
                    Ok(()) => break,
                    Err(DatalogError::Backpressure { partition }) => {
                        tracing::trace!(partition, "apply queue full, waiting");
                        tokio::select! {
                            _ = tokio::time::sleep(config.backpressure_delay) => {}
                            _ = shutdown_rx.changed() => {}
                        }
                        if *shutdown_rx.borrow() {
                            offsets.flush()?;
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Queued (or intentionally skipped): the offset may advance.
        offsets.update(
            &peer,
            LogOffset {
                segment,
                position,
            },
        );
        if offsets.maybe_flush(config.offset_flush_interval)? {
            if let Some(offset) = offsets.get(&peer).cloned() {
                write_frame(&mut stream, &Frame::Ack { offset }).await?;
            }
        }
    }
}
