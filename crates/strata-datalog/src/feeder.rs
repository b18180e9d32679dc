//! Feeder: serves the local log to downstream consumers.
//!
//! The feeder listens on TCP. Each consumer session starts with a
//! [`Frame::Hello`] naming a resume offset and an optional shard
//! subscription, then the feeder streams log entries in order, segment
//! by segment, switching to heartbeats while it is caught up with the
//! active segment. Acks flow back on the same connection and are kept
//! per consumer for observability; delivery progress itself is owned
//! by the consumer's offset file.

use crate::error::{DatalogError, DatalogResult};
use crate::log::SegmentStore;
use crate::offsets::LogOffset;
use crate::protocol::{read_frame, write_frame, Frame, ShardFilter, PROTOCOL_VERSION};
use crate::segment::{SegmentEntry, SegmentReader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Feeder tunables.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    /// Address to listen on; port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Heartbeat cadence while caught up with the active segment.
    pub heartbeat_interval: Duration,
}

impl FeederConfig {
    /// Config listening on `bind_addr` with a one second heartbeat.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            heartbeat_interval: Duration::from_secs(1),
        }
    }
}

/// Running feeder. Dropping it does not stop the accept loop; call
/// [`Feeder::shutdown`].
pub struct Feeder {
    local_addr: SocketAddr,
    acked: Arc<Mutex<HashMap<String, LogOffset>>>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Feeder {
    /// Bind the listener and start accepting consumer sessions.
    pub async fn start(log: Arc<SegmentStore>, config: FeederConfig) -> DatalogResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "feeder listening");

        let acked: Arc<Mutex<HashMap<String, LogOffset>>> = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_log = Arc::clone(&log);
        let accept_acked = Arc::clone(&acked);
        let accept_config = config.clone();
        let mut accept_shutdown = shutdown_rx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::error!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        let log = Arc::clone(&accept_log);
                        let acked = Arc::clone(&accept_acked);
                        let config = accept_config.clone();
                        let shutdown = shutdown_rx.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                serve_consumer(log, config, stream, peer, acked, shutdown).await
                            {
                                tracing::warn!(peer = %peer, error = %e, "consumer session ended");
                            }
                        });
                    }
                    _ = accept_shutdown.changed() => {
                        if *accept_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("feeder accept loop stopped");
        });

        Ok(Self {
            local_addr,
            acked,
            shutdown_tx,
            accept_task,
        })
    }

    /// Address the feeder actually listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Last acked offset per consumer id.
    pub fn acked_offsets(&self) -> HashMap<String, LogOffset> {
        self.acked.lock().clone()
    }

    /// Stop accepting and signal live sessions to end.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.accept_task.await {
            tracing::error!(error = %e, "feeder accept task panicked");
        }
    }
}

async fn serve_consumer(
    log: Arc<SegmentStore>,
    config: FeederConfig,
    stream: TcpStream,
    peer: SocketAddr,
    acked: Arc<Mutex<HashMap<String, LogOffset>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DatalogResult<()> {
    let (mut read_half, mut write_half) = stream.into_split();

    let (consumer_id, resume, shards) = match read_frame(&mut read_half).await? {
        Some(Frame::Hello {
            protocol_version,
            consumer_id,
            resume,
            shards,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(DatalogError::protocol(format!(
                    "consumer speaks protocol {protocol_version}, expected {PROTOCOL_VERSION}"
                )));
            }
            (consumer_id, resume, shards)
        }
        Some(other) => {
            return Err(DatalogError::protocol(format!(
                "expected hello, got {other:?}"
            )))
        }
        None => return Ok(()),
    };
    tracing::info!(
        peer = %peer,
        consumer = %consumer_id,
        resume = ?resume,
        sharded = shards.is_some(),
        "consumer session established"
    );

    // Acks arrive on the read half while records stream on the write
    // half.
    let ack_consumer = consumer_id.clone();
    let ack_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(Frame::Ack { offset })) => {
                    acked.lock().insert(ack_consumer.clone(), offset);
                }
                Ok(Some(other)) => {
                    tracing::warn!(consumer = %ack_consumer, frame = ?other, "unexpected frame");
                }
                Ok(None) | Err(_) => break,
            }
        }
    });

    let result = stream_entries(
        &log,
        &config,
        &consumer_id,
        resume,
        shards,
        &mut write_half,
        &mut shutdown_rx,
    )
    .await;
    ack_task.abort();
    result
}

async fn stream_entries(
    log: &Arc<SegmentStore>,
    config: &FeederConfig,
    consumer_id: &str,
    resume: Option<LogOffset>,
    shards: Option<ShardFilter>,
    write_half: &mut OwnedWriteHalf,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> DatalogResult<()> {
    // Resolve where to start. A purged resume segment falls forward to
    // the earliest surviving segment after it.
    let (mut segment, mut reader) = loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        match resolve_start(log, resume.as_ref()).await? {
            Some(pair) => break pair,
            None => {
                idle(log, config, write_half, shutdown_rx).await?;
            }
        }
    };

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        match reader.next_entry().await? {
            Some(entry) => {
                send_entry(write_half, &segment, &entry, shards.as_ref(), consumer_id).await?;
            }
            None => {
                let active = log.current_segment().await;
                if active.as_deref() == Some(segment.as_str()) {
                    // Caught up with the active segment. Register for
                    // the append notification before the re-check so a
                    // record landing in between is not missed.
                    let notified = log.append_notify().notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    if let Some(entry) = reader.next_entry().await? {
                        send_entry(write_half, &segment, &entry, shards.as_ref(), consumer_id)
                            .await?;
                        continue;
                    }
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(config.heartbeat_interval) => {
                            write_frame(
                                write_half,
                                &Frame::Heartbeat { current_segment: active },
                            )
                            .await?;
                        }
                        _ = shutdown_rx.changed() => {}
                    }
                } else {
                    // Sealed (or deleted-empty) segment exhausted.
                    match log.next_segment(&segment).await {
                        Some(next) => {
                            reader = log.open_reader(&next).await?;
                            segment = next;
                        }
                        None => {
                            idle(log, config, write_half, shutdown_rx).await?;
                        }
                    }
                }
            }
        }
    }
}

async fn resolve_start(
    log: &Arc<SegmentStore>,
    resume: Option<&LogOffset>,
) -> DatalogResult<Option<(String, SegmentReader)>> {
    match resume {
        Some(offset) => {
            let segments = log.segments().await;
            if segments.iter().any(|s| *s == offset.segment) {
                let mut reader = log.open_reader(&offset.segment).await?;
                reader.seek(offset.position).await?;
                return Ok(Some((offset.segment.clone(), reader)));
            }
            match log.next_segment(&offset.segment).await {
                Some(next) => {
                    tracing::warn!(
                        resume = %offset.segment,
                        next = %next,
                        "resume segment no longer on disk, skipping forward"
                    );
                    let reader = log.open_reader(&next).await?;
                    Ok(Some((next, reader)))
                }
                // Consumer is ahead of everything on disk; wait for
                // new segments.
                None => Ok(None),
            }
        }
        None => match log.earliest_segment().await {
            Some(name) => {
                let reader = log.open_reader(&name).await?;
                Ok(Some((name, reader)))
            }
            None => Ok(None),
        },
    }
}

async fn send_entry(
    write_half: &mut OwnedWriteHalf,
    segment: &str,
    entry: &SegmentEntry,
    shards: Option<&ShardFilter>,
    consumer_id: &str,
) -> DatalogResult<()> {
    if let Some(filter) = shards {
        if !filter.matches(entry.class_id(), entry.labels_id()) {
            return Ok(());
        }
    }
    tracing::trace!(
        consumer = %consumer_id,
        segment = %segment,
        position = entry.next_pos,
        "streaming record"
    );
    write_frame(
        write_half,
        &Frame::Record {
            segment: segment.to_string(),
            position: entry.next_pos,
            payload: entry.value.clone(),
        },
    )
    .await
}

async fn idle(
    log: &Arc<SegmentStore>,
    config: &FeederConfig,
    write_half: &mut OwnedWriteHalf,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> DatalogResult<()> {
    let notified = log.append_notify().notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    tokio::select! {
        _ = &mut notified => {}
        _ = tokio::time::sleep(config.heartbeat_interval) => {
            let current = log.current_segment().await;
            write_frame(write_half, &Frame::Heartbeat { current_segment: current }).await?;
        }
        _ = shutdown_rx.changed() => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatalogConfig;
    use strata_model::{decode_record, DataPoint, Record, SeriesMetadata, ValueBlock};

    async fn started_store(dir: &std::path::Path) -> (Arc<SegmentStore>, JoinHandle<()>) {
        let store = SegmentStore::open(DatalogConfig::new(dir, "node-a"))
            .await
            .unwrap();
        let handle = store.start().await.unwrap();
        (store, handle)
    }

    fn feeder_config() -> FeederConfig {
        let mut config = FeederConfig::new("127.0.0.1:0".parse().unwrap());
        config.heartbeat_interval = Duration::from_millis(50);
        config
    }

    async fn dial(feeder: &Feeder, hello: Frame) -> TcpStream {
        let mut stream = TcpStream::connect(feeder.local_addr()).await.unwrap();
        write_frame(&mut stream, &hello).await.unwrap();
        stream
    }

    fn hello(consumer: &str, resume: Option<LogOffset>) -> Frame {
        Frame::Hello {
            protocol_version: PROTOCOL_VERSION,
            consumer_id: consumer.to_string(),
            resume,
            shards: None,
        }
    }

    async fn next_record(stream: &mut TcpStream) -> (String, u64, Record) {
        loop {
            match read_frame(stream).await.unwrap().unwrap() {
                Frame::Record {
                    segment,
                    position,
                    payload,
                } => return (segment, position, decode_record(&payload).unwrap()),
                Frame::Heartbeat { .. } => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    fn sample(origin: &str, class: u64, value: f64) -> Record {
        Record::update(
            origin,
            SeriesMetadata::new(class, class * 7, "cpu.user"),
            ValueBlock::encode(0, &[DataPoint::new(0, value)]),
        )
    }

    #[tokio::test]
    async fn test_streams_existing_and_live_records() {
        let dir = tempfile::tempdir().unwrap();
        let (store, maintenance) = started_store(dir.path()).await;
        let mut r1 = sample("node-a", 1, 1.0);
        store.append(Some(&mut r1)).await.unwrap();

        let feeder = Feeder::start(store.clone(), feeder_config()).await.unwrap();
        let mut stream = dial(&feeder, hello("node-b", None)).await;

        let (_, _, got) = next_record(&mut stream).await;
        assert_eq!(got.class_id(), 1);

        // A record appended after the session opened arrives too.
        let mut r2 = sample("node-a", 2, 2.0);
        store.append(Some(&mut r2)).await.unwrap();
        let (segment, position, got) = next_record(&mut stream).await;
        assert_eq!(got.class_id(), 2);
        assert_eq!(segment, store.current_segment().await.unwrap());
        assert!(position > 0);

        feeder.shutdown().await;
        store.request_shutdown();
        maintenance.await.unwrap();
    }

    #[tokio::test]
    async fn test_resume_skips_processed_records() {
        let dir = tempfile::tempdir().unwrap();
        let (store, maintenance) = started_store(dir.path()).await;
        let mut r1 = sample("node-a", 1, 1.0);
        store.append(Some(&mut r1)).await.unwrap();
        let mut r2 = sample("node-a", 2, 2.0);
        store.append(Some(&mut r2)).await.unwrap();

        let feeder = Feeder::start(store.clone(), feeder_config()).await.unwrap();

        // First session: learn the offset after record one.
        let mut stream = dial(&feeder, hello("node-b", None)).await;
        let (segment, position, _) = next_record(&mut stream).await;
        drop(stream);

        // Second session resumes there and sees only record two.
        let resume = LogOffset { segment, position };
        let mut stream = dial(&feeder, hello("node-b", Some(resume))).await;
        let (_, _, got) = next_record(&mut stream).await;
        assert_eq!(got.class_id(), 2);

        feeder.shutdown().await;
        store.request_shutdown();
        maintenance.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeats_while_caught_up() {
        let dir = tempfile::tempdir().unwrap();
        let (store, maintenance) = started_store(dir.path()).await;
        let feeder = Feeder::start(store.clone(), feeder_config()).await.unwrap();
        let mut stream = dial(&feeder, hello("node-b", None)).await;

        match read_frame(&mut stream).await.unwrap().unwrap() {
            Frame::Heartbeat { .. } => {}
            other => panic!("unexpected frame {other:?}"),
        }

        feeder.shutdown().await;
        store.request_shutdown();
        maintenance.await.unwrap();
    }

    #[tokio::test]
    async fn test_shard_filter_limits_stream() {
        let dir = tempfile::tempdir().unwrap();
        let (store, maintenance) = started_store(dir.path()).await;
        // With two shards, the mixed key's low bit decides: class 2
        // with small labels lands in shard 0, labels with bit 48 set
        // land in shard 1.
        let mut in_shard = sample("node-a", 2, 1.0); // key 0x0002_0000, % 2 == 0
        let mut out_shard = Record::update(
            "node-a",
            SeriesMetadata::new(2, 1 << 48, "cpu.user"), // key 0x0002_0001, % 2 == 1
            ValueBlock::encode(0, &[DataPoint::new(0, 2.0)]),
        );
        store.append(Some(&mut in_shard)).await.unwrap();
        store.append(Some(&mut out_shard)).await.unwrap();
        let mut sentinel = sample("node-a", 4, 3.0); // 0x0004_0000, % 2 == 0
        store.append(Some(&mut sentinel)).await.unwrap();

        let feeder = Feeder::start(store.clone(), feeder_config()).await.unwrap();
        let mut stream = dial(
            &feeder,
            Frame::Hello {
                protocol_version: PROTOCOL_VERSION,
                consumer_id: "node-b".into(),
                resume: None,
                shards: Some(ShardFilter {
                    num_shards: 2,
                    shards: vec![0],
                }),
            },
        )
        .await;

        let (_, _, first) = next_record(&mut stream).await;
        assert_eq!(first.labels_id(), 14);
        let (_, _, second) = next_record(&mut stream).await;
        assert_eq!(second.class_id(), 4);

        feeder.shutdown().await;
        store.request_shutdown();
        maintenance.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_protocol_version_drops_session() {
        let dir = tempfile::tempdir().unwrap();
        let (store, maintenance) = started_store(dir.path()).await;
        let feeder = Feeder::start(store.clone(), feeder_config()).await.unwrap();

        let mut stream = dial(
            &feeder,
            Frame::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                consumer_id: "node-b".into(),
                resume: None,
                shards: None,
            },
        )
        .await;
        assert!(read_frame(&mut stream).await.unwrap().is_none());

        feeder.shutdown().await;
        store.request_shutdown();
        maintenance.await.unwrap();
    }
}
