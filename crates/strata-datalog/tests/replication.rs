//! End-to-end replication tests: two full instances wired over real
//! TCP sockets, each with its own log directory and in-memory engines.

use std::sync::Arc;
use std::time::Duration;
use strata_datalog::{
    ApplyPool, Consumer, ConsumerConfig, Datalog, DatalogConfig, Feeder, FeederConfig,
    SegmentStore,
};
use strata_model::{decode_record, DataPoint, Record, SeriesMetadata, ValueBlock};
use strata_store::{MemoryDirectory, MemoryStore};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

struct Node {
    datalog: Datalog,
    store: Arc<MemoryStore>,
    directory: Arc<MemoryDirectory>,
    pool: Arc<ApplyPool>,
}

impl Node {
    async fn start(dir: &std::path::Path, id: &str) -> Node {
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(MemoryDirectory::new());
        let mut datalog = Datalog::open(
            DatalogConfig::new(dir, id),
            store.clone(),
            directory.clone(),
        )
        .await
        .unwrap();
        datalog.start().await.unwrap();
        let pool = Arc::new(ApplyPool::new(datalog.manager().clone(), 4, 256));
        Node {
            datalog,
            store,
            directory,
            pool,
        }
    }

    fn log(&self) -> Arc<SegmentStore> {
        self.datalog.log().clone()
    }

    async fn stop(mut self) {
        self.datalog.shutdown().await.unwrap();
    }
}

async fn serve(node: &Node) -> Feeder {
    let mut config = FeederConfig::new("127.0.0.1:0".parse().unwrap());
    config.heartbeat_interval = Duration::from_millis(50);
    Feeder::start(node.log(), config).await.unwrap()
}

fn link(node: &Node, id: &str, port: u16, offset_dir: &std::path::Path) -> Consumer {
    let mut config = ConsumerConfig::new(id, "127.0.0.1", port, offset_dir.join("offsets.json"));
    config.offset_flush_interval = Duration::from_millis(20);
    config.reconnect_delay = Duration::from_millis(20);
    Consumer::start(config, node.pool.clone())
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..300 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Count records across all segments of a stopped log, grouped by
/// origin.
async fn log_records(log: &SegmentStore) -> Vec<Record> {
    let mut records = Vec::new();
    for name in log.segments().await {
        let mut reader = log.open_reader(&name).await.unwrap();
        while let Some(entry) = reader.next_entry().await.unwrap() {
            records.push(decode_record(&entry.value).unwrap());
        }
    }
    records
}

fn cpu_series() -> SeriesMetadata {
    SeriesMetadata::new(11, 1 << 50, "cpu.user").with_label("host", "web-1")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_replication() {
    init_tracing();
    let a_dir = tempfile::tempdir().unwrap();
    let b_dir = tempfile::tempdir().unwrap();
    let a = Node::start(a_dir.path(), "node-a").await;
    let b = Node::start(b_dir.path(), "node-b").await;

    let feeder = serve(&a).await;
    let consumer = link(&b, "node-b", feeder.local_addr().port(), b_dir.path());

    let meta = cpu_series();
    a.datalog
        .manager()
        .on_register(Some(&meta))
        .await
        .unwrap();
    let values = ValueBlock::encode(0, &[DataPoint::new(0, 0.25), DataPoint::new(1000, 0.5), DataPoint::new(2000, 0.75)]);
    a.datalog
        .manager()
        .on_store(Some((&meta, &values)))
        .await
        .unwrap();

    let (store, directory) = (b.store.clone(), b.directory.clone());
    wait_for("node B to apply the update", move || {
        directory.len() == 1 && store.total_datapoints() == 3
    })
    .await;
    assert_eq!(
        b.directory.get(meta.class_id, meta.labels_id).unwrap().name,
        "cpu.user"
    );

    // A range delete propagates too.
    a.datalog
        .manager()
        .on_delete(None, &meta, 0, 1000)
        .await
        .unwrap();
    let store = b.store.clone();
    wait_for("node B to apply the delete", move || {
        store.total_datapoints() == 1
    })
    .await;
    assert_eq!(b.store.datapoints(meta.class_id, meta.labels_id).len(), 1);

    consumer.shutdown().await;
    feeder.shutdown().await;
    let b_log = b.log();
    a.stop().await;
    b.stop().await;

    // Node B re-appended everything under origin node-a.
    let records = log_records(&b_log).await;
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.origin == "node-a"));
    assert!(records.iter().all(|r| r.store_timestamp_ms > 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_chained_records_are_dropped_at_their_origin() {
    init_tracing();
    let a_dir = tempfile::tempdir().unwrap();
    let b_dir = tempfile::tempdir().unwrap();
    let a = Node::start(a_dir.path(), "node-a").await;
    let b = Node::start(b_dir.path(), "node-b").await;

    // A -> B and B -> A at the same time, a two-node cycle.
    let a_feeder = serve(&a).await;
    let b_feeder = serve(&b).await;
    let ab = link(&b, "node-b", a_feeder.local_addr().port(), b_dir.path());
    let ba = link(&a, "node-a", b_feeder.local_addr().port(), a_dir.path());

    let meta = cpu_series();
    let values = ValueBlock::encode(0, &[DataPoint::new(0, 1.0)]);
    a.datalog
        .manager()
        .on_store(Some((&meta, &values)))
        .await
        .unwrap();

    let store = b.store.clone();
    wait_for("node B to apply the update", move || {
        store.total_datapoints() == 1
    })
    .await;

    // B re-appends, its feeder streams the record back to A, and A
    // must drop it instead of applying and appending again. Give the
    // cycle time to spin if it were going to.
    tokio::time::sleep(Duration::from_millis(300)).await;

    ab.shutdown().await;
    ba.shutdown().await;
    a_feeder.shutdown().await;
    b_feeder.shutdown().await;
    let (a_log, b_log) = (a.log(), b.log());
    let a_points = a.store.total_datapoints();
    a.stop().await;
    b.stop().await;

    assert_eq!(a_points, 1);
    assert_eq!(log_records(&a_log).await.len(), 1);
    assert_eq!(log_records(&b_log).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_offset_redelivers_idempotently() {
    init_tracing();
    let a_dir = tempfile::tempdir().unwrap();
    let b_dir = tempfile::tempdir().unwrap();
    let a = Node::start(a_dir.path(), "node-a").await;
    let b = Node::start(b_dir.path(), "node-b").await;

    let meta = cpu_series();
    let values = ValueBlock::encode(0, &[DataPoint::new(0, 4.0)]);
    a.datalog
        .manager()
        .on_store(Some((&meta, &values)))
        .await
        .unwrap();

    let feeder = serve(&a).await;
    let consumer = link(&b, "node-b", feeder.local_addr().port(), b_dir.path());
    let store = b.store.clone();
    wait_for("first delivery", move || store.total_datapoints() == 1).await;
    consumer.shutdown().await;

    // A crash before the offset flush is simulated by throwing the
    // offset file away; the next session re-reads from the start.
    std::fs::remove_file(b_dir.path().join("offsets.json")).unwrap();
    let consumer = link(&b, "node-b", feeder.local_addr().port(), b_dir.path());

    let b_log_view = b.log();
    let mut redelivered = false;
    for _ in 0..300 {
        if log_records(&b_log_view).await.len() == 2 {
            redelivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(redelivered, "timed out waiting for redelivery");

    consumer.shutdown().await;
    feeder.shutdown().await;
    let b_log = b.log();
    let b_points = b.store.total_datapoints();
    a.stop().await;
    b.stop().await;

    // Delivered twice, applied idempotently, appended twice.
    assert_eq!(b_points, 1);
    let records = log_records(&b_log).await;
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.origin == "node-a" && r.class_id() == cpu_series().class_id));
}
