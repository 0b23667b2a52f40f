mod common;

use common::{bz2, eventually, item_failure, weather_file, RecordingStore, ScriptedRemote};
use forecast_ingest::config::{IndexerConfig, WorkerConfig};
use forecast_ingest::indexer::BulkIndexer;
use forecast_ingest::parser::WeatherParser;
use forecast_ingest::queue::memory::DeliveryRecord;
use forecast_ingest::queue::{MemoryQueue, TaskHandler, TaskQueue};
use forecast_ingest::worker::{ProcessError, Worker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const ROW_1: &str = "MSWRMOS;mix  2015090218;62830;2015-09-03;02:00;00100;     95;95;148;228";
const ROW_2: &str = "MSWRMOS;mix  2015090218;62830;2015-09-03;02:00;00200;     96;96;149;229";
const OBS_ROW: &str = "MSWRMOS;mix  2015090218;62830;2015-09-03;02:00;OBS;90;90;140;220";

struct Harness {
    remote: ScriptedRemote,
    queue: MemoryQueue,
    store: RecordingStore,
    worker: Arc<Worker>,
}

fn harness(store: RecordingStore, config: WorkerConfig) -> Harness {
    let remote = ScriptedRemote::default();
    let queue = MemoryQueue::new();
    let (indexer, _task) = BulkIndexer::spawn(
        Arc::new(store.clone()),
        &IndexerConfig {
            backoff_initial_ms: 1,
            ..IndexerConfig::default()
        },
    );
    let worker = Arc::new(Worker::new(
        Arc::new(remote.clone()),
        Arc::new(queue.clone()),
        indexer,
        Arc::new(WeatherParser),
        "/mos",
        config,
    ));
    Harness {
        remote,
        queue,
        store,
        worker,
    }
}

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        register_retry_ms: 10,
        ..WorkerConfig::default()
    }
}

#[tokio::test]
async fn process_indexes_forecast_rows_in_order() {
    let h = harness(RecordingStore::default(), fast_config());
    h.remote
        .put_file("/mos/f.bz2", bz2(&weather_file(&[ROW_1, OBS_ROW, ROW_2])))
        .await;

    let count = h.worker.process("f.bz2").await.unwrap();

    assert_eq!(count, 2);
    assert_eq!(
        h.store.indexed_ids().await,
        vec!["62830|1441249200", "62830|1441252800"]
    );
    let calls = h.store.calls().await;
    assert_eq!(calls[0][0].index, "weather");
    assert_eq!(calls[0][0].doc_type, "forecast");
    assert!(calls[0][0].source.starts_with(r#"{"forecastdatetime":1441249200,"project":"MSWRMOS""#));
}

#[tokio::test]
async fn reprocessing_a_file_yields_the_same_ids() {
    let h = harness(RecordingStore::default(), fast_config());
    h.remote
        .put_file("/mos/f.bz2", bz2(&weather_file(&[ROW_1, ROW_2])))
        .await;

    h.worker.process("f.bz2").await.unwrap();
    h.worker.process("f.bz2").await.unwrap();

    let ids = h.store.indexed_ids().await;
    assert_eq!(ids.len(), 4);
    assert_eq!(ids[..2], ids[2..]);
}

#[tokio::test]
async fn failed_fetch_is_requeued_and_redelivered() {
    let h = harness(RecordingStore::default(), fast_config());
    h.remote
        .put_file("/mos/f.bz2", bz2(&weather_file(&[ROW_1])))
        .await;
    h.remote.fail_fetches(1).await;
    h.queue.publish("f.bz2").await.unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&h.worker).run(rx));

    let q = h.queue.clone();
    eventually(|| {
        let q = q.clone();
        async move { q.deliveries().await.len() == 2 }
    })
    .await;
    tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(
        h.queue.deliveries().await,
        vec![
            DeliveryRecord { token: "f.bz2".into(), acked: false },
            DeliveryRecord { token: "f.bz2".into(), acked: true },
        ]
    );
    assert_eq!(h.remote.fetches().await, vec!["/mos/f.bz2", "/mos/f.bz2"]);
    assert_eq!(h.store.indexed_ids().await, vec!["62830|1441249200"]);
}

#[tokio::test]
async fn missing_file_is_rejected() {
    let h = harness(RecordingStore::default(), fast_config());
    assert!(!h.worker.handle("absent.bz2").await);
    assert!(matches!(
        h.worker.process("absent.bz2").await,
        Err(ProcessError::Remote(_))
    ));
}

#[tokio::test]
async fn every_delivery_is_settled_once() {
    let h = harness(RecordingStore::default(), fast_config());
    for name in ["a.bz2", "b.bz2", "c.bz2"] {
        h.remote
            .put_file(&format!("/mos/{}", name), bz2(&weather_file(&[ROW_1])))
            .await;
        h.queue.publish(name).await.unwrap();
    }
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&h.worker).run(rx));

    let q = h.queue.clone();
    eventually(|| {
        let q = q.clone();
        async move { q.deliveries().await.len() == 3 }
    })
    .await;
    tx.send(true).unwrap();
    task.await.unwrap();

    let deliveries = h.queue.deliveries().await;
    assert!(deliveries.iter().all(|d| d.acked));
    assert_eq!(deliveries.len(), h.remote.fetches().await.len());
    assert!(h.queue.pending().await.is_empty());
}

#[tokio::test]
async fn corrupt_file_requeues_forever_without_limit() {
    let h = harness(RecordingStore::default(), fast_config());
    h.remote.put_file("/mos/bad.bz2", b"not bzip2".to_vec()).await;

    for _ in 0..5 {
        assert!(!h.worker.handle("bad.bz2").await);
    }
    assert!(h.queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn corrupt_file_is_dead_lettered_after_max_deliveries() {
    let h = harness(
        RecordingStore::default(),
        WorkerConfig {
            max_deliveries: Some(3),
            ..fast_config()
        },
    );
    h.remote.put_file("/mos/bad.bz2", b"not bzip2".to_vec()).await;
    h.queue.publish("bad.bz2").await.unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&h.worker).run(rx));

    let q = h.queue.clone();
    eventually(|| {
        let q = q.clone();
        async move { q.dead_letters().await.len() == 1 }
    })
    .await;
    tx.send(true).unwrap();
    task.await.unwrap();

    let acked: Vec<bool> = h.queue.deliveries().await.iter().map(|d| d.acked).collect();
    assert_eq!(acked, vec![false, false, true]);
    assert_eq!(h.queue.dead_letters().await, vec!["bad.bz2"]);
}

#[tokio::test]
async fn transient_failures_never_dead_letter() {
    let h = harness(
        RecordingStore::default(),
        WorkerConfig {
            max_deliveries: Some(1),
            ..fast_config()
        },
    );
    for _ in 0..3 {
        assert!(!h.worker.handle("absent.bz2").await);
    }
    assert!(h.queue.dead_letters().await.is_empty());
}

#[tokio::test]
async fn dropped_writes_reject_the_file() {
    let store = RecordingStore::with_responses(vec![Ok(item_failure(0, 400))]);
    let h = harness(store, fast_config());
    h.remote
        .put_file("/mos/f.bz2", bz2(&weather_file(&[ROW_1, ROW_2])))
        .await;

    assert!(!h.worker.handle("f.bz2").await);
    // the retry goes through
    assert!(h.worker.handle("f.bz2").await);
}

#[tokio::test]
async fn unconfirmed_mode_acks_after_handoff() {
    let store = RecordingStore::with_responses(vec![Ok(item_failure(0, 400))]);
    let h = harness(
        store,
        WorkerConfig {
            confirm_writes: false,
            ..fast_config()
        },
    );
    h.remote
        .put_file("/mos/f.bz2", bz2(&weather_file(&[ROW_1])))
        .await;

    assert!(h.worker.handle("f.bz2").await);
}

#[tokio::test]
async fn registration_is_retried_until_it_succeeds() {
    let h = harness(RecordingStore::default(), fast_config());
    h.queue.fail_registrations(3).await;
    h.remote
        .put_file("/mos/f.bz2", bz2(&weather_file(&[ROW_1])))
        .await;
    h.queue.publish("f.bz2").await.unwrap();
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&h.worker).run(rx));

    let q = h.queue.clone();
    eventually(|| {
        let q = q.clone();
        async move { q.deliveries().await.len() == 1 }
    })
    .await;
    tx.send(true).unwrap();
    task.await.unwrap();

    assert_eq!(h.queue.registrations().await, 1);
}

#[tokio::test]
async fn lost_consumer_is_registered_again() {
    let h = harness(RecordingStore::default(), fast_config());
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&h.worker).run(rx));

    let q = h.queue.clone();
    eventually(|| {
        let q = q.clone();
        async move { q.registrations().await == 1 }
    })
    .await;
    h.queue.disconnect_consumers().await;
    eventually(|| {
        let q = q.clone();
        async move { q.registrations().await == 2 }
    })
    .await;

    h.remote
        .put_file("/mos/f.bz2", bz2(&weather_file(&[ROW_1])))
        .await;
    h.queue.publish("f.bz2").await.unwrap();
    eventually(|| {
        let q = q.clone();
        async move { q.deliveries().await.len() == 1 }
    })
    .await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();
}
