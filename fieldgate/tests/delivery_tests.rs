//! Delivery behaviour of a north connector against a scripted destination.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use connector_core::{Connectable, ConnectionState, ConnectorError};
use fieldgate::config::{CacheSettings, NorthDriverConfig, NorthSettings};
use fieldgate::metrics::metrics_channel;
use fieldgate::north::drivers::FileWriterSink;
use fieldgate::north::{Batch, NorthConnector, Rejection, SendOutcome, Sink};
use north_cache::{ErrorFileFilter, ErrorStore, PointValue};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;
use tokio::time::Instant;

type Responder = Box<dyn FnOnce(&Batch) -> SendOutcome + Send>;

/// Destination whose answers are queued by the test. Delivers once the
/// script runs out.
#[derive(Default)]
struct ScriptedSink {
    script: Mutex<VecDeque<Responder>>,
    received: Mutex<Vec<Batch>>,
    connects: AtomicUsize,
    refuse_connect: AtomicBool,
}

impl ScriptedSink {
    fn then(&self, responder: impl FnOnce(&Batch) -> SendOutcome + Send + 'static) {
        self.script.lock().push_back(Box::new(responder));
    }

    fn received_seqs(&self) -> Vec<Vec<u64>> {
        self.received
            .lock()
            .iter()
            .filter_map(|b| match b {
                Batch::Values(values) => Some(values.iter().map(|v| v.seq).collect()),
                Batch::File(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Connectable for ScriptedSink {
    async fn connect(&self) -> connector_core::Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_connect.load(Ordering::SeqCst) {
            return Err(ConnectorError::transport("destination unreachable"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> connector_core::Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> connector_core::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn driver_name(&self) -> &'static str {
        "scripted"
    }

    async fn send(&self, batch: &Batch, _deadline: Instant) -> SendOutcome {
        self.received.lock().push(batch.clone());
        let responder = self.script.lock().pop_front();
        match responder {
            Some(responder) => responder(batch),
            None => SendOutcome::Delivered,
        }
    }
}

async fn build_north(dir: &Path, sink: Arc<ScriptedSink>) -> NorthConnector {
    let (events, _rx) = metrics_channel();
    let caching = CacheSettings::default()
        .with_retry_interval_ms(50)
        .with_max_batch_size(10);
    let settings = NorthSettings::new("historian", NorthDriverConfig::Console { verbose: false })
        .with_caching(caching);
    let north = NorthConnector::new(
        settings,
        sink,
        dir,
        Arc::new(ErrorStore::new(dir.join("error"))),
        events,
    );
    north.coordinator().start().await.unwrap();
    north
}

fn points(names: &[&str]) -> Vec<PointValue> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| PointValue::new(*name, json!(i)))
        .collect()
}

#[tokio::test]
async fn transport_failure_keeps_values_and_reconnects() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(ScriptedSink::default());
    let north = build_north(dir.path(), sink.clone()).await;
    north.connection().connect().await;
    assert_eq!(north.state(), ConnectionState::Connected);

    north.add_values("plc", points(&["a", "b", "c"])).await.unwrap();
    sink.then(|_| SendOutcome::TransportFailed("connection reset".to_string()));

    let report = north.run_once().await;
    assert!(report.transport_failed);
    assert_eq!(report.values_sent, 0);
    assert_eq!(north.coordinator().get_number_of_values().await, 3);
    assert_eq!(north.state(), ConnectionState::ReconnectScheduled);

    // While disconnected a run does nothing.
    assert!(north.run_once().await.skipped);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(north.state(), ConnectionState::Connected);
    assert_eq!(sink.connects.load(Ordering::SeqCst), 2);

    let report = north.run_once().await;
    assert_eq!(report.values_sent, 3);
    assert_eq!(north.coordinator().get_number_of_values().await, 0);

    // The same values, in the same order, were offered twice.
    let seqs = sink.received_seqs();
    assert_eq!(seqs.len(), 2);
    assert_eq!(seqs[0], seqs[1]);

    north.connection().stop().await;
}

#[tokio::test]
async fn content_failure_quarantines_only_the_rejected_value() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(ScriptedSink::default());
    let north = build_north(dir.path(), sink.clone()).await;
    north.connection().connect().await;

    north.add_values("plc", points(&["a", "bad", "c"])).await.unwrap();
    sink.then(|batch| match batch {
        Batch::Values(values) => SendOutcome::PartiallyRejected(
            values
                .iter()
                .filter(|v| v.point_id == "bad")
                .map(|v| Rejection::new(v.seq, "unknown point"))
                .collect(),
        ),
        Batch::File(_) => SendOutcome::Delivered,
    });

    let report = north.run_once().await;
    assert!(!report.transport_failed);
    assert_eq!(report.values_sent, 2);
    assert_eq!(report.values_quarantined, 1);
    assert_eq!(north.coordinator().get_number_of_values().await, 0);
    assert_eq!(north.state(), ConnectionState::Connected);

    let quarantined = north
        .coordinator()
        .list_error_values(&ErrorFileFilter::default())
        .await
        .unwrap();
    assert_eq!(quarantined.len(), 1);

    // Moving the segment back makes the value deliverable again.
    let names: Vec<String> = quarantined.into_iter().map(|q| q.filename).collect();
    assert_eq!(north.coordinator().retry_error_values(&names).await.unwrap(), 1);
    let report = north.run_once().await;
    assert_eq!(report.values_sent, 1);
    assert_eq!(sink.received_seqs().last().map(Vec::len), Some(1));
}

#[tokio::test]
async fn rejected_file_is_quarantined_and_can_be_retried() {
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("report.csv");
    tokio::fs::write(&source, b"t,v\n1,2\n").await.unwrap();

    let sink = Arc::new(ScriptedSink::default());
    let north = build_north(dir.path(), sink.clone()).await;
    north.connection().connect().await;
    north.add_content(&source).await.unwrap();

    sink.then(|_| SendOutcome::Rejected("HTTP 400".to_string()));
    let report = north.run_once().await;
    assert_eq!(report.files_quarantined, 1);
    assert!(north.coordinator().is_empty().await.unwrap());

    let errors = north
        .coordinator()
        .list_error_files(&ErrorFileFilter::default())
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);

    let retried = north.coordinator().retry_all_error_files().await.unwrap();
    assert_eq!(retried, 1);
    let report = north.run_once().await;
    assert_eq!(report.files_sent, 1);
    assert!(north.coordinator().is_empty().await.unwrap());
}

#[tokio::test]
async fn timed_out_send_is_a_transport_failure() {
    struct Hanging;

    #[async_trait]
    impl Connectable for Hanging {
        async fn connect(&self) -> connector_core::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> connector_core::Result<()> {
            Ok(())
        }
        async fn test_connection(&self) -> connector_core::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Sink for Hanging {
        fn driver_name(&self) -> &'static str {
            "hanging"
        }
        async fn send(&self, _batch: &Batch, _deadline: Instant) -> SendOutcome {
            std::future::pending().await
        }
    }

    let dir = TempDir::new().unwrap();
    let (events, _rx) = metrics_channel();
    let mut caching = CacheSettings::default().with_retry_interval_ms(60_000);
    caching.send_timeout_ms = 100;
    let settings = NorthSettings::new("slow", NorthDriverConfig::Console { verbose: false })
        .with_caching(caching);
    let north = NorthConnector::new(
        settings,
        Arc::new(Hanging),
        dir.path(),
        Arc::new(ErrorStore::new(dir.path().join("error"))),
        events,
    );
    north.coordinator().start().await.unwrap();
    north.connection().connect().await;
    north.add_values("plc", points(&["a"])).await.unwrap();

    let report = north.run_once().await;
    assert!(report.transport_failed);
    assert_eq!(north.coordinator().get_number_of_values().await, 1);
    north.connection().stop().await;
}

#[tokio::test]
async fn unreachable_destination_leaves_one_retry_timer() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(ScriptedSink::default());
    sink.refuse_connect.store(true, Ordering::SeqCst);
    let north = build_north(dir.path(), sink.clone()).await;

    north.connection().connect().await;
    assert_eq!(north.state(), ConnectionState::ReconnectScheduled);
    north.connection().report_transport_error("late error").await;
    assert_eq!(north.connection().stats().timers_armed, 1);

    north.connection().stop().await;
    assert_eq!(north.state(), ConnectionState::Disconnected);
    let connects = sink.connects.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.connects.load(Ordering::SeqCst), connects);
}

#[tokio::test]
async fn cached_values_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    {
        let north = build_north(dir.path(), Arc::new(ScriptedSink::default())).await;
        north.add_values("plc", points(&["a", "b"])).await.unwrap();
    }

    let north = build_north(dir.path(), Arc::new(ScriptedSink::default())).await;
    assert_eq!(north.coordinator().get_number_of_values().await, 2);
}

#[tokio::test]
async fn unwritable_file_does_not_block_the_queue() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out");
    // A folder already holds the output name of the first file.
    std::fs::create_dir_all(output.join("a.csv")).unwrap();

    let (events, _rx) = metrics_channel();
    let caching = CacheSettings::default().with_retry_interval_ms(10);
    let settings = NorthSettings::new(
        "writer",
        NorthDriverConfig::FileWriter {
            output_folder: output.clone(),
            prefix: String::new(),
            suffix: String::new(),
        },
    )
    .with_caching(caching);
    let north = NorthConnector::new(
        settings,
        Arc::new(FileWriterSink::new(&output, "", "")),
        dir.path(),
        Arc::new(ErrorStore::new(dir.path().join("error"))),
        events,
    );
    north.coordinator().start().await.unwrap();
    north.connection().connect().await;
    assert!(north.state().is_connected());

    for name in ["a.csv", "b.csv"] {
        let source = dir.path().join(name);
        tokio::fs::write(&source, name.as_bytes()).await.unwrap();
        north.add_content(&source).await.unwrap();
    }

    let mut sent = 0;
    for _ in 0..5 {
        let report = north.run_once().await;
        assert!(!report.transport_failed);
        sent += report.files_sent;
    }
    assert_eq!(sent, 1);
    assert_eq!(std::fs::read(output.join("b.csv")).unwrap(), b"b.csv");
    assert_eq!(north.state(), ConnectionState::Connected);
    assert!(north.coordinator().is_empty().await.unwrap());

    let quarantined = north
        .coordinator()
        .list_error_files(&ErrorFileFilter::default())
        .await
        .unwrap();
    assert_eq!(quarantined.len(), 1);
    north.connection().stop().await;
}
