//! Delivery loop of a north connector.
//!
//! Each run sends at most one value batch and one file. The sink classifies
//! the result and the loop acts on the class:
//!
//! - delivered: ack
//! - content rejection: quarantine the rejected records only, ack the rest
//! - transport failure: leave everything pending, hand the error to the
//!   connection state machine
//!
//! Runs are serialized, so retrieve and ack/quarantine never interleave.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use connector_core::ConnectionManager;
use north_cache::{CachedFile, CachedValue};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, warn};

use super::coordinator::CacheCoordinator;
use super::sink::{Batch, SendOutcome, Sink};
use crate::metrics::{MetricsEvent, MetricsSender, emit};

/// Counters of a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// The connector was not connected; nothing was attempted.
    pub skipped: bool,
    pub values_sent: usize,
    pub values_quarantined: usize,
    pub files_sent: usize,
    pub files_quarantined: usize,
    pub transport_failed: bool,
}

enum Step {
    Continue,
    Stop,
}

pub struct DeliveryLoop {
    connector_id: String,
    coordinator: Arc<CacheCoordinator>,
    sink: Arc<dyn Sink>,
    connection: ConnectionManager,
    events: MetricsSender,
    send_timeout: Duration,
    max_batch_size: usize,
    scan_interval: Duration,
    run_lock: Mutex<()>,
}

impl DeliveryLoop {
    pub fn new(
        coordinator: Arc<CacheCoordinator>,
        sink: Arc<dyn Sink>,
        connection: ConnectionManager,
        events: MetricsSender,
    ) -> Self {
        let settings = coordinator.settings();
        Self {
            connector_id: coordinator.connector_id().to_string(),
            send_timeout: settings.send_timeout(),
            max_batch_size: settings.max_batch_size.max(1),
            scan_interval: settings.scan_interval(),
            coordinator,
            sink,
            connection,
            events,
            run_lock: Mutex::new(()),
        }
    }

    /// One delivery run. A no-op unless the connection is up.
    pub async fn run_once(&self) -> RunReport {
        let _run = self.run_lock.lock().await;
        let mut report = RunReport::default();

        if !self.connection.is_connected() {
            report.skipped = true;
            return report;
        }

        let started = Instant::now();
        emit(
            &self.events,
            MetricsEvent::RunStart {
                connector_id: self.connector_id.clone(),
                timestamp: Utc::now(),
            },
        );

        self.coordinator.retry_pending_resolutions().await;

        let values = self
            .coordinator
            .retrieve_values_from_cache(self.max_batch_size)
            .await;
        let step = if values.is_empty() {
            Step::Continue
        } else {
            self.deliver_values(values, &mut report).await
        };

        if matches!(step, Step::Continue) {
            match self.coordinator.retrieve_file_from_cache().await {
                Ok(Some(file)) => {
                    self.deliver_file(file, &mut report).await;
                }
                Ok(None) => {}
                Err(e) => warn!(connector = %self.connector_id, error = %e, "Failed to read file cache"),
            }
        }

        emit(
            &self.events,
            MetricsEvent::RunEnd {
                connector_id: self.connector_id.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            },
        );
        report
    }

    async fn send(&self, batch: &Batch) -> SendOutcome {
        let deadline = Instant::now() + self.send_timeout;
        match tokio::time::timeout_at(deadline, self.sink.send(batch, deadline)).await {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::TransportFailed(format!(
                "send timed out after {} ms",
                self.send_timeout.as_millis()
            )),
        }
    }

    async fn deliver_values(&self, values: Vec<CachedValue>, report: &mut RunReport) -> Step {
        let batch = Batch::Values(values);
        let outcome = self.send(&batch).await;
        let description = batch.describe();
        let Batch::Values(values) = batch else {
            return Step::Continue;
        };

        match outcome {
            SendOutcome::Delivered => {
                self.ack_values(&values, report).await;
                Step::Continue
            }
            SendOutcome::PartiallyRejected(rejections) => {
                let (rejected, accepted): (Vec<CachedValue>, Vec<CachedValue>) = values
                    .into_iter()
                    .partition(|v| rejections.iter().any(|r| r.seq == v.seq));

                for rejection in &rejections {
                    let point = rejected
                        .iter()
                        .find(|v| v.seq == rejection.seq)
                        .map(|v| v.point_id.as_str())
                        .unwrap_or("?");
                    error!(
                        connector = %self.connector_id,
                        seq = rejection.seq,
                        point = %point,
                        reason = %rejection.reason,
                        "Value rejected by destination"
                    );
                }
                self.quarantine_values(&rejected, report).await;
                self.ack_values(&accepted, report).await;
                Step::Continue
            }
            SendOutcome::Rejected(reason) => {
                error!(
                    connector = %self.connector_id,
                    batch = %description,
                    reason = %reason,
                    "Batch rejected by destination"
                );
                self.quarantine_values(&values, report).await;
                Step::Continue
            }
            SendOutcome::TransportFailed(reason) => {
                self.transport_failed(&reason, report).await;
                Step::Stop
            }
        }
    }

    async fn deliver_file(&self, file: CachedFile, report: &mut RunReport) {
        let batch = Batch::File(file);
        let outcome = self.send(&batch).await;
        let Batch::File(file) = batch else {
            return;
        };

        match outcome {
            SendOutcome::Delivered => match self.coordinator.ack_file(&file).await {
                Ok(()) => {
                    report.files_sent += 1;
                    emit(
                        &self.events,
                        MetricsEvent::FileSent {
                            connector_id: self.connector_id.clone(),
                            filename: file.original_name.clone(),
                            timestamp: Utc::now(),
                        },
                    );
                }
                Err(e) => warn!(connector = %self.connector_id, error = %e, "Sent file not acknowledged, will retry"),
            },
            SendOutcome::Rejected(reason) => self.quarantine_file(&file, &reason, report).await,
            SendOutcome::PartiallyRejected(rejections) => {
                let reason = rejections
                    .first()
                    .map(|r| r.reason.clone())
                    .unwrap_or_else(|| "file partially rejected".to_string());
                self.quarantine_file(&file, &reason, report).await;
            }
            SendOutcome::TransportFailed(reason) => {
                self.transport_failed(&reason, report).await;
            }
        }
    }

    async fn quarantine_file(&self, file: &CachedFile, reason: &str, report: &mut RunReport) {
        error!(
            connector = %self.connector_id,
            file = %file.original_name,
            cached = %file.cached_name(),
            reason = %reason,
            "File rejected by destination"
        );
        match self.coordinator.manage_errored_files(file).await {
            Ok(()) => report.files_quarantined += 1,
            Err(e) => warn!(connector = %self.connector_id, error = %e, "Failed to quarantine file, will retry"),
        }
    }

    async fn ack_values(&self, values: &[CachedValue], report: &mut RunReport) {
        if values.is_empty() {
            return;
        }
        let removed = self.coordinator.remove_values_from_cache(values).await;
        report.values_sent += values.len();
        debug!(connector = %self.connector_id, sent = values.len(), removed, "Values delivered");
        emit(
            &self.events,
            MetricsEvent::RecordsSent {
                connector_id: self.connector_id.clone(),
                count: values.len() as u64,
                timestamp: Utc::now(),
            },
        );
    }

    async fn quarantine_values(&self, values: &[CachedValue], report: &mut RunReport) {
        if values.is_empty() {
            return;
        }
        match self.coordinator.manage_errored_values(values).await {
            Ok(moved) => report.values_quarantined += moved,
            Err(e) => warn!(connector = %self.connector_id, error = %e, "Failed to quarantine values, will retry"),
        }
    }

    async fn transport_failed(&self, reason: &str, report: &mut RunReport) {
        report.transport_failed = true;
        warn!(connector = %self.connector_id, reason = %reason, "Delivery failed, data kept in cache");
        self.connection.report_transport_error(reason).await;
    }

    /// Run on every scan tick and whenever the coordinator triggers, until cancelled.
    ///
    /// The run in flight when cancellation arrives is completed, bounded by
    /// the send deadline.
    pub fn spawn(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let delivery = Arc::clone(self);
        let trigger = self.coordinator.trigger();

        let span = info_span!("delivery", connector = %self.connector_id);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(delivery.scan_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = cancel_token.cancelled() => {
                            debug!(connector = %delivery.connector_id, "Delivery loop shutting down");
                            break;
                        }
                        _ = ticker.tick() => {}
                        _ = trigger.notified() => {
                            debug!(connector = %delivery.connector_id, "Delivery triggered");
                        }
                    }
                    delivery.run_once().await;
                }
            }
            .instrument(span),
        )
    }
}
