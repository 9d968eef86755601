//! Metrics collector implementation.
//!
//! Folds connector events into per-connector counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::events::MetricsEvent;

#[derive(Debug, Default)]
struct ConnectorCounters {
    values_sent: AtomicU64,
    files_sent: AtomicU64,
    cache_bytes: AtomicU64,
    error_bytes: AtomicU64,
    last_run_duration_ms: AtomicU64,
    last_connection: RwLock<Option<DateTime<Utc>>>,
    last_run_start: RwLock<Option<DateTime<Utc>>>,
    last_file_sent: RwLock<Option<String>>,
}

/// Point-in-time view of one connector's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectorMetrics {
    pub values_sent: u64,
    pub files_sent: u64,
    pub cache_bytes: u64,
    pub error_bytes: u64,
    pub last_run_duration_ms: u64,
    pub last_connection: Option<DateTime<Utc>>,
    pub last_run_start: Option<DateTime<Utc>>,
    pub last_file_sent: Option<String>,
}

/// Metrics collector for all connectors.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    connectors: DashMap<String, ConnectorCounters>,
    events_seen: AtomicU64,
    events_lost: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event.
    pub fn record(&self, event: &MetricsEvent) {
        self.events_seen.fetch_add(1, Ordering::Relaxed);
        let entry = self
            .connectors
            .entry(event.connector_id().to_string())
            .or_default();

        match event {
            MetricsEvent::CacheSize {
                cache_bytes,
                error_bytes,
                ..
            } => {
                entry.cache_bytes.store(*cache_bytes, Ordering::Relaxed);
                entry.error_bytes.store(*error_bytes, Ordering::Relaxed);
            }
            MetricsEvent::Connected { timestamp, .. } => {
                *entry.last_connection.write() = Some(*timestamp);
            }
            MetricsEvent::RunStart { timestamp, .. } => {
                *entry.last_run_start.write() = Some(*timestamp);
            }
            MetricsEvent::RunEnd { duration_ms, .. } => {
                entry
                    .last_run_duration_ms
                    .store(*duration_ms, Ordering::Relaxed);
            }
            MetricsEvent::RecordsSent { count, .. } => {
                entry.values_sent.fetch_add(*count, Ordering::Relaxed);
            }
            MetricsEvent::FileSent { filename, .. } => {
                entry.files_sent.fetch_add(1, Ordering::Relaxed);
                *entry.last_file_sent.write() = Some(filename.clone());
            }
        }
    }

    pub fn snapshot(&self, connector_id: &str) -> Option<ConnectorMetrics> {
        self.connectors.get(connector_id).map(|c| ConnectorMetrics {
            values_sent: c.values_sent.load(Ordering::Relaxed),
            files_sent: c.files_sent.load(Ordering::Relaxed),
            cache_bytes: c.cache_bytes.load(Ordering::Relaxed),
            error_bytes: c.error_bytes.load(Ordering::Relaxed),
            last_run_duration_ms: c.last_run_duration_ms.load(Ordering::Relaxed),
            last_connection: *c.last_connection.read(),
            last_run_start: *c.last_run_start.read(),
            last_file_sent: c.last_file_sent.read().clone(),
        })
    }

    /// Forget a connector, e.g. after it was removed.
    pub fn reset(&self, connector_id: &str) {
        self.connectors.remove(connector_id);
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen.load(Ordering::Relaxed)
    }

    /// Events dropped because the collector lagged behind the channel.
    pub fn events_lost(&self) -> u64 {
        self.events_lost.load(Ordering::Relaxed)
    }

    /// Consume events until cancelled or until every sender is gone.
    pub fn start(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<MetricsEvent>,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Metrics collector shutting down");
                        break;
                    }
                    received = rx.recv() => match received {
                        Ok(event) => collector.record(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Metrics collector lagging, events dropped");
                            collector.events_lost.fetch_add(skipped, Ordering::Relaxed);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}
