use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Broadcast channel capacity for metrics events.
const METRICS_CHANNEL_CAPACITY: usize = 1024;

pub type MetricsSender = broadcast::Sender<MetricsEvent>;

/// Events emitted by connectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricsEvent {
    /// Cache and error store sizes changed.
    CacheSize {
        connector_id: String,
        cache_bytes: u64,
        error_bytes: u64,
        timestamp: DateTime<Utc>,
    },
    /// The connector reached `Connected`.
    Connected {
        connector_id: String,
        timestamp: DateTime<Utc>,
    },
    RunStart {
        connector_id: String,
        timestamp: DateTime<Utc>,
    },
    RunEnd {
        connector_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// Values acknowledged by the destination.
    RecordsSent {
        connector_id: String,
        count: u64,
        timestamp: DateTime<Utc>,
    },
    /// A file acknowledged by the destination.
    FileSent {
        connector_id: String,
        filename: String,
        timestamp: DateTime<Utc>,
    },
}

impl MetricsEvent {
    pub fn connector_id(&self) -> &str {
        match self {
            Self::CacheSize { connector_id, .. }
            | Self::Connected { connector_id, .. }
            | Self::RunStart { connector_id, .. }
            | Self::RunEnd { connector_id, .. }
            | Self::RecordsSent { connector_id, .. }
            | Self::FileSent { connector_id, .. } => connector_id,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::CacheSize {
                cache_bytes,
                error_bytes,
                ..
            } => format!("cache {cache_bytes} bytes, errors {error_bytes} bytes"),
            Self::Connected { .. } => "connected".to_string(),
            Self::RunStart { .. } => "run started".to_string(),
            Self::RunEnd { duration_ms, .. } => format!("run finished in {duration_ms} ms"),
            Self::RecordsSent { count, .. } => format!("{count} values sent"),
            Self::FileSent { filename, .. } => format!("file {filename} sent"),
        }
    }
}

pub fn metrics_channel() -> (MetricsSender, broadcast::Receiver<MetricsEvent>) {
    broadcast::channel(METRICS_CHANNEL_CAPACITY)
}

/// Fire-and-forget send; no receiver is not an error.
pub fn emit(tx: &MetricsSender, event: MetricsEvent) {
    let _ = tx.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_receivers_is_silent() {
        let (tx, rx) = metrics_channel();
        drop(rx);
        emit(
            &tx,
            MetricsEvent::Connected {
                connector_id: "n1".to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    #[test]
    fn test_serialized_tag() {
        let event = MetricsEvent::RecordsSent {
            connector_id: "n1".to_string(),
            count: 3,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "records_sent");
        assert_eq!(event.connector_id(), "n1");
        assert_eq!(event.description(), "3 values sent");
    }
}
