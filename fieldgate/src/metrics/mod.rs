//! Connector metrics.
//!
//! Connectors emit [`MetricsEvent`]s on a broadcast channel without waiting
//! for anyone; the [`MetricsCollector`] folds them into per-connector
//! counters.

mod collector;
mod events;

pub use collector::{ConnectorMetrics, MetricsCollector};
pub use events::{MetricsEvent, MetricsSender, emit, metrics_channel};
