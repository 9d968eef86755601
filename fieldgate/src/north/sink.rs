//! Delivery capability implemented by north drivers.

use async_trait::async_trait;
use connector_core::Connectable;
use north_cache::{CachedFile, CachedValue};
use tokio::time::Instant;

/// What a single send attempt carries.
#[derive(Debug, Clone)]
pub enum Batch {
    Values(Vec<CachedValue>),
    File(CachedFile),
}

impl Batch {
    pub fn len(&self) -> usize {
        match self {
            Self::Values(values) => values.len(),
            Self::File(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short description for log lines.
    pub fn describe(&self) -> String {
        match self {
            Self::Values(values) => match (values.first(), values.last()) {
                (Some(first), Some(last)) => {
                    format!("{} values (seq {}..={})", values.len(), first.seq, last.seq)
                }
                _ => "0 values".to_string(),
            },
            Self::File(file) => format!("file {}", file.original_name),
        }
    }
}

/// A record the destination refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub seq: u64,
    pub reason: String,
}

impl Rejection {
    pub fn new(seq: u64, reason: impl Into<String>) -> Self {
        Self {
            seq,
            reason: reason.into(),
        }
    }
}

/// Classified result of a send.
///
/// The driver decides the class; the delivery loop acts on it and never
/// looks at error text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Everything was accepted.
    Delivered,
    /// Only the listed records were refused for their content; the rest
    /// of the batch was accepted.
    PartiallyRejected(Vec<Rejection>),
    /// The whole batch was refused for its content.
    Rejected(String),
    /// The destination could not be reached; nothing was accepted.
    TransportFailed(String),
}

impl SendOutcome {
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportFailed(_))
    }
}

/// A destination able to receive batches.
#[async_trait]
pub trait Sink: Connectable {
    /// Driver type name used in logs.
    fn driver_name(&self) -> &'static str;

    /// Deliver `batch`, giving up at `deadline`.
    async fn send(&self, batch: &Batch, deadline: Instant) -> SendOutcome;
}
