//! Destination that only logs what it receives.

use async_trait::async_trait;
use connector_core::Connectable;
use tokio::time::Instant;
use tracing::info;

use crate::north::sink::{Batch, SendOutcome, Sink};

#[derive(Debug, Default)]
pub struct ConsoleSink {
    verbose: bool,
}

impl ConsoleSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl Connectable for ConsoleSink {
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
impl Sink for ConsoleSink {
    fn driver_name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, batch: &Batch, _deadline: Instant) -> SendOutcome {
        match batch {
            Batch::Values(values) if self.verbose => {
                for value in values {
                    info!(
                        seq = value.seq,
                        point = %value.point_id,
                        timestamp = %value.timestamp,
                        data = %value.payload,
                        "Value"
                    );
                }
            }
            Batch::File(file) if self.verbose => {
                info!(file = %file.original_name, path = %file.stored_path.display(), "File");
            }
            _ => info!(batch = %batch.describe(), "Received"),
        }
        SendOutcome::Delivered
    }
}
