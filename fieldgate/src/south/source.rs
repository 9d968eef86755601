//! Acquisition capability implemented by south drivers.

use std::path::Path;

use async_trait::async_trait;
use connector_core::Connectable;
use north_cache::PointValue;

/// Where acquired data goes.
///
/// Both calls return once the data is durably cached by at least one north
/// connector. An error means nothing took it and the source must keep it.
#[async_trait]
pub trait AcquisitionSink: Send + Sync {
    async fn add_values(
        &self,
        source_id: &str,
        values: Vec<PointValue>,
    ) -> connector_core::Result<()>;

    async fn add_content(&self, source_id: &str, path: &Path) -> connector_core::Result<()>;
}

/// A data source polled on a schedule.
#[async_trait]
pub trait Source: Connectable {
    fn driver_name(&self) -> &'static str;

    /// Acquire whatever is available and hand it to `output`.
    async fn poll(
        &self,
        source_id: &str,
        output: &dyn AcquisitionSink,
    ) -> connector_core::Result<()>;
}
