//! North delivery drivers.

pub mod console;
pub mod file_writer;
pub mod http;

use std::sync::Arc;

pub use console::ConsoleSink;
pub use file_writer::FileWriterSink;
pub use http::HttpSink;

use super::sink::Sink;
use crate::config::{GatewayConfig, NorthDriverConfig, NorthSettings};
use crate::{Error, Result};

/// Build the driver of a north connector.
///
/// Fails on configuration problems only; an unreachable destination is the
/// connection state machine's business.
pub fn build_sink(settings: &NorthSettings, config: &GatewayConfig) -> Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match &settings.driver {
        NorthDriverConfig::FileWriter {
            output_folder,
            prefix,
            suffix,
        } => Arc::new(FileWriterSink::new(output_folder.clone(), prefix, suffix)),
        NorthDriverConfig::Http {
            endpoint,
            proxy,
            headers,
        } => {
            let proxy = match proxy {
                Some(name) => Some(config.proxy(name).ok_or_else(|| {
                    Error::config(format!(
                        "north '{}': unknown proxy '{}'",
                        settings.id, name
                    ))
                })?),
                None => None,
            };
            Arc::new(HttpSink::new(endpoint, headers, proxy)?)
        }
        NorthDriverConfig::Console { verbose } => Arc::new(ConsoleSink::new(*verbose)),
    };
    Ok(sink)
}
