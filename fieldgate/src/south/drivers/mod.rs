//! South acquisition drivers.

pub mod folder_scanner;

use std::sync::Arc;

pub use folder_scanner::FolderScanner;

use super::source::Source;
use crate::Result;
use crate::config::{SouthDriverConfig, SouthSettings};

/// Build the driver of a south connector.
pub fn build_source(settings: &SouthSettings) -> Result<Arc<dyn Source>> {
    match &settings.driver {
        SouthDriverConfig::FolderScanner(config) => {
            Ok(Arc::new(FolderScanner::new(config.clone())?))
        }
    }
}
