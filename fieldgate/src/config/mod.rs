//! Gateway configuration.
//!
//! The configuration is a single JSON document. Every field has a default,
//! so a minimal file only lists connectors:
//!
//! ```json
//! {
//!   "engine": { "data_folder": "./data" },
//!   "north": [{ "id": "out", "name": "Out", "driver": { "type": "console" } }]
//! }
//! ```

mod north;
mod south;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

pub use north::{CacheSettings, NorthDriverConfig, NorthSettings};
pub use south::{FolderScannerConfig, SouthDriverConfig, SouthSettings};

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,

    #[serde(default)]
    pub north: Vec<NorthSettings>,

    #[serde(default)]
    pub south: Vec<SouthSettings>,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_name")]
    pub name: String,

    /// Root of the `cache/`, `error/` and `archive/` folders.
    #[serde(default = "default_data_folder")]
    pub data_folder: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Filter directive overriding the default one (e.g. "fieldgate=debug").
    #[serde(default)]
    pub log_filter: Option<String>,
}

fn default_engine_name() -> String {
    "fieldgate".to_string()
}

fn default_data_folder() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            data_folder: default_data_folder(),
            log_dir: default_log_dir(),
            log_filter: None,
        }
    }
}

/// A named outbound proxy north drivers can refer to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl GatewayConfig {
    /// Read and parse a configuration file.
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&raw)?;
        debug!(
            path = %path.display(),
            north = config.north.len(),
            south = config.south.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("invalid configuration: {e}")))
    }

    pub fn proxy(&self, name: &str) -> Option<&ProxyConfig> {
        self.proxies.iter().find(|p| p.name == name)
    }

    pub fn with_data_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.engine.data_folder = folder.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config = GatewayConfig::from_json_str(
            r#"{ "north": [{ "id": "out", "name": "Out", "driver": { "type": "console" } }] }"#,
        )
        .unwrap();

        assert_eq!(config.engine.name, "fieldgate");
        assert_eq!(config.engine.data_folder, PathBuf::from("./data"));
        let north = &config.north[0];
        assert!(north.enabled);
        assert!(north.subscribed_to.is_empty());
        assert_eq!(north.caching.max_batch_size, 500);
        assert!(!north.caching.archive.enabled);
    }

    #[test]
    fn test_malformed_document_is_configuration_error() {
        let err = GatewayConfig::from_json_str("{ north: ").unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fieldgate.json");
        std::fs::write(
            &path,
            r#"{
                "engine": { "data_folder": "/var/lib/fieldgate" },
                "proxies": [{ "name": "p", "url": "http://proxy:3128" }],
                "south": [{
                    "id": "scan",
                    "name": "Scanner",
                    "driver": { "type": "folder-scanner", "input_folder": "/in" }
                }]
            }"#,
        )
        .unwrap();

        let config = GatewayConfig::load(&path).await.unwrap();
        assert_eq!(config.engine.data_folder, PathBuf::from("/var/lib/fieldgate"));
        assert!(config.proxy("p").is_some());
        assert!(config.proxy("q").is_none());
        assert_eq!(config.south[0].scan_interval_ms, 1000);
    }
}
