use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use north_cache::ArchiveConfig;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A north (delivery) connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NorthSettings {
    pub id: String,
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// South connector ids this connector receives data from. Empty means all.
    #[serde(default)]
    pub subscribed_to: Vec<String>,

    #[serde(default)]
    pub caching: CacheSettings,

    pub driver: NorthDriverConfig,
}

fn default_enabled() -> bool {
    true
}

/// Cache and delivery settings of a north connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Delay between two delivery runs.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Delay before reconnecting after a failure.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Deadline handed to every send.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Wake the delivery loop as soon as this many values are pending. 0 disables.
    #[serde(default)]
    pub group_count: usize,

    /// Wake the delivery loop as soon as a file is cached.
    #[serde(default)]
    pub send_file_immediately: bool,

    /// Refuse new data past this cache size. 0 means unlimited.
    #[serde(default)]
    pub max_size_mb: u64,

    #[serde(default)]
    pub archive: ArchiveConfig,
}

fn default_scan_interval_ms() -> u64 {
    1000
}

fn default_retry_interval_ms() -> u64 {
    5000
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_max_batch_size() -> usize {
    500
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            max_batch_size: default_max_batch_size(),
            group_count: 0,
            send_file_immediately: false,
            max_size_mb: 0,
            archive: ArchiveConfig::default(),
        }
    }
}

impl CacheSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn with_archive(mut self, archive: ArchiveConfig) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_group_count(mut self, count: usize) -> Self {
        self.group_count = count;
        self
    }

    pub fn with_scan_interval_ms(mut self, ms: u64) -> Self {
        self.scan_interval_ms = ms;
        self
    }

    pub fn with_retry_interval_ms(mut self, ms: u64) -> Self {
        self.retry_interval_ms = ms;
        self
    }

    pub fn with_max_size_mb(mut self, mb: u64) -> Self {
        self.max_size_mb = mb;
        self
    }
}

/// Delivery driver and its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum NorthDriverConfig {
    /// Write files and value batches into a local folder.
    FileWriter {
        output_folder: PathBuf,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        suffix: String,
    },
    /// POST value batches and files to an HTTP endpoint.
    Http {
        endpoint: String,
        /// Name of an entry of the top-level `proxies` list.
        #[serde(default)]
        proxy: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// Log what would be delivered.
    Console {
        #[serde(default)]
        verbose: bool,
    },
}

impl NorthDriverConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::FileWriter { .. } => "file-writer",
            Self::Http { .. } => "http",
            Self::Console { .. } => "console",
        }
    }
}

impl NorthSettings {
    pub fn new(id: impl Into<String>, driver: NorthDriverConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            subscribed_to: Vec::new(),
            caching: CacheSettings::default(),
            driver,
        }
    }

    pub fn with_caching(mut self, caching: CacheSettings) -> Self {
        self.caching = caching;
        self
    }

    pub fn with_subscriptions(mut self, souths: Vec<String>) -> Self {
        self.subscribed_to = souths;
        self
    }

    /// Check the settings before anything is built from them.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("north connector id must not be empty"));
        }
        if self.caching.max_batch_size == 0 {
            return Err(Error::validation(format!(
                "north '{}': max_batch_size must be at least 1",
                self.id
            )));
        }
        if self.caching.scan_interval_ms == 0 {
            return Err(Error::validation(format!(
                "north '{}': scan_interval_ms must be positive",
                self.id
            )));
        }
        if let NorthDriverConfig::Http { endpoint, .. } = &self.driver {
            url::Url::parse(endpoint).map_err(|e| {
                Error::config(format!(
                    "north '{}': invalid endpoint '{}': {}",
                    self.id, endpoint, e
                ))
            })?;
        }
        Ok(())
    }
}
