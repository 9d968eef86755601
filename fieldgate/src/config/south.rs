use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A south (acquisition) connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SouthSettings {
    pub id: String,
    pub name: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Delay between two polls.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Delay before reconnecting after a failure.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    pub driver: SouthDriverConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_scan_interval_ms() -> u64 {
    1000
}

fn default_retry_interval_ms() -> u64 {
    10_000
}

/// Acquisition driver and its settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SouthDriverConfig {
    FolderScanner(FolderScannerConfig),
}

impl SouthDriverConfig {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::FolderScanner(_) => "folder-scanner",
        }
    }
}

/// Picks up files dropped into a folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderScannerConfig {
    pub input_folder: PathBuf,

    /// Only file names matching this expression are picked up.
    #[serde(default = "default_regex")]
    pub regex: String,

    /// A file must be untouched for this long before it is picked up.
    #[serde(default = "default_min_age_ms")]
    pub min_age_ms: u64,

    /// Leave files in place after caching them.
    #[serde(default)]
    pub preserve_files: bool,

    /// With `preserve_files`, send a file again only when its mtime changed,
    /// unless this is set.
    #[serde(default)]
    pub ignore_modified_date: bool,
}

fn default_regex() -> String {
    ".*".to_string()
}

fn default_min_age_ms() -> u64 {
    1000
}

impl FolderScannerConfig {
    pub fn new(input_folder: impl Into<PathBuf>) -> Self {
        Self {
            input_folder: input_folder.into(),
            regex: default_regex(),
            min_age_ms: default_min_age_ms(),
            preserve_files: false,
            ignore_modified_date: false,
        }
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_millis(self.min_age_ms)
    }
}

impl SouthSettings {
    pub fn new(id: impl Into<String>, driver: SouthDriverConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            scan_interval_ms: default_scan_interval_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            driver,
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("south connector id must not be empty"));
        }
        if self.scan_interval_ms == 0 {
            return Err(Error::validation(format!(
                "south '{}': scan_interval_ms must be positive",
                self.id
            )));
        }
        match &self.driver {
            SouthDriverConfig::FolderScanner(scanner) => {
                regex::Regex::new(&scanner.regex).map_err(|e| {
                    Error::config(format!("south '{}': invalid regex: {}", self.id, e))
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_scanner_defaults() {
        let driver: SouthDriverConfig =
            serde_json::from_str(r#"{ "type": "folder-scanner", "input_folder": "/in" }"#).unwrap();
        let SouthDriverConfig::FolderScanner(scanner) = driver;
        assert_eq!(scanner.regex, ".*");
        assert_eq!(scanner.min_age(), Duration::from_secs(1));
        assert!(!scanner.preserve_files);
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut scanner = FolderScannerConfig::new("/in");
        scanner.regex = "([a-z".to_string();
        let settings = SouthSettings::new("scan", SouthDriverConfig::FolderScanner(scanner));
        assert!(settings.validate().unwrap_err().is_configuration());
    }
}
