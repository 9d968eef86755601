//! Picks up files dropped into a local folder.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;
use connector_core::{Connectable, ConnectorError};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, error, info, trace};

use crate::config::FolderScannerConfig;
use crate::south::source::{AcquisitionSink, Source};
use crate::{Error, Result};

pub struct FolderScanner {
    config: FolderScannerConfig,
    regex: Regex,
    /// Last modification time sent, per file name, when files are preserved.
    sent_mtimes: Mutex<HashMap<String, SystemTime>>,
}

impl FolderScanner {
    pub fn new(config: FolderScannerConfig) -> Result<Self> {
        let regex = Regex::new(&config.regex)
            .map_err(|e| Error::config(format!("invalid regex '{}': {e}", config.regex)))?;
        Ok(Self {
            config,
            regex,
            sent_mtimes: Mutex::new(HashMap::new()),
        })
    }

    /// Whether a file is old enough, and for preserved files, changed since
    /// it was last sent.
    fn is_ready(&self, name: &str, modified: SystemTime, now: SystemTime) -> bool {
        let old_enough = modified
            .checked_add(self.config.min_age())
            .is_some_and(|ready_at| ready_at < now);
        if !old_enough {
            return false;
        }
        if !self.config.preserve_files || self.config.ignore_modified_date {
            return true;
        }
        match self.sent_mtimes.lock().get(name) {
            Some(sent) => modified > *sent,
            None => true,
        }
    }

    async fn candidates(&self) -> connector_core::Result<Vec<(String, PathBuf, SystemTime)>> {
        let folder = &self.config.input_folder;
        let mut entries = tokio::fs::read_dir(folder).await.map_err(|e| {
            ConnectorError::transport(format!("cannot read {}: {e}", folder.display()))
        })?;

        let now = SystemTime::now();
        let mut ready = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    return Err(ConnectorError::transport(format!(
                        "cannot read {}: {e}",
                        folder.display()
                    )));
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if !self.regex.is_match(&name) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if self.is_ready(&name, modified, now) {
                ready.push((name, entry.path(), modified));
            } else {
                trace!(file = %name, "File not ready yet");
            }
        }
        ready.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));
        Ok(ready)
    }
}

#[async_trait]
impl Connectable for FolderScanner {
    async fn connect(&self) -> connector_core::Result<()> {
        self.test_connection().await
    }

    async fn disconnect(&self) -> connector_core::Result<()> {
        Ok(())
    }

    async fn test_connection(&self) -> connector_core::Result<()> {
        let folder = &self.config.input_folder;
        match tokio::fs::metadata(folder).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(ConnectorError::transport(format!(
                "{} is not a folder",
                folder.display()
            ))),
            Err(e) => Err(ConnectorError::transport(format!(
                "input folder {} unavailable: {e}",
                folder.display()
            ))),
        }
    }
}

#[async_trait]
impl Source for FolderScanner {
    fn driver_name(&self) -> &'static str {
        "folder-scanner"
    }

    async fn poll(
        &self,
        source_id: &str,
        output: &dyn AcquisitionSink,
    ) -> connector_core::Result<()> {
        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            trace!(regex = %self.config.regex, "No file ready");
            return Ok(());
        }
        debug!(count = candidates.len(), "Files ready");

        for (name, path, modified) in candidates {
            info!(file = %path.display(), "Sending file");
            // A refused file stays in the folder and is retried on a later poll.
            output.add_content(source_id, &path).await?;

            if self.config.preserve_files {
                self.sent_mtimes.lock().insert(name, modified);
            } else if let Err(e) = tokio::fs::remove_file(&path).await {
                error!(file = %path.display(), error = %e, "Cannot remove file after caching");
            }
        }
        Ok(())
    }
}
