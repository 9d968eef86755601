//! Archive retention sweeper.
//!
//! Runs in the background and periodically deletes archived files whose
//! age exceeds the retention window. A retention of zero keeps archived
//! files forever.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fs;

/// Archive settings of a north connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Keep sent files in the archive folder instead of deleting them.
    #[serde(default)]
    pub enabled: bool,

    /// Hours an archived file is kept. 0 keeps files forever.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Seconds between two sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_retention_hours() -> u64 {
    72
}

fn default_sweep_interval_secs() -> u64 {
    3600 // 1 hour
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retention_hours: default_retention_hours(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ArchiveConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_retention_hours(mut self, hours: u64) -> Self {
        self.retention_hours = hours;
        self
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub kept: usize,
    pub failed: usize,
}

pub struct ArchiveSweeper {
    connector_id: String,
    archive_dir: PathBuf,
    retention: Duration,
    interval: Duration,
}

impl ArchiveSweeper {
    pub fn new(
        connector_id: impl Into<String>,
        archive_dir: impl Into<PathBuf>,
        config: &ArchiveConfig,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            archive_dir: archive_dir.into(),
            retention: config.retention(),
            interval: config.sweep_interval(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.retention.is_zero()
    }

    /// Sweep once against the current time.
    pub async fn refresh_archive_folder(&self) -> SweepReport {
        self.refresh_archive_folder_at(SystemTime::now()).await
    }

    /// Sweep once, deleting entries with `now - mtime > retention`.
    ///
    /// Never fails: a folder that cannot be read is logged, and an entry that
    /// cannot be removed is counted and skipped.
    pub async fn refresh_archive_folder_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.is_enabled() {
            debug!(connector = %self.connector_id, "Archive retention disabled");
            return report;
        }

        let entries = match fs::list_files(&self.archive_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(connector = %self.connector_id, error = %e, "Failed to read archive folder");
                return report;
            }
        };

        for entry in entries {
            let expired = now
                .duration_since(entry.modified)
                .is_ok_and(|age| age > self.retention);
            if !expired {
                report.kept += 1;
                continue;
            }

            match fs::remove_if_exists(&entry.path).await {
                Ok(()) => {
                    debug!(connector = %self.connector_id, file = %entry.name, "Removed archived file");
                    report.removed += 1;
                }
                Err(e) => {
                    warn!(connector = %self.connector_id, file = %entry.name, error = %e, "Failed to remove archived file");
                    report.failed += 1;
                }
            }
        }

        if report.removed > 0 {
            info!(connector = %self.connector_id, count = report.removed, "Archive folder cleaned");
        }
        report
    }

    /// Spawn the sweep loop: one sweep now, then one per interval until cancelled.
    ///
    /// Returns `None` when retention is disabled.
    pub fn start_background_task(
        self: Arc<Self>,
        cancellation_token: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }

        info!(
            connector = %self.connector_id,
            retention_hours = self.retention.as_secs() / 3600,
            "Starting archive sweeper"
        );

        Some(tokio::spawn(async move {
            loop {
                self.refresh_archive_folder().await;

                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!(connector = %self.connector_id, "Archive sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }))
    }
}
