//! Per-connector owner of the file and value caches.
//!
//! Acquisition calls [`CacheCoordinator::add_content`] and
//! [`CacheCoordinator::add_values`]; both return once the data is on disk.
//! The delivery loop uses the retrieve/ack/quarantine operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use north_cache::{
    ArchiveSweeper, CacheError, CachedFile, CachedValue, ErrorFileFilter, ErrorFileInfo,
    ErrorStore, FileCache, PointValue, ValueCache,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CacheSettings;
use crate::metrics::{MetricsEvent, MetricsSender, emit};
use crate::Result;

/// Folders of one north connector under the data folder.
#[derive(Debug, Clone)]
pub struct CachePaths {
    pub cache_root: PathBuf,
    pub archive_dir: PathBuf,
}

impl CachePaths {
    pub fn for_connector(data_folder: &Path, connector_id: &str) -> Self {
        let folder = format!("north-{connector_id}");
        Self {
            cache_root: data_folder.join("cache").join(&folder),
            archive_dir: data_folder.join("archive").join(folder),
        }
    }
}

pub struct CacheCoordinator {
    connector_id: String,
    settings: CacheSettings,
    file_cache: FileCache,
    value_cache: ValueCache,
    sweeper: Arc<ArchiveSweeper>,
    error_store: Arc<ErrorStore>,
    events: MetricsSender,
    trigger: Arc<Notify>,
}

impl CacheCoordinator {
    pub fn new(
        connector_id: impl Into<String>,
        data_folder: &Path,
        settings: CacheSettings,
        error_store: Arc<ErrorStore>,
        events: MetricsSender,
    ) -> Self {
        let connector_id = connector_id.into();
        let paths = CachePaths::for_connector(data_folder, &connector_id);

        let file_cache = FileCache::new(
            connector_id.clone(),
            &paths.cache_root,
            paths.archive_dir.clone(),
            error_store.clone(),
        );
        let value_cache = ValueCache::new(
            connector_id.clone(),
            paths.cache_root.join("values"),
            error_store.clone(),
        );
        let sweeper = Arc::new(ArchiveSweeper::new(
            connector_id.clone(),
            paths.archive_dir,
            &settings.archive,
        ));

        Self {
            connector_id,
            settings,
            file_cache,
            value_cache,
            sweeper,
            error_store,
            events,
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Wakes the delivery loop ahead of its next tick.
    pub fn trigger(&self) -> Arc<Notify> {
        self.trigger.clone()
    }

    /// Rebuild both caches from disk.
    pub async fn start(&self) -> Result<()> {
        self.file_cache.start().await?;
        self.value_cache.start().await?;
        if self.settings.archive.enabled {
            let archived = self.file_cache.list_archive_files().await?;
            info!(
                connector = %self.connector_id,
                count = archived.len(),
                bytes = archived.iter().map(|f| f.size).sum::<u64>(),
                "Files in archive"
            );
        }
        self.emit_cache_size().await;
        Ok(())
    }

    /// Start the archive retention sweep when archiving is on.
    pub fn start_archive_sweeper(&self, cancel_token: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.settings.archive.enabled {
            return None;
        }
        self.sweeper.clone().start_background_task(cancel_token)
    }

    pub fn sweeper(&self) -> &Arc<ArchiveSweeper> {
        &self.sweeper
    }

    /// Cache a file acquired by a south connector.
    pub async fn add_content(&self, path: &Path) -> Result<CachedFile> {
        self.ensure_room().await?;
        let file = self.file_cache.cache_file(path).await?;
        self.emit_cache_size().await;
        if self.settings.send_file_immediately {
            self.trigger.notify_one();
        }
        Ok(file)
    }

    /// Cache values acquired by a south connector.
    pub async fn add_values(&self, source_id: &str, values: Vec<PointValue>) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }
        self.ensure_room().await?;
        let cached = self.value_cache.cache_values(source_id, values).await?;
        self.emit_cache_size().await;

        let group_count = self.settings.group_count;
        if group_count > 0 && self.value_cache.get_number_of_values().await >= group_count {
            debug!(connector = %self.connector_id, group_count, "Group count reached");
            self.trigger.notify_one();
        }
        Ok(cached.len())
    }

    async fn ensure_room(&self) -> Result<()> {
        let limit_bytes = self.settings.max_size_bytes();
        if limit_bytes == 0 {
            return Ok(());
        }
        let used_bytes = self.cache_bytes().await;
        if used_bytes >= limit_bytes {
            debug!(connector = %self.connector_id, used_bytes, limit_bytes, "Cache full, refusing data");
            return Err(CacheError::CacheFull {
                used_bytes,
                limit_bytes,
            }
            .into());
        }
        Ok(())
    }

    pub async fn retrieve_file_from_cache(&self) -> Result<Option<CachedFile>> {
        Ok(self.file_cache.retrieve_file_from_cache().await?)
    }

    pub async fn retrieve_values_from_cache(&self, max: usize) -> Vec<CachedValue> {
        self.value_cache.retrieve_values_from_cache(max).await
    }

    pub async fn remove_file_from_cache(&self, file: &CachedFile, archive: bool) -> Result<()> {
        self.file_cache.remove_file_from_cache(file, archive).await?;
        self.emit_cache_size().await;
        Ok(())
    }

    /// Acknowledge a delivered file, archiving it when archiving is on.
    pub async fn ack_file(&self, file: &CachedFile) -> Result<()> {
        self.remove_file_from_cache(file, self.settings.archive.enabled)
            .await
    }

    pub async fn manage_errored_files(&self, file: &CachedFile) -> Result<()> {
        self.file_cache.manage_errored_files(file).await?;
        self.emit_cache_size().await;
        Ok(())
    }

    pub async fn remove_values_from_cache(&self, values: &[CachedValue]) -> usize {
        let removed = self.value_cache.remove_values_from_cache(values).await;
        self.emit_cache_size().await;
        removed
    }

    pub async fn manage_errored_values(&self, values: &[CachedValue]) -> Result<usize> {
        let moved = self.value_cache.manage_errored_values(values).await?;
        self.emit_cache_size().await;
        Ok(moved)
    }

    /// Retry file moves and segment rewrites that failed on an earlier tick.
    pub async fn retry_pending_resolutions(&self) {
        let files = self.file_cache.retry_deferred().await;
        let segments = self.value_cache.flush_dirty_segments().await;
        if files > 0 || segments > 0 {
            debug!(connector = %self.connector_id, files, segments, "Cache operations still failing");
        }
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.value_cache.is_empty().await && self.file_cache.is_empty().await?)
    }

    pub async fn get_number_of_values(&self) -> usize {
        self.value_cache.get_number_of_values().await
    }

    pub async fn cache_bytes(&self) -> u64 {
        self.file_cache.size_bytes() + self.value_cache.size_bytes().await
    }

    async fn emit_cache_size(&self) {
        emit(
            &self.events,
            MetricsEvent::CacheSize {
                connector_id: self.connector_id.clone(),
                cache_bytes: self.cache_bytes().await,
                error_bytes: self.error_store.size_bytes(&self.connector_id).await,
                timestamp: Utc::now(),
            },
        );
    }

    // ========== Error store management ==========

    pub async fn list_error_files(&self, filter: &ErrorFileFilter) -> Result<Vec<ErrorFileInfo>> {
        Ok(self.error_store.list_files(&self.connector_id, filter).await?)
    }

    pub async fn remove_error_files(&self, names: &[String]) -> Result<usize> {
        let removed = self.error_store.remove_files(&self.connector_id, names).await?;
        self.emit_cache_size().await;
        Ok(removed)
    }

    pub async fn remove_all_error_files(&self) -> Result<usize> {
        let removed = self.error_store.remove_all_files(&self.connector_id).await?;
        self.emit_cache_size().await;
        Ok(removed)
    }

    pub async fn retry_error_files(&self, names: &[String]) -> Result<usize> {
        let retried = self.file_cache.retry_error_files(names).await?;
        self.emit_cache_size().await;
        Ok(retried)
    }

    pub async fn retry_all_error_files(&self) -> Result<usize> {
        let retried = self.file_cache.retry_all_error_files().await?;
        self.emit_cache_size().await;
        Ok(retried)
    }

    pub async fn list_error_values(&self, filter: &ErrorFileFilter) -> Result<Vec<ErrorFileInfo>> {
        Ok(self
            .error_store
            .list_value_segments(&self.connector_id, filter)
            .await?)
    }

    pub async fn remove_error_values(&self, segments: &[String]) -> Result<usize> {
        Ok(self
            .error_store
            .remove_value_segments(&self.connector_id, segments)
            .await?)
    }

    pub async fn retry_error_values(&self, segments: &[String]) -> Result<usize> {
        let retried = self.value_cache.retry_error_values(segments).await?;
        self.emit_cache_size().await;
        Ok(retried)
    }

    // ========== Archive management ==========

    pub async fn list_archive_files(&self) -> Result<Vec<ErrorFileInfo>> {
        Ok(self.file_cache.list_archive_files().await?)
    }

    pub async fn retry_archive_files(&self, names: &[String]) -> Result<usize> {
        if names.is_empty() {
            return Ok(0);
        }
        let retried = self.file_cache.retry_archive_files(names).await?;
        info!(connector = %self.connector_id, count = retried, "Archived files moved back to cache");
        self.emit_cache_size().await;
        Ok(retried)
    }

    pub async fn remove_archive_files(&self, names: &[String]) -> Result<usize> {
        Ok(self.file_cache.remove_archive_files(names).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::metrics::metrics_channel;
    use north_cache::ArchiveConfig;
    use serde_json::json;
    use tempfile::TempDir;

    async fn coordinator(settings: CacheSettings) -> (TempDir, CacheCoordinator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ErrorStore::new(dir.path().join("error")));
        let (tx, _rx) = metrics_channel();
        let coordinator = CacheCoordinator::new("n1", dir.path(), settings, store, tx);
        coordinator.start().await.unwrap();
        (dir, coordinator)
    }

    #[test]
    fn test_cache_paths_layout() {
        let paths = CachePaths::for_connector(Path::new("/data"), "hist");
        assert_eq!(paths.cache_root, PathBuf::from("/data/cache/north-hist"));
        assert_eq!(paths.archive_dir, PathBuf::from("/data/archive/north-hist"));
    }

    #[tokio::test]
    async fn test_group_count_wakes_delivery() {
        let (_dir, coordinator) = coordinator(CacheSettings::default().with_group_count(2)).await;
        let trigger = coordinator.trigger();

        coordinator
            .add_values("south-1", vec![PointValue::new("a", json!(1))])
            .await
            .unwrap();
        let woken =
            tokio::time::timeout(std::time::Duration::from_millis(50), trigger.notified()).await;
        assert!(woken.is_err());

        coordinator
            .add_values("south-1", vec![PointValue::new("b", json!(2))])
            .await
            .unwrap();
        let woken =
            tokio::time::timeout(std::time::Duration::from_millis(50), trigger.notified()).await;
        assert!(woken.is_ok());
    }

    #[tokio::test]
    async fn test_cache_full_refuses_new_data() {
        let (dir, coordinator) = coordinator(CacheSettings::default().with_max_size_mb(1)).await;
        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 1024 * 1024]).unwrap();

        coordinator.add_content(&big).await.unwrap();
        let err = coordinator.add_content(&big).await.unwrap_err();
        assert!(matches!(err, Error::Cache(CacheError::CacheFull { .. })));
    }

    #[tokio::test]
    async fn test_ack_file_archives_when_enabled() {
        let settings = CacheSettings::default()
            .with_archive(ArchiveConfig::default().with_enabled(true));
        let (dir, coordinator) = coordinator(settings).await;
        let src = dir.path().join("a.csv");
        std::fs::write(&src, b"a").unwrap();

        let file = coordinator.add_content(&src).await.unwrap();
        coordinator.ack_file(&file).await.unwrap();

        let archived = coordinator.list_archive_files().await.unwrap();
        assert_eq!(archived.len(), 1);
        assert!(coordinator.is_empty().await.unwrap());

        coordinator
            .retry_archive_files(&[archived[0].filename.clone()])
            .await
            .unwrap();
        assert!(!coordinator.is_empty().await.unwrap());
    }
}
