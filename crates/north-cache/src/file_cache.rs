//! Disk-backed FIFO of files awaiting delivery.
//!
//! Layout under the cache root:
//!
//! ```text
//! files/   pending files, oldest modification time first
//! tmp/     copies in progress, never visible to retrieval
//! ```
//!
//! A file leaves `files/` only through a move to the error store or the
//! archive folder, or a delete. When one of those fails the file stays
//! where it is, is no longer handed out, and the move is retried by
//! [`FileCache::retry_deferred`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::error_store::ErrorStore;
use crate::fs::{self, FileEntry};
use crate::naming::{self, CacheNamer};

const MAX_NAME_ATTEMPTS: usize = 16;

/// A file held by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFile {
    pub stored_path: PathBuf,
    pub original_name: String,
    pub created_at: DateTime<Utc>,
}

impl CachedFile {
    fn from_entry(entry: &FileEntry) -> Self {
        Self {
            stored_path: entry.path.clone(),
            original_name: naming::original_name(&entry.name).unwrap_or_else(|| entry.name.clone()),
            created_at: DateTime::<Utc>::from(entry.modified),
        }
    }

    /// Name of the file inside the cache.
    pub fn cached_name(&self) -> String {
        self.stored_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Terminal move that failed and is waiting for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deferred {
    Quarantine,
    Archive,
    Delete,
}

#[derive(Debug, Default)]
struct State {
    deferred: BTreeMap<PathBuf, Deferred>,
}

pub struct FileCache {
    connector_id: String,
    files_dir: PathBuf,
    staging_dir: PathBuf,
    archive_dir: PathBuf,
    error_store: Arc<ErrorStore>,
    namer: CacheNamer,
    size_bytes: AtomicU64,
    state: Mutex<State>,
}

impl FileCache {
    pub fn new(
        connector_id: impl Into<String>,
        cache_root: &Path,
        archive_dir: impl Into<PathBuf>,
        error_store: Arc<ErrorStore>,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            files_dir: cache_root.join("files"),
            staging_dir: cache_root.join("tmp"),
            archive_dir: archive_dir.into(),
            error_store,
            namer: CacheNamer::new(),
            size_bytes: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Create folders, clear interrupted copies and log what is pending.
    pub async fn start(&self) -> Result<()> {
        fs::ensure_dir_all("creating cache folder", &self.files_dir).await?;
        fs::ensure_dir_all("creating cache folder", &self.staging_dir).await?;
        self.error_store.prepare(&self.connector_id).await?;

        for leftover in fs::list_files(&self.staging_dir).await? {
            debug!(connector = %self.connector_id, file = %leftover.name, "Removing interrupted copy");
            fs::remove_if_exists(&leftover.path).await?;
        }

        let pending = fs::list_files(&self.files_dir).await?;
        self.size_bytes
            .store(pending.iter().map(|e| e.size).sum(), Ordering::Relaxed);
        let errored = self.error_store.file_names(&self.connector_id).await?.len();

        if pending.is_empty() {
            debug!(connector = %self.connector_id, "No file in cache");
        } else {
            info!(connector = %self.connector_id, count = pending.len(), "Files to send in cache");
        }
        if errored > 0 {
            warn!(connector = %self.connector_id, count = errored, "Files in error cache");
        }
        Ok(())
    }

    /// Copy `source` into the pending area.
    ///
    /// The copy is staged and fsynced before it appears in `files/`; on any
    /// failure the source is left untouched.
    pub async fn cache_file(&self, source: &Path) -> Result<CachedFile> {
        let original_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CacheError::InvalidName(source.display().to_string()))?;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let name = self
                .namer
                .next_name(&original_name, Utc::now().timestamp_millis());
            let staged = self.staging_dir.join(&name);

            let size = match copy_into(source, &staged).await {
                Ok(size) => size,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&staged).await;
                    return Err(CacheError::io("copying file into cache", source, e));
                }
            };

            let target = self.files_dir.join(&name);
            let _state = self.state.lock().await;
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                let _ = tokio::fs::remove_file(&staged).await;
                continue;
            }
            if let Err(e) = tokio::fs::rename(&staged, &target).await {
                let _ = tokio::fs::remove_file(&staged).await;
                return Err(CacheError::io("moving file into cache", &target, e));
            }
            self.size_bytes.fetch_add(size, Ordering::Relaxed);

            debug!(connector = %self.connector_id, file = %original_name, cached = %name, "File cached");
            return Ok(CachedFile {
                stored_path: target,
                original_name,
                created_at: Utc::now(),
            });
        }

        Err(CacheError::io(
            "naming cached file",
            source,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "no free cache name"),
        ))
    }

    /// Pending file with the smallest modification time.
    ///
    /// Files waiting on a deferred move are skipped; so is any file that
    /// cannot be stat'ed.
    pub async fn retrieve_file_from_cache(&self) -> Result<Option<CachedFile>> {
        let state = self.state.lock().await;
        let entries = fs::list_files(&self.files_dir).await?;

        Ok(entries
            .iter()
            .filter(|entry| !state.deferred.contains_key(&entry.path))
            .min_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)))
            .map(CachedFile::from_entry))
    }

    /// Move a file to the error store. Calling it again for a file already
    /// quarantined succeeds without doing anything.
    pub async fn manage_errored_files(&self, file: &CachedFile) -> Result<()> {
        let mut state = self.state.lock().await;
        self.resolve_locked(&mut state, &file.stored_path, Deferred::Quarantine)
            .await
    }

    /// Acknowledge a delivered file: archive it or delete it.
    pub async fn remove_file_from_cache(&self, file: &CachedFile, archive: bool) -> Result<()> {
        let action = if archive {
            Deferred::Archive
        } else {
            Deferred::Delete
        };
        let mut state = self.state.lock().await;
        self.resolve_locked(&mut state, &file.stored_path, action).await
    }

    /// Retry every deferred move. Returns how many are still deferred.
    pub async fn retry_deferred(&self) -> usize {
        let mut state = self.state.lock().await;
        let pending: Vec<(PathBuf, Deferred)> =
            state.deferred.iter().map(|(p, a)| (p.clone(), *a)).collect();

        for (path, action) in pending {
            if let Err(e) = self.resolve_locked(&mut state, &path, action).await {
                debug!(connector = %self.connector_id, error = %e, "Deferred move still failing");
            }
        }
        state.deferred.len()
    }

    /// Number of files waiting on a deferred move.
    pub async fn deferred_count(&self) -> usize {
        self.state.lock().await.deferred.len()
    }

    /// Whether no pending file can be retrieved.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.retrieve_file_from_cache().await?.is_none())
    }

    /// Number of files in the pending area, deferred ones included.
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(fs::list_files(&self.files_dir).await?.len())
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Move quarantined files back into the pending area.
    pub async fn retry_error_files(&self, names: &[String]) -> Result<usize> {
        let _state = self.state.lock().await;
        let mut retried = 0;
        for name in names {
            let path = self
                .error_store
                .take_file(&self.connector_id, name, &self.files_dir)
                .await?;
            self.track_added(&path).await;
            retried += 1;
        }
        info!(connector = %self.connector_id, count = retried, "Error files moved back to cache");
        Ok(retried)
    }

    pub async fn retry_all_error_files(&self) -> Result<usize> {
        let names = self.error_store.file_names(&self.connector_id).await?;
        self.retry_error_files(&names).await
    }

    /// Archived files, oldest first.
    pub async fn list_archive_files(&self) -> Result<Vec<crate::ErrorFileInfo>> {
        if !tokio::fs::try_exists(&self.archive_dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut files: Vec<crate::ErrorFileInfo> = fs::list_files(&self.archive_dir)
            .await?
            .into_iter()
            .map(|entry| crate::ErrorFileInfo {
                modification_date: DateTime::<Utc>::from(entry.modified),
                filename: entry.name,
                size: entry.size,
            })
            .collect();
        files.sort_by(|a, b| a.modification_date.cmp(&b.modification_date));
        Ok(files)
    }

    /// Move archived files back into the pending area to send them again.
    pub async fn retry_archive_files(&self, names: &[String]) -> Result<usize> {
        let _state = self.state.lock().await;
        let mut retried = 0;
        for name in names {
            let source = self.archive_dir.join(fs::checked_name(name)?);
            let target = self.files_dir.join(name);
            fs::move_file(&source, &target).await?;
            self.track_added(&target).await;
            retried += 1;
        }
        Ok(retried)
    }

    pub async fn remove_archive_files(&self, names: &[String]) -> Result<usize> {
        let mut removed = 0;
        for name in names {
            fs::remove_if_exists(&self.archive_dir.join(fs::checked_name(name)?)).await?;
            removed += 1;
        }
        Ok(removed)
    }

    async fn track_added(&self, path: &Path) {
        if let Ok(metadata) = tokio::fs::metadata(path).await {
            self.size_bytes.fetch_add(metadata.len(), Ordering::Relaxed);
        }
    }

    /// Perform a terminal move, recording it as deferred when it fails.
    async fn resolve_locked(&self, state: &mut State, path: &Path, action: Deferred) -> Result<()> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CacheError::InvalidName(path.display().to_string()))?;

        let size = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                state.deferred.remove(path);
                return self.already_resolved(&name, action).await;
            }
            Err(e) => {
                state.deferred.insert(path.to_path_buf(), action);
                return Err(CacheError::io("reading cached file", path, e));
            }
        };

        let result = match action {
            Deferred::Quarantine => self
                .error_store
                .store_file(&self.connector_id, path)
                .await
                .map(|_| ()),
            Deferred::Archive => async {
                fs::ensure_dir_all("creating archive folder", &self.archive_dir).await?;
                fs::move_file(path, &self.archive_dir.join(&name)).await
            }
            .await,
            Deferred::Delete => fs::remove_if_exists(path).await,
        };

        match result {
            Ok(()) => {
                state.deferred.remove(path);
                self.size_bytes
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                        Some(v.saturating_sub(size))
                    })
                    .ok();
                match action {
                    Deferred::Quarantine => {
                        warn!(connector = %self.connector_id, file = %name, "File moved to error store")
                    }
                    Deferred::Archive => {
                        debug!(connector = %self.connector_id, file = %name, "File archived")
                    }
                    Deferred::Delete => {
                        debug!(connector = %self.connector_id, file = %name, "File removed from cache")
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    connector = %self.connector_id,
                    file = %name,
                    action = ?action,
                    error = %e,
                    "Failed to move file out of cache, will retry"
                );
                state.deferred.insert(path.to_path_buf(), action);
                Err(e)
            }
        }
    }

    /// The source is gone; succeed only if it already reached its destination.
    async fn already_resolved(&self, name: &str, action: Deferred) -> Result<()> {
        let reached = match action {
            Deferred::Quarantine => self.error_store.contains_file(&self.connector_id, name).await,
            Deferred::Archive => tokio::fs::try_exists(self.archive_dir.join(name))
                .await
                .unwrap_or(false),
            Deferred::Delete => true,
        };
        if reached {
            Ok(())
        } else {
            Err(CacheError::not_found(format!("cached file {name}")))
        }
    }
}

/// Copy into a new file that must not already exist, then fsync it.
async fn copy_into(source: &Path, staged: &Path) -> std::io::Result<u64> {
    let mut target = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(staged)
        .await?;
    let mut source = tokio::fs::File::open(source).await?;
    let size = tokio::io::copy(&mut source, &mut target).await?;
    target.flush().await?;
    target.sync_all().await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<ErrorStore>,
        cache: FileCache,
    }

    async fn setup() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ErrorStore::new(dir.path().join("error")));
        let cache = FileCache::new(
            "n1",
            &dir.path().join("cache"),
            dir.path().join("archive"),
            store.clone(),
        );
        cache.start().await.unwrap();
        Fixture { dir, store, cache }
    }

    fn source(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn set_mtime(path: &Path, secs_ago: u64) {
        let when = SystemTime::now() - Duration::from_secs(secs_ago);
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[tokio::test]
    async fn test_cached_bytes_round_trip() {
        let f = setup().await;
        let bytes: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        let src = source(&f.dir, "dump.bin", &bytes);

        let cached = f.cache.cache_file(&src).await.unwrap();

        assert_eq!(cached.original_name, "dump.bin");
        assert!(cached.cached_name().ends_with(".bin"));
        assert_eq!(std::fs::read(&cached.stored_path).unwrap(), bytes);
        assert_eq!(std::fs::read(&src).unwrap(), bytes);
        assert_eq!(f.cache.size_bytes(), bytes.len() as u64);
    }

    #[tokio::test]
    async fn test_missing_source_fails_cleanly() {
        let f = setup().await;
        let err = f
            .cache
            .cache_file(&f.dir.path().join("absent.csv"))
            .await
            .unwrap_err();

        assert!(err.is_filesystem());
        assert!(f.cache.is_empty().await.unwrap());
        assert_eq!(std::fs::read_dir(f.dir.path().join("cache/tmp")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_retrieve_oldest_first() {
        let f = setup().await;
        let mut cached = Vec::new();
        for (name, age) in [("t2.csv", 200), ("t1.csv", 300), ("t3.csv", 100)] {
            let file = f.cache.cache_file(&source(&f.dir, name, b"x")).await.unwrap();
            set_mtime(&file.stored_path, age);
            cached.push(file);
        }

        for expected in ["t1.csv", "t2.csv", "t3.csv"] {
            let next = f.cache.retrieve_file_from_cache().await.unwrap().unwrap();
            assert_eq!(next.original_name, expected);
            f.cache.remove_file_from_cache(&next, false).await.unwrap();
        }
        assert!(f.cache.retrieve_file_from_cache().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_and_delete_are_terminal() {
        let f = setup().await;
        let a = f.cache.cache_file(&source(&f.dir, "a.csv", b"a")).await.unwrap();
        let b = f.cache.cache_file(&source(&f.dir, "b.csv", b"b")).await.unwrap();

        f.cache.remove_file_from_cache(&a, true).await.unwrap();
        f.cache.remove_file_from_cache(&b, false).await.unwrap();

        assert!(!a.stored_path.exists());
        assert!(f.cache.archive_dir().join(a.cached_name()).exists());
        assert!(!b.stored_path.exists());
        assert!(!f.cache.archive_dir().join(b.cached_name()).exists());
        assert!(f.cache.is_empty().await.unwrap());
        assert_eq!(f.cache.size_bytes(), 0);
    }

    #[tokio::test]
    async fn test_quarantine_is_idempotent() {
        let f = setup().await;
        let file = f.cache.cache_file(&source(&f.dir, "bad.json", b"{")).await.unwrap();

        for _ in 0..3 {
            f.cache.manage_errored_files(&file).await.unwrap();
            assert!(f.store.contains_file("n1", &file.cached_name()).await);
        }
        assert!(f.cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_same_millisecond_calls_do_not_collide() {
        let f = setup().await;
        let src = source(&f.dir, "burst.csv", b"same");

        let (a, b) = tokio::join!(f.cache.cache_file(&src), f.cache.cache_file(&src));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.stored_path, b.stored_path);
        assert!(a.stored_path.exists());
        assert!(b.stored_path.exists());
        assert_eq!(f.cache.pending_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failed_archive_is_deferred_and_retried() {
        let f = setup().await;
        let file = f.cache.cache_file(&source(&f.dir, "a.csv", b"a")).await.unwrap();

        // A regular file where the archive folder should be blocks the move.
        let archive = f.cache.archive_dir().to_path_buf();
        std::fs::write(&archive, b"not a directory").unwrap();

        assert!(f.cache.remove_file_from_cache(&file, true).await.is_err());
        assert!(file.stored_path.exists());
        assert!(f.cache.retrieve_file_from_cache().await.unwrap().is_none());
        assert_eq!(f.cache.deferred_count().await, 1);

        std::fs::remove_file(&archive).unwrap();
        assert_eq!(f.cache.retry_deferred().await, 0);
        assert!(archive.join(file.cached_name()).exists());
    }

    #[tokio::test]
    async fn test_failed_quarantine_is_deferred_and_retried() {
        let f = setup().await;
        let bad = f.cache.cache_file(&source(&f.dir, "bad.csv", b"x")).await.unwrap();
        let good = f.cache.cache_file(&source(&f.dir, "good.csv", b"y")).await.unwrap();

        // A regular file where the error folder should be blocks the move.
        let errors = f.store.files_dir("n1");
        std::fs::remove_dir_all(&errors).unwrap();
        std::fs::write(&errors, b"not a directory").unwrap();

        assert!(f.cache.manage_errored_files(&bad).await.is_err());
        assert!(bad.stored_path.exists());
        assert_eq!(f.cache.deferred_count().await, 1);

        // The rest of the queue keeps flowing.
        let next = f.cache.retrieve_file_from_cache().await.unwrap().unwrap();
        assert_eq!(next.stored_path, good.stored_path);

        std::fs::remove_file(&errors).unwrap();
        assert_eq!(f.cache.retry_deferred().await, 0);
        assert!(!bad.stored_path.exists());
        assert!(f.store.contains_file("n1", &bad.cached_name()).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_entries_are_skipped() {
        let f = setup().await;
        let file = f.cache.cache_file(&source(&f.dir, "a.csv", b"a")).await.unwrap();
        let dangling = f.cache.files_dir().join("gone-0-000000.csv");
        std::os::unix::fs::symlink(f.dir.path().join("missing"), &dangling).unwrap();

        let next = f.cache.retrieve_file_from_cache().await.unwrap().unwrap();
        assert_eq!(next.stored_path, file.stored_path);

        f.cache.remove_file_from_cache(&file, false).await.unwrap();
        assert!(f.cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_retry_error_files_requeues() {
        let f = setup().await;
        let file = f.cache.cache_file(&source(&f.dir, "a.csv", b"a")).await.unwrap();
        f.cache.manage_errored_files(&file).await.unwrap();

        assert_eq!(f.cache.retry_all_error_files().await.unwrap(), 1);
        let back = f.cache.retrieve_file_from_cache().await.unwrap().unwrap();
        assert_eq!(back.original_name, "a.csv");
    }

    #[tokio::test]
    async fn test_start_clears_interrupted_copies() {
        let f = setup().await;
        let staged = f.dir.path().join("cache/tmp/half-1-000000.csv");
        std::fs::write(&staged, b"partial").unwrap();

        f.cache.start().await.unwrap();
        assert!(!staged.exists());
    }
}
