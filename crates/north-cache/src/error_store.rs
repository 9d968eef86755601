//! Process-wide quarantine store.
//!
//! One [`ErrorStore`] is built at startup and shared by every north cache.
//! Each connector gets its own area:
//!
//! ```text
//! <root>/north-<id>/files/    quarantined files, cached names kept
//! <root>/north-<id>/values/   quarantined values, one JSON segment per call
//! ```
//!
//! Writers are serialized by the store itself.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::fs;
use crate::value_cache::CachedValue;

const VALUE_SEGMENT_SUFFIX: &str = ".json";

/// Metadata of a quarantined file or value segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFileInfo {
    pub filename: String,
    pub modification_date: DateTime<Utc>,
    pub size: u64,
}

/// Listing filter for quarantined entries.
#[derive(Debug, Clone, Default)]
pub struct ErrorFileFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring match on the file name.
    pub name_contains: Option<String>,
}

impl ErrorFileFilter {
    fn matches(&self, name: &str, modified: DateTime<Utc>) -> bool {
        if self.from.is_some_and(|from| modified < from) {
            return false;
        }
        if self.to.is_some_and(|to| modified > to) {
            return false;
        }
        match &self.name_contains {
            Some(needle) => name.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

#[derive(Debug)]
pub struct ErrorStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ErrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_dir(&self, connector_id: &str) -> PathBuf {
        self.root.join(format!("north-{connector_id}")).join("files")
    }

    pub fn values_dir(&self, connector_id: &str) -> PathBuf {
        self.root.join(format!("north-{connector_id}")).join("values")
    }

    /// Create the connector's area.
    pub async fn prepare(&self, connector_id: &str) -> Result<()> {
        fs::ensure_dir_all("creating error folder", &self.files_dir(connector_id)).await?;
        fs::ensure_dir_all("creating error folder", &self.values_dir(connector_id)).await
    }

    /// Move a cached file into quarantine, keeping its cached name.
    pub async fn store_file(&self, connector_id: &str, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| CacheError::InvalidName(path.display().to_string()))?;
        let _guard = self.write_lock.lock().await;

        let dir = self.files_dir(connector_id);
        fs::ensure_dir_all("creating error folder", &dir).await?;
        let target = dir.join(name);
        fs::move_file(path, &target).await?;
        Ok(target)
    }

    /// Whether a file with this cached name is in quarantine.
    pub async fn contains_file(&self, connector_id: &str, name: &str) -> bool {
        let Ok(name) = fs::checked_name(name) else {
            return false;
        };
        tokio::fs::try_exists(self.files_dir(connector_id).join(name))
            .await
            .unwrap_or(false)
    }

    /// List quarantined files matching `filter`, oldest first.
    pub async fn list_files(
        &self,
        connector_id: &str,
        filter: &ErrorFileFilter,
    ) -> Result<Vec<ErrorFileInfo>> {
        list_matching(&self.files_dir(connector_id), filter).await
    }

    /// Delete the named quarantined files. Missing names are skipped.
    pub async fn remove_files(&self, connector_id: &str, names: &[String]) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let dir = self.files_dir(connector_id);
        let mut removed = 0;
        for name in names {
            let path = dir.join(fs::checked_name(name)?);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                fs::remove_if_exists(&path).await?;
                removed += 1;
            }
        }
        info!(connector = %connector_id, count = removed, "Removed error files");
        Ok(removed)
    }

    pub async fn remove_all_files(&self, connector_id: &str) -> Result<usize> {
        let names = self.file_names(connector_id).await?;
        self.remove_files(connector_id, &names).await
    }

    /// Names of every quarantined file.
    pub async fn file_names(&self, connector_id: &str) -> Result<Vec<String>> {
        Ok(fs::list_files(&self.files_dir(connector_id))
            .await?
            .into_iter()
            .map(|entry| entry.name)
            .collect())
    }

    /// Move a quarantined file out of the store into `dest_dir`.
    pub async fn take_file(
        &self,
        connector_id: &str,
        name: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf> {
        let name = fs::checked_name(name)?;
        let _guard = self.write_lock.lock().await;

        let source = self.files_dir(connector_id).join(name);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(CacheError::not_found(format!("error file {name}")));
        }
        let target = dest_dir.join(name);
        fs::move_file(&source, &target).await?;
        debug!(connector = %connector_id, file = %name, "Took file out of error store");
        Ok(target)
    }

    /// Persist quarantined values as one segment.
    ///
    /// The segment is named after its sequence range, so writing the same
    /// values twice rewrites the same segment.
    pub async fn store_values(
        &self,
        connector_id: &str,
        values: &[CachedValue],
    ) -> Result<PathBuf> {
        let (Some(first), Some(last)) = (
            values.iter().map(|v| v.seq).min(),
            values.iter().map(|v| v.seq).max(),
        ) else {
            return Err(CacheError::not_found("values to quarantine"));
        };
        let bytes = serde_json::to_vec(values)?;
        let _guard = self.write_lock.lock().await;

        let dir = self.values_dir(connector_id);
        fs::ensure_dir_all("creating error folder", &dir).await?;
        let path = dir.join(format!("{first:020}-{last:020}{VALUE_SEGMENT_SUFFIX}"));
        fs::write_atomic(&path, &bytes).await?;
        Ok(path)
    }

    /// Sequence numbers of every quarantined value.
    ///
    /// Unreadable segments are logged and skipped.
    pub async fn quarantined_sequences(&self, connector_id: &str) -> Result<BTreeSet<u64>> {
        let dir = self.values_dir(connector_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(BTreeSet::new());
        }

        let mut seqs = BTreeSet::new();
        for entry in fs::list_files(&dir).await? {
            if !entry.name.ends_with(VALUE_SEGMENT_SUFFIX) {
                continue;
            }
            match read_segment(&entry.path).await {
                Ok(values) => seqs.extend(values.iter().map(|v| v.seq)),
                Err(e) => warn!(path = %entry.path.display(), error = %e, "Unreadable error segment"),
            }
        }
        Ok(seqs)
    }

    pub async fn list_value_segments(
        &self,
        connector_id: &str,
        filter: &ErrorFileFilter,
    ) -> Result<Vec<ErrorFileInfo>> {
        let mut segments = list_matching(&self.values_dir(connector_id), filter).await?;
        segments.retain(|info| info.filename.ends_with(VALUE_SEGMENT_SUFFIX));
        Ok(segments)
    }

    pub async fn read_value_segment(
        &self,
        connector_id: &str,
        name: &str,
    ) -> Result<Vec<CachedValue>> {
        let name = fs::checked_name(name)?;
        read_segment(&self.values_dir(connector_id).join(name)).await
    }

    pub async fn remove_value_segments(
        &self,
        connector_id: &str,
        names: &[String],
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let dir = self.values_dir(connector_id);
        let mut removed = 0;
        for name in names {
            let path = dir.join(fs::checked_name(name)?);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                fs::remove_if_exists(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Bytes used by the connector's area.
    pub async fn size_bytes(&self, connector_id: &str) -> u64 {
        let mut total = 0;
        for dir in [self.files_dir(connector_id), self.values_dir(connector_id)] {
            if let Ok(entries) = fs::list_files(&dir).await {
                total += entries.iter().map(|e| e.size).sum::<u64>();
            }
        }
        total
    }
}

async fn read_segment(path: &Path) -> Result<Vec<CachedValue>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CacheError::io("reading value segment", path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn list_matching(dir: &Path, filter: &ErrorFileFilter) -> Result<Vec<ErrorFileInfo>> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let mut infos: Vec<ErrorFileInfo> = fs::list_files(dir)
        .await?
        .into_iter()
        .map(|entry| ErrorFileInfo {
            modification_date: DateTime::<Utc>::from(entry.modified),
            filename: entry.name,
            size: entry.size,
        })
        .filter(|info| filter.matches(&info.filename, info.modification_date))
        .collect();
    infos.sort_by(|a, b| a.modification_date.cmp(&b.modification_date));
    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(seq: u64) -> CachedValue {
        CachedValue {
            seq,
            source_id: "south-1".to_string(),
            point_id: format!("p{seq}"),
            timestamp: Utc::now(),
            payload: json!({ "value": seq }),
        }
    }

    #[tokio::test]
    async fn test_store_and_list_files_with_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = ErrorStore::new(dir.path().join("error"));
        store.prepare("n1").await.unwrap();

        for name in ["Report-1-000000.csv", "other-1-000001.txt"] {
            let src = dir.path().join(name);
            std::fs::write(&src, b"x").unwrap();
            store.store_file("n1", &src).await.unwrap();
            assert!(!src.exists());
        }

        let filter = ErrorFileFilter {
            name_contains: Some("report".to_string()),
            ..Default::default()
        };
        let files = store.list_files("n1", &filter).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "Report-1-000000.csv");

        let filter = ErrorFileFilter {
            from: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(store.list_files("n1", &filter).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_file_moves_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ErrorStore::new(dir.path().join("error"));
        let src = dir.path().join("a-1-000000.csv");
        std::fs::write(&src, b"payload").unwrap();
        store.store_file("n1", &src).await.unwrap();

        let dest = dir.path().join("pending");
        std::fs::create_dir_all(&dest).unwrap();
        let back = store.take_file("n1", "a-1-000000.csv", &dest).await.unwrap();

        assert_eq!(std::fs::read(back).unwrap(), b"payload");
        assert!(!store.contains_file("n1", "a-1-000000.csv").await);
        assert!(store.take_file("n1", "a-1-000000.csv", &dest).await.is_err());
    }

    #[tokio::test]
    async fn test_store_values_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ErrorStore::new(dir.path());
        let values = vec![value(3), value(4)];

        let first = store.store_values("n1", &values).await.unwrap();
        let second = store.store_values("n1", &values).await.unwrap();
        assert_eq!(first, second);

        let seqs = store.quarantined_sequences("n1").await.unwrap();
        assert_eq!(seqs.into_iter().collect::<Vec<_>>(), vec![3, 4]);
        let segments = store
            .list_value_segments("n1", &ErrorFileFilter::default())
            .await
            .unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ErrorStore::new(dir.path().join("error"));
        for i in 0..3 {
            let src = dir.path().join(format!("f{i}-1-00000{i}.bin"));
            std::fs::write(&src, b"x").unwrap();
            store.store_file("n1", &src).await.unwrap();
        }

        assert_eq!(store.remove_all_files("n1").await.unwrap(), 3);
        assert!(store.file_names("n1").await.unwrap().is_empty());
    }
}
