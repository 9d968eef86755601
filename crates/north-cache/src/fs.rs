//! Filesystem helpers shared by the caches.
//!
//! Every helper attaches the operation and path to the error so log lines
//! can be diagnosed without the file at hand.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{CacheError, Result};

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| CacheError::io(op, path, e))
}

/// Move a file, falling back to copy + fsync + rename + unlink across devices.
///
/// The destination's modification time is carried over so archive retention
/// keeps measuring from the original write.
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(from = %from.display(), to = %to.display(), "Cross-device move, copying");
            let from = from.to_path_buf();
            let to = to.to_path_buf();
            let (from_err, to_err) = (from.clone(), to.clone());
            tokio::task::spawn_blocking(move || copy_across_devices(&from, &to))
                .await
                .map_err(|e| CacheError::io("moving file", &from_err, io::Error::other(e)))?
                .map_err(|e| CacheError::io("moving file", &to_err, e))
        }
        Err(e) => Err(CacheError::io("moving file", from, e)),
    }
}

fn copy_across_devices(from: &Path, to: &Path) -> io::Result<()> {
    let staged = staged_path(to);
    let modified = std::fs::metadata(from)?.modified()?;

    std::fs::copy(from, &staged)?;
    let file = std::fs::OpenOptions::new().write(true).open(&staged)?;
    file.set_modified(modified)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&staged, to)?;
    std::fs::remove_file(from)
}

/// Temporary sibling used while a file is written.
pub fn staged_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write bytes durably: temp file, fsync, rename over the target.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let staged = staged_path(path);
    let result = async {
        let mut file = tokio::fs::File::create(&staged).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&staged, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(CacheError::io("writing file", path, e));
    }
    Ok(())
}

/// Remove a file, treating an already missing file as success.
pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io("removing file", path, e)),
    }
}

/// Regular file entry of a directory listing.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// List the regular files of a directory.
///
/// Entries whose metadata cannot be read are logged and skipped; only a
/// failure to read the directory itself is returned.
pub async fn list_files(dir: &Path) -> Result<Vec<FileEntry>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| CacheError::io("reading directory", dir, e))?;
    let mut files = Vec::new();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(CacheError::io("reading directory", dir, e)),
        };
        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to stat file, skipping");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read mtime, skipping");
                continue;
            }
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        files.push(FileEntry {
            path,
            name,
            size: metadata.len(),
            modified,
        });
    }

    Ok(files)
}

/// Reject names that would escape the directory they are resolved in.
pub fn checked_name(name: &str) -> Result<&str> {
    let path = Path::new(name);
    if name.is_empty() || path.file_name().and_then(|n| n.to_str()) != Some(name) {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.json");

        write_atomic(&path, b"[1,2,3]").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"[1,2,3]");
        assert!(!staged_path(&path).exists());
    }

    #[tokio::test]
    async fn test_move_file_keeps_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a.txt");
        let to = dir.path().join("b.txt");
        std::fs::write(&from, b"data").unwrap();
        let past = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        std::fs::File::options()
            .write(true)
            .open(&from)
            .unwrap()
            .set_modified(past)
            .unwrap();

        move_file(&from, &to).await.unwrap();

        assert!(!from.exists());
        assert_eq!(std::fs::metadata(&to).unwrap().modified().unwrap(), past);
    }

    #[tokio::test]
    async fn test_list_files_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("one.csv"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = list_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "one.csv");
    }

    #[test]
    fn test_checked_name_rejects_traversal() {
        assert!(checked_name("file.csv").is_ok());
        assert!(checked_name("../file.csv").is_err());
        assert!(checked_name("a/b").is_err());
        assert!(checked_name("").is_err());
    }
}
