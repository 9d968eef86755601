//! Cache error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the caches and the error store.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error while {op} ({}): {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache full: {used_bytes} bytes used, limit is {limit_bytes} bytes")]
    CacheFull { used_bytes: u64, limit_bytes: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

impl CacheError {
    pub fn io(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Disk-level failures that are retried on the next tick.
    pub fn is_filesystem(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}
