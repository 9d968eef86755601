//! Collision-free names for cached files.
//!
//! A cached name is `{stem}-{unix_millis}-{counter:06}{ext}`. The counter
//! is monotonic per cache, so two files cached in the same millisecond under
//! the same original name still get distinct names.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheNamer {
    counter: AtomicU64,
}

impl CacheNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the next cached name for `original`.
    pub fn next_name(&self, original: &str, unix_millis: i64) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        let (stem, ext) = split_name(original);
        format!("{stem}-{unix_millis}-{counter:06}{ext}")
    }
}

/// Split `file.txt.gz` into `("file.txt", ".gz")`.
fn split_name(original: &str) -> (&str, &str) {
    let path = Path::new(original);
    match (
        path.file_stem().and_then(|s| s.to_str()),
        path.extension().and_then(|s| s.to_str()),
    ) {
        (Some(stem), Some(ext)) => {
            let split = stem.len();
            (&original[..split], &original[split..split + ext.len() + 1])
        }
        (Some(stem), None) => (stem, ""),
        _ => (original, ""),
    }
}

/// Recover the original name from a cached name.
///
/// Returns `None` for names that were not produced by [`CacheNamer`].
pub fn original_name(cached: &str) -> Option<String> {
    let (stem, ext) = split_name(cached);
    let (rest, counter) = stem.rsplit_once('-')?;
    let (original_stem, millis) = rest.rsplit_once('-')?;

    let counter_ok = counter.len() == 6 && counter.bytes().all(|b| b.is_ascii_digit());
    let millis_ok = !millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit());
    if !counter_ok || !millis_ok || original_stem.is_empty() {
        return None;
    }
    Some(format!("{original_stem}{ext}"))
}
