//! Durable ordered buffer of values awaiting delivery.
//!
//! Every `cache_values` call is persisted as one segment file named after
//! the first sequence number it holds (`{first_seq:020}.segment.json`).
//! Segments are written with temp file + fsync + rename, so a crash never
//! leaves a half-written segment behind. The in-memory index mirrors the
//! segments and is rebuilt from disk by [`ValueCache::start`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::error_store::ErrorStore;
use crate::fs;

const SEGMENT_SUFFIX: &str = ".segment.json";

/// A value handed in by an acquisition driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub point_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl PointValue {
    pub fn new(point_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            point_id: point_id.into(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// A value held by the cache, tagged with its source and insertion sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    pub seq: u64,
    pub source_id: String,
    pub point_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    seqs: BTreeSet<u64>,
    bytes: u64,
    /// The file on disk still holds values already removed from memory.
    dirty: bool,
}

#[derive(Debug, Default)]
struct State {
    values: BTreeMap<u64, CachedValue>,
    /// Keyed by the first sequence number of the segment.
    segments: BTreeMap<u64, Segment>,
    next_seq: u64,
}

impl State {
    fn segment_key(&self, seq: u64) -> Option<u64> {
        self.segments
            .range(..=seq)
            .next_back()
            .filter(|(_, segment)| segment.seqs.contains(&seq))
            .map(|(key, _)| *key)
    }

    fn size_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.bytes).sum()
    }
}

/// Ordered value store owned by one north connector.
pub struct ValueCache {
    connector_id: String,
    dir: PathBuf,
    error_store: Arc<ErrorStore>,
    state: Mutex<State>,
}

impl ValueCache {
    pub fn new(
        connector_id: impl Into<String>,
        dir: impl Into<PathBuf>,
        error_store: Arc<ErrorStore>,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            dir: dir.into(),
            error_store,
            state: Mutex::new(State::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rebuild the index from disk.
    ///
    /// Leftover temp files are deleted, unreadable segments are renamed to
    /// `*.corrupt` and skipped, and values already present in the error
    /// store are dropped from pending.
    pub async fn start(&self) -> Result<()> {
        fs::ensure_dir_all("creating value cache folder", &self.dir).await?;
        let mut state = self.state.lock().await;
        *state = State::default();

        let mut entries = fs::list_files(&self.dir).await?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        for entry in entries {
            if entry.name.ends_with(".tmp") {
                debug!(connector = %self.connector_id, file = %entry.name, "Removing leftover temp file");
                fs::remove_if_exists(&entry.path).await?;
                continue;
            }
            if !entry.name.ends_with(SEGMENT_SUFFIX) {
                continue;
            }

            let values: Vec<CachedValue> = match read_values(&entry.path).await {
                Ok(values) => values,
                Err(e) => {
                    warn!(
                        connector = %self.connector_id,
                        file = %entry.name,
                        error = %e,
                        "Corrupt value segment, setting aside"
                    );
                    let mut aside = entry.path.clone().into_os_string();
                    aside.push(".corrupt");
                    if let Err(e) = fs::move_file(&entry.path, Path::new(&aside)).await {
                        warn!(connector = %self.connector_id, error = %e, "Failed to set corrupt segment aside");
                    }
                    continue;
                }
            };

            let Some(first) = values.iter().map(|v| v.seq).min() else {
                fs::remove_if_exists(&entry.path).await?;
                continue;
            };
            state.segments.insert(
                first,
                Segment {
                    path: entry.path.clone(),
                    seqs: values.iter().map(|v| v.seq).collect(),
                    bytes: entry.size,
                    dirty: false,
                },
            );
            for value in values {
                state.values.insert(value.seq, value);
            }
        }

        let quarantined = self.error_store.quarantined_sequences(&self.connector_id).await?;
        let already_moved: Vec<u64> = state
            .values
            .keys()
            .filter(|seq| quarantined.contains(seq))
            .copied()
            .collect();
        if !already_moved.is_empty() {
            info!(
                connector = %self.connector_id,
                count = already_moved.len(),
                "Dropping pending values already in the error store"
            );
            self.remove_locked(&mut state, &already_moved).await;
        }

        let highest_pending = state.values.keys().next_back().copied();
        let highest_quarantined = quarantined.last().copied();
        state.next_seq = highest_pending
            .max(highest_quarantined)
            .map_or(0, |seq| seq + 1);

        info!(
            connector = %self.connector_id,
            values = state.values.len(),
            segments = state.segments.len(),
            "Value cache ready"
        );
        Ok(())
    }

    /// Append values from `source_id`. Returns once the segment is on disk.
    pub async fn cache_values(
        &self,
        source_id: &str,
        values: Vec<PointValue>,
    ) -> Result<Vec<CachedValue>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock().await;
        let first = state.next_seq;
        let cached: Vec<CachedValue> = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| CachedValue {
                seq: first + i as u64,
                source_id: source_id.to_string(),
                point_id: value.point_id,
                timestamp: value.timestamp,
                payload: value.payload,
            })
            .collect();

        let bytes = serde_json::to_vec(&cached)?;
        let path = self.dir.join(format!("{first:020}{SEGMENT_SUFFIX}"));
        fs::write_atomic(&path, &bytes).await?;

        state.next_seq = first + cached.len() as u64;
        state.segments.insert(
            first,
            Segment {
                path,
                seqs: cached.iter().map(|v| v.seq).collect(),
                bytes: bytes.len() as u64,
                dirty: false,
            },
        );
        for value in &cached {
            state.values.insert(value.seq, value.clone());
        }

        debug!(connector = %self.connector_id, source = %source_id, count = cached.len(), "Cached values");
        Ok(cached)
    }

    /// Up to `max` oldest values, in insertion order.
    pub async fn retrieve_values_from_cache(&self, max: usize) -> Vec<CachedValue> {
        let state = self.state.lock().await;
        state.values.values().take(max).cloned().collect()
    }

    /// Acknowledge delivered values. Unknown or already removed values are ignored.
    pub async fn remove_values_from_cache(&self, values: &[CachedValue]) -> usize {
        let seqs: Vec<u64> = values.iter().map(|v| v.seq).collect();
        let mut state = self.state.lock().await;
        self.remove_locked(&mut state, &seqs).await
    }

    /// Move values to the error store and out of pending.
    ///
    /// The error store is written first; if that fails nothing is removed,
    /// so a value is never in both or in neither.
    pub async fn manage_errored_values(&self, values: &[CachedValue]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let pending: Vec<CachedValue> = values
            .iter()
            .filter_map(|v| state.values.get(&v.seq).cloned())
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        self.error_store.store_values(&self.connector_id, &pending).await?;
        let seqs: Vec<u64> = pending.iter().map(|v| v.seq).collect();
        let removed = self.remove_locked(&mut state, &seqs).await;

        warn!(
            connector = %self.connector_id,
            count = removed,
            first_seq = seqs.first().copied().unwrap_or_default(),
            "Values moved to error store"
        );
        Ok(removed)
    }

    /// Re-append quarantined segments as new pending values.
    pub async fn retry_error_values(&self, segment_names: &[String]) -> Result<usize> {
        let mut retried = 0;
        for name in segment_names {
            let values = self.error_store.read_value_segment(&self.connector_id, name).await?;
            let by_source = group_by_source(values);
            for (source_id, points) in by_source {
                retried += self.cache_values(&source_id, points).await?.len();
            }
            self.error_store
                .remove_value_segments(&self.connector_id, std::slice::from_ref(name))
                .await?;
        }
        Ok(retried)
    }

    /// Rewrite segments whose earlier rewrite failed. Returns how many remain dirty.
    pub async fn flush_dirty_segments(&self) -> usize {
        let mut state = self.state.lock().await;
        let dirty: Vec<u64> = state
            .segments
            .iter()
            .filter(|(_, s)| s.dirty)
            .map(|(k, _)| *k)
            .collect();
        for key in dirty {
            self.sync_segment(&mut state, key).await;
        }
        state.segments.values().filter(|s| s.dirty).count()
    }

    pub async fn get_number_of_values(&self) -> usize {
        self.state.lock().await.values.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.values.is_empty()
    }

    /// Bytes used by the segment files.
    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.size_bytes()
    }

    async fn remove_locked(&self, state: &mut State, seqs: &[u64]) -> usize {
        let mut touched = BTreeSet::new();
        let mut removed = 0;

        for seq in seqs {
            let Some(key) = state.segment_key(*seq) else {
                continue;
            };
            if state.values.remove(seq).is_some() {
                removed += 1;
            }
            if let Some(segment) = state.segments.get_mut(&key) {
                segment.seqs.remove(seq);
            }
            touched.insert(key);
        }

        for key in touched {
            self.sync_segment(state, key).await;
        }
        removed
    }

    /// Make a segment file match its in-memory membership.
    async fn sync_segment(&self, state: &mut State, key: u64) {
        let Some(segment) = state.segments.get(&key) else {
            return;
        };

        if segment.seqs.is_empty() {
            match fs::remove_if_exists(&segment.path).await {
                Ok(()) => {
                    state.segments.remove(&key);
                }
                Err(e) => {
                    warn!(connector = %self.connector_id, error = %e, "Failed to delete acked segment");
                    if let Some(segment) = state.segments.get_mut(&key) {
                        segment.dirty = true;
                    }
                }
            }
            return;
        }

        let remaining: Vec<&CachedValue> = segment
            .seqs
            .iter()
            .filter_map(|seq| state.values.get(seq))
            .collect();
        let result = match serde_json::to_vec(&remaining) {
            Ok(bytes) => fs::write_atomic(&segment.path, &bytes)
                .await
                .map(|()| bytes.len() as u64),
            Err(e) => Err(CacheError::from(e)),
        };

        if let Some(segment) = state.segments.get_mut(&key) {
            match result {
                Ok(bytes) => {
                    segment.bytes = bytes;
                    segment.dirty = false;
                }
                Err(e) => {
                    warn!(connector = %self.connector_id, error = %e, "Failed to rewrite segment, will retry");
                    segment.dirty = true;
                }
            }
        }
    }
}

fn group_by_source(values: Vec<CachedValue>) -> Vec<(String, Vec<PointValue>)> {
    let mut groups: Vec<(String, Vec<PointValue>)> = Vec::new();
    for value in values {
        let point = PointValue {
            point_id: value.point_id,
            timestamp: value.timestamp,
            payload: value.payload,
        };
        match groups.last_mut() {
            Some((source, points)) if *source == value.source_id => points.push(point),
            _ => groups.push((value.source_id, vec![point])),
        }
    }
    groups
}

async fn read_values(path: &Path) -> Result<Vec<CachedValue>> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CacheError::io("reading value segment", path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}
