//! Content-addressed metadata cache.
//!
//! Probe results are expensive to recompute (they require header pieces on
//! disk plus an ffprobe run), so they are kept in a JSON file keyed by
//! info-hash and survive restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// File name of the cache within the downloads root.
pub const METADATA_CACHE_FILE: &str = "metadata_cache.json";

/// Cached probe results for one torrent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    #[serde(default)]
    pub info_hash: String,
    pub name: String,
    pub file_name: String,
    pub file_size: u64,
    /// Duration in seconds
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_tracks: usize,
    pub subtitle_tracks: usize,
    pub created_at: SystemTime,
    pub last_access: SystemTime,
    pub access_count: u64,
}

/// JSON-file-backed cache of torrent metadata, keyed by info-hash.
pub struct MetadataCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    path: PathBuf,
}

/// Cache key for an input: the magnet's info-hash when one is present,
/// otherwise a SHA-1 over the whole input.
pub fn cache_key(input: &str) -> String {
    if let Some(hash) = crate::torrent::extract_info_hash(input) {
        return hash;
    }
    let digest = Sha1::digest(input.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl MetadataCache {
    /// Opens the cache at `path`, loading any existing entries.
    ///
    /// A missing or unreadable file starts an empty cache; the cache never
    /// blocks startup.
    pub fn open(path: PathBuf) -> Self {
        let entries = match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<HashMap<String, CacheEntry>>(&data) {
                Ok(entries) => {
                    tracing::info!("metadata cache: loaded {} entries", entries.len());
                    entries
                }
                Err(error) => {
                    tracing::warn!("metadata cache: could not decode {}: {error}", path.display());
                    HashMap::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(error) => {
                tracing::warn!("metadata cache: could not read {}: {error}", path.display());
                HashMap::new()
            }
        };

        Self {
            entries: RwLock::new(entries),
            path,
        }
    }

    /// Looks up the entry for an input, bumping its access accounting.
    ///
    /// The access bump is best-effort: it runs on a detached task and readers
    /// may observe stale `last_access`/`access_count` values.
    pub fn get(self: &Arc<Self>, input: &str) -> Option<CacheEntry> {
        let key = cache_key(input);
        let entry = self.entries.read().ok()?.get(&key).cloned();

        if entry.is_some() {
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                if let Ok(mut entries) = cache.entries.write() {
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.last_access = SystemTime::now();
                        entry.access_count += 1;
                    }
                }
            });
        }

        entry
    }

    /// Inserts or replaces the entry for an input and persists in background.
    pub fn set(self: &Arc<Self>, input: &str, mut entry: CacheEntry) {
        let key = cache_key(input);
        entry.info_hash = key.clone();
        entry.last_access = SystemTime::now();

        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.clone(), entry);
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            cache.save();
        });

        tracing::debug!("metadata cache: stored entry for {}", &key[..8.min(key.len())]);
    }

    /// Removes entries not accessed within `max_age`; returns how many.
    pub fn cleanup(self: &Arc<Self>, max_age: Duration) -> usize {
        let now = SystemTime::now();
        let removed = {
            let Ok(mut entries) = self.entries.write() else {
                return 0;
            };
            let before = entries.len();
            entries.retain(|_, entry| {
                now.duration_since(entry.last_access)
                    .map(|age| age <= max_age)
                    .unwrap_or(true)
            });
            before - entries.len()
        };

        if removed > 0 {
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                cache.save();
            });
            tracing::info!("metadata cache: removed {removed} stale entries");
        }

        removed
    }

    /// Returns (entry count, total accesses, mean accesses per entry).
    pub fn stats(&self) -> (usize, u64, f64) {
        let Ok(entries) = self.entries.read() else {
            return (0, 0, 0.0);
        };
        let total = entries.len();
        let accesses: u64 = entries.values().map(|entry| entry.access_count).sum();
        let mean = if total > 0 {
            accesses as f64 / total as f64
        } else {
            0.0
        };
        (total, accesses, mean)
    }

    fn save(&self) {
        let data = {
            let Ok(entries) = self.entries.read() else {
                return;
            };
            match serde_json::to_vec_pretty(&*entries) {
                Ok(data) => data,
                Err(error) => {
                    tracing::warn!("metadata cache: could not encode: {error}");
                    return;
                }
            }
        };

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(error) = std::fs::write(&self.path, data) {
            tracing::warn!("metadata cache: could not write {}: {error}", self.path.display());
        }
    }
}
