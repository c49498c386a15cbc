//! Bounded registry of active streams.
//!
//! Capacity is enforced at admission: when full, the stream with the oldest
//! creation time is cancelled and fully torn down before the newcomer is
//! inserted. There is no queue of pending magnets.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::controller::{StreamContext, StreamHandle, spawn_stream};
use crate::cache::METADATA_CACHE_FILE;
use crate::torrent::parse_input;
use crate::torrent::rqbit::SESSION_STATE_DIR;

/// Errors surfaced by stream admission.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Eviction could not finish inside the grace window; try again.
    #[error("Could not make room for a new stream: {reason}")]
    Transient { reason: String },
}

/// Registry counters for monitoring.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStats {
    pub active_streams: usize,
    /// Total bytes on disk under the downloads root
    pub disk_bytes: u64,
}

/// Map of live streams with capacity eviction.
pub struct StreamRegistry {
    ctx: Arc<StreamContext>,
    streams: RwLock<HashMap<String, Arc<StreamHandle>>>,
}

impl StreamRegistry {
    pub fn new(ctx: Arc<StreamContext>) -> Self {
        Self {
            ctx,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Collaborator bundle shared with the HTTP layer.
    pub fn context(&self) -> &Arc<StreamContext> {
        &self.ctx
    }

    /// Admits a new stream for the given magnet or info-hash.
    ///
    /// If the registry is full, the oldest stream by creation time is torn
    /// down first; a stream in `Ready` enjoys no protection. If that stream
    /// later fails, the evicted one is not re-admitted.
    ///
    /// # Errors
    /// - `RegistryError::Transient` - Eviction missed the grace window
    pub async fn admit(&self, input: &str) -> Result<Arc<StreamHandle>, RegistryError> {
        let magnet = parse_input(input);

        if let Some(cached) = self.ctx.cache.get(&magnet) {
            tracing::info!(
                "cache hit: {} ({}x{})",
                cached.name,
                cached.width,
                cached.height
            );
        }

        let mut streams = self.streams.write().await;

        while streams.len() >= self.ctx.config.server.max_streams {
            let oldest_id = streams
                .values()
                .min_by_key(|handle| handle.created_at)
                .map(|handle| handle.id.clone());
            let Some(oldest_id) = oldest_id else {
                break;
            };
            let Some(victim) = streams.remove(&oldest_id) else {
                break;
            };

            tracing::info!(
                "registry full ({} streams), evicting oldest {oldest_id}",
                self.ctx.config.server.max_streams
            );
            victim.request_stop();
            if !victim
                .await_teardown(self.ctx.config.server.eviction_grace)
                .await
            {
                return Err(RegistryError::Transient {
                    reason: format!("stream {oldest_id} did not tear down in time"),
                });
            }
            self.remove_stream_files(&victim, true);
        }

        let id = Uuid::new_v4().to_string();
        let handle = spawn_stream(Arc::clone(&self.ctx), id.clone(), magnet);
        streams.insert(id.clone(), Arc::clone(&handle));
        tracing::info!("stream {id} admitted");

        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<StreamHandle>> {
        self.streams.read().await.get(id).cloned()
    }

    /// Stops and removes a stream. Idempotent: unknown ids are fine.
    pub async fn stop(&self, id: &str) {
        let victim = self.streams.write().await.remove(id);
        let Some(victim) = victim else {
            tracing::debug!("stop for unknown stream {id}");
            return;
        };

        victim.request_stop();
        if !victim
            .await_teardown(self.ctx.config.server.eviction_grace)
            .await
        {
            tracing::warn!("stream {id} teardown exceeded grace window");
        }
        self.remove_stream_files(&victim, false);
        tracing::info!("stream {id} removed");
    }

    /// Process-shutdown path: stops every stream and wipes the downloads
    /// root, preserving the torrent engine's own state and the metadata cache.
    pub async fn stop_all(&self) {
        let victims: Vec<Arc<StreamHandle>> = {
            let mut streams = self.streams.write().await;
            streams.drain().map(|(_, handle)| handle).collect()
        };

        for victim in &victims {
            victim.request_stop();
        }
        for victim in &victims {
            let _ = victim
                .await_teardown(self.ctx.config.server.eviction_grace)
                .await;
        }

        let downloads = &self.ctx.config.server.downloads_dir;
        if let Ok(entries) = std::fs::read_dir(downloads) {
            for entry in entries.filter_map(|entry| entry.ok()) {
                let name = entry.file_name();
                if name == SESSION_STATE_DIR || name == METADATA_CACHE_FILE {
                    continue;
                }
                let path = entry.path();
                let result = if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                };
                if let Err(error) = result {
                    tracing::warn!("cleanup of {} failed: {error}", path.display());
                }
            }
        }

        tracing::info!("all streams stopped, downloads root cleaned");
    }

    /// Active stream count and total bytes on disk.
    pub async fn stats(&self) -> RegistryStats {
        let active_streams = self.streams.read().await.len();
        let disk_bytes = dir_size(&self.ctx.config.server.downloads_dir);
        RegistryStats {
            active_streams,
            disk_bytes,
        }
    }

    /// Deletes a stream's HLS output, and on eviction its torrent payload too.
    fn remove_stream_files(&self, handle: &StreamHandle, include_payload: bool) {
        let downloads = &self.ctx.config.server.downloads_dir;

        let hls_dir = downloads.join(&handle.id);
        if hls_dir.exists() {
            if let Err(error) = std::fs::remove_dir_all(&hls_dir) {
                tracing::warn!("could not remove {}: {error}", hls_dir.display());
            }
        }

        if include_payload {
            if let Some(video_path) = handle.video_file_path() {
                if let Some(payload_dir) = video_path.parent() {
                    if payload_dir != downloads.as_path() && payload_dir.exists() {
                        if let Err(error) = std::fs::remove_dir_all(payload_dir) {
                            tracing::warn!(
                                "could not remove {}: {error}",
                                payload_dir.display()
                            );
                        }
                    }
                }
            }
        }
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|meta| meta.len()).unwrap_or(0)
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::cache::MetadataCache;
    use crate::config::SpateConfig;
    use crate::probe::StaticProber;
    use crate::stream::StreamState;
    use crate::torrent::{SimulatedTorrent, SimulationBackend};
    use crate::transcode::{HwAccel, ScriptedBehavior, ScriptedTranscoder};

    fn test_registry(downloads: PathBuf) -> StreamRegistry {
        let ctx = Arc::new(StreamContext {
            config: SpateConfig::for_testing(downloads.clone()),
            backend: Arc::new(SimulationBackend::new(
                downloads.clone(),
                SimulatedTorrent::quick_video("demo"),
            )),
            prober: Arc::new(StaticProber::plain_1080p()),
            transcoder: Arc::new(ScriptedTranscoder::new(ScriptedBehavior::quick())),
            cache: Arc::new(MetadataCache::open(downloads.join(METADATA_CACHE_FILE))),
            hw_accel: Some(HwAccel::None),
        });
        StreamRegistry::new(ctx)
    }

    const MAGNET: &str = "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    #[tokio::test]
    async fn test_capacity_eviction_removes_oldest() {
        let dir = tempdir().unwrap();
        let registry = test_registry(dir.path().to_path_buf());

        let first = registry.admit(MAGNET).await.unwrap();
        let second = registry.admit(MAGNET).await.unwrap();
        let third = registry.admit(MAGNET).await.unwrap();

        // Capacity 2: the first stream is gone, the newer two remain
        assert!(registry.get(&first.id).await.is_none());
        assert!(registry.get(&second.id).await.is_some());
        assert!(registry.get(&third.id).await.is_some());
        assert_eq!(registry.stats().await.active_streams, 2);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let registry = test_registry(dir.path().to_path_buf());

        let handle = registry.admit(MAGNET).await.unwrap();
        registry.stop(&handle.id).await;
        registry.stop(&handle.id).await;
        registry.stop("never-existed").await;

        assert!(registry.get(&handle.id).await.is_none());
        assert_eq!(handle.status().state, StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_all_preserves_engine_state_and_cache() {
        let dir = tempdir().unwrap();
        let downloads = dir.path().to_path_buf();
        std::fs::create_dir_all(downloads.join(SESSION_STATE_DIR)).unwrap();
        std::fs::write(downloads.join(METADATA_CACHE_FILE), b"{}").unwrap();
        std::fs::write(downloads.join("stray.bin"), b"junk").unwrap();

        let registry = test_registry(downloads.clone());
        let handle = registry.admit(MAGNET).await.unwrap();
        // Give the stream a moment to create its directories
        tokio::time::sleep(Duration::from_millis(200)).await;

        registry.stop_all().await;

        assert!(downloads.join(SESSION_STATE_DIR).exists());
        assert!(downloads.join(METADATA_CACHE_FILE).exists());
        assert!(!downloads.join("stray.bin").exists());
        assert!(!downloads.join(&handle.id).exists());
        assert_eq!(registry.stats().await.active_streams, 0);
    }
}
