//! Production torrent backend over librqbit.
//!
//! librqbit does not export a per-piece priority call; what it does export is
//! stream-position-driven prioritization: pieces around the cursor of an open
//! `FileStream` are fetched first. The adapter therefore keeps one stream
//! pinned to the chosen video file and seeks it to the head of each urgent
//! window, which produces the forward-ordered fetch behavior the pipeline
//! needs. Piece completion is derived from contiguous per-file byte
//! completion; it can under-report when pieces arrive out of order, which the
//! caller's probe and file-size gates absorb.

use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use librqbit::api::TorrentIdOrHash;
use librqbit::{
    AddTorrent, AddTorrentOptions, ManagedTorrent, Session, SessionOptions,
    SessionPersistenceConfig,
};
use tokio::io::{AsyncSeek, AsyncSeekExt};
use tokio::sync::Mutex;

use super::{
    PiecePriority, TorrentBackend, TorrentError, TorrentFileInfo, TorrentJob, TorrentStats,
};

/// Directory under the downloads root holding the engine's own session state.
///
/// Preserved across stream cleanup so resumes survive restarts.
pub const SESSION_STATE_DIR: &str = ".session";

/// librqbit-backed torrent engine, one session per process.
pub struct RqbitBackend {
    session: Arc<Session>,
}

impl RqbitBackend {
    /// Creates the engine session with `downloads_dir` as its data directory.
    ///
    /// # Errors
    /// - `TorrentError::EngineFailure` - Session could not be initialized
    pub async fn new(downloads_dir: &Path) -> Result<Self, TorrentError> {
        let persistence = SessionPersistenceConfig::Json {
            folder: Some(downloads_dir.join(SESSION_STATE_DIR)),
        };
        let options = SessionOptions {
            persistence: Some(persistence),
            ..Default::default()
        };

        let session = Session::new_with_opts(downloads_dir.to_path_buf(), options)
            .await
            .map_err(|error| TorrentError::EngineFailure {
                reason: format!("session init: {error}"),
            })?;

        tracing::info!("torrent engine initialized (data dir {})", downloads_dir.display());
        Ok(Self { session })
    }
}

#[async_trait]
impl TorrentBackend for RqbitBackend {
    async fn add_magnet(&self, magnet: &str) -> Result<Box<dyn TorrentJob>, TorrentError> {
        let response = self
            .session
            .add_torrent(
                AddTorrent::from_url(magnet),
                Some(AddTorrentOptions {
                    overwrite: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|error| TorrentError::InvalidMagnet {
                reason: error.to_string(),
            })?;

        let handle = response
            .into_handle()
            .ok_or_else(|| TorrentError::EngineFailure {
                reason: "engine returned no torrent handle".to_string(),
            })?;

        Ok(Box::new(RqbitJob {
            session: Arc::clone(&self.session),
            handle,
            meta: OnceLock::new(),
            cursor: Mutex::new(None),
            dropped: AtomicBool::new(false),
        }))
    }
}

struct JobMeta {
    name: String,
    files: Vec<TorrentFileInfo>,
    piece_length: u64,
    num_pieces: u64,
}

/// Cursor pinned to the chosen file; seeking it steers the engine's
/// piece scheduling.
struct StreamCursor {
    file_index: usize,
    stream: Pin<Box<dyn AsyncSeek + Send>>,
}

struct RqbitJob {
    session: Arc<Session>,
    handle: Arc<ManagedTorrent>,
    meta: OnceLock<JobMeta>,
    cursor: Mutex<Option<StreamCursor>>,
    dropped: AtomicBool,
}

impl RqbitJob {
    fn meta(&self) -> Option<&JobMeta> {
        self.meta.get()
    }

    fn load_meta(&self) -> Result<(), TorrentError> {
        if self.meta.get().is_some() {
            return Ok(());
        }

        let metadata = self.handle.metadata.load();
        let metadata = metadata.as_ref().ok_or_else(|| TorrentError::EngineFailure {
            reason: "metadata missing after initialization".to_string(),
        })?;

        let name = metadata
            .name
            .clone()
            .unwrap_or_else(|| self.handle.name().unwrap_or_default());

        let details: Vec<(String, u64)> = metadata
            .info
            .iter_file_details()
            .map_err(|error| TorrentError::EngineFailure {
                reason: format!("file listing: {error}"),
            })?
            .filter_map(|file| {
                let filename = file.filename.to_string().ok()?;
                Some((filename, file.len))
            })
            .collect();

        // Multi-file torrents land under a directory named after the torrent;
        // single-file torrents sit directly in the downloads root.
        let multi_file = details.len() > 1;
        let mut offset = 0u64;
        let files = details
            .into_iter()
            .enumerate()
            .map(|(index, (filename, length))| {
                let path = if multi_file {
                    format!("{name}/{filename}")
                } else {
                    filename
                };
                let file = TorrentFileInfo {
                    index,
                    path,
                    length,
                    offset,
                };
                offset += length;
                file
            })
            .collect();

        let lengths = &metadata.lengths;
        let _ = self.meta.set(JobMeta {
            name,
            files,
            piece_length: u64::from(lengths.default_piece_length()),
            num_pieces: u64::from(lengths.total_pieces()),
        });
        Ok(())
    }

    /// File-relative byte span of a global piece range, clipped to the file.
    fn piece_range_to_file_offset(&self, pieces: &Range<u64>, file: &TorrentFileInfo) -> u64 {
        let piece_length = self.piece_length();
        let start_byte = pieces.start.saturating_mul(piece_length);
        start_byte.saturating_sub(file.offset).min(file.length)
    }
}

#[async_trait]
impl TorrentJob for RqbitJob {
    async fn await_info(&self, deadline: Duration) -> Result<(), TorrentError> {
        match tokio::time::timeout(deadline, self.handle.wait_until_initialized()).await {
            Ok(Ok(())) => self.load_meta(),
            Ok(Err(error)) => Err(TorrentError::EngineFailure {
                reason: error.to_string(),
            }),
            Err(_) => Err(TorrentError::MetadataTimeout),
        }
    }

    fn name(&self) -> String {
        self.meta().map(|meta| meta.name.clone()).unwrap_or_default()
    }

    fn files(&self) -> Vec<TorrentFileInfo> {
        self.meta().map(|meta| meta.files.clone()).unwrap_or_default()
    }

    fn num_pieces(&self) -> u64 {
        self.meta().map(|meta| meta.num_pieces).unwrap_or(0)
    }

    fn piece_length(&self) -> u64 {
        self.meta().map(|meta| meta.piece_length).unwrap_or(0)
    }

    fn bytes_completed(&self, file_index: usize) -> u64 {
        self.handle
            .stats()
            .file_progress
            .get(file_index)
            .copied()
            .unwrap_or(0)
    }

    async fn request_full_download(&self, file_index: usize) -> Result<(), TorrentError> {
        let file = self
            .files()
            .into_iter()
            .find(|file| file.index == file_index)
            .ok_or(TorrentError::FileNotFound { index: file_index })?;

        // The engine fetches every file by default; what this call pins down
        // is the cursor that steers piece scheduling toward this file.
        let mut cursor = self.cursor.lock().await;
        if cursor.as_ref().map(|cursor| cursor.file_index) != Some(file_index) {
            let stream =
                self.handle
                    .clone()
                    .stream(file_index)
                    .map_err(|error| TorrentError::EngineFailure {
                        reason: format!("open stream for {}: {error}", file.path),
                    })?;
            *cursor = Some(StreamCursor {
                file_index,
                stream: Box::pin(stream),
            });
        }
        Ok(())
    }

    async fn set_piece_priority(&self, pieces: Range<u64>, priority: PiecePriority) {
        // The engine never demotes on its own and the pipeline never asks it
        // to; only urgency marks translate into cursor movement.
        if priority != PiecePriority::NowUrgent || pieces.is_empty() {
            return;
        }

        let mut cursor = self.cursor.lock().await;
        let Some(cursor) = cursor.as_mut() else {
            return;
        };
        let Some(file) = self
            .meta()
            .and_then(|meta| meta.files.get(cursor.file_index))
            .cloned()
        else {
            return;
        };

        let offset = self.piece_range_to_file_offset(&pieces, &file);
        if let Err(error) = cursor.stream.seek(SeekFrom::Start(offset)).await {
            tracing::debug!("priority cursor seek failed: {error}");
        }
    }

    fn piece_complete(&self, index: u64) -> bool {
        let Some(meta) = self.meta() else {
            return false;
        };
        let piece_length = meta.piece_length;
        if piece_length == 0 {
            return false;
        }

        let piece_end = (index + 1).saturating_mul(piece_length);
        let progress = self.handle.stats().file_progress;
        meta.files.iter().any(|file| {
            let file_end = file.offset + file.length;
            if piece_end <= file.offset || index.saturating_mul(piece_length) >= file_end {
                return false;
            }
            let needed = piece_end.min(file_end) - file.offset;
            progress.get(file.index).copied().unwrap_or(0) >= needed
        })
    }

    fn stats(&self) -> TorrentStats {
        let stats = self.handle.stats();
        stats
            .live
            .as_ref()
            .map(|live| TorrentStats {
                active_peers: live.snapshot.peer_stats.live as usize,
                bytes_read: live.snapshot.fetched_bytes,
            })
            .unwrap_or_default()
    }

    async fn shutdown(&self) {
        if self.dropped.swap(true, Ordering::SeqCst) {
            tracing::warn!("torrent already detached, ignoring repeat shutdown");
            return;
        }

        self.cursor.lock().await.take();

        let id = TorrentIdOrHash::Id(self.handle.id());
        if let Err(error) = self.session.delete(id, false).await {
            tracing::warn!("torrent detach failed: {error}");
        }
    }
}
