//! Deterministic torrent backend for tests and development.
//!
//! Pieces arrive on a fixed schedule and completed byte prefixes are
//! materialized as real (sparse) files under the downloads root, so the
//! probing, transcoding and serving seams can be exercised without a swarm.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    PiecePriority, TorrentBackend, TorrentError, TorrentFileInfo, TorrentJob, TorrentStats,
};

/// One file in a scripted torrent.
#[derive(Debug, Clone)]
pub struct SimulatedFile {
    /// Path relative to the downloads root
    pub path: String,
    pub length: u64,
}

/// Script describing how a simulated torrent behaves.
#[derive(Debug, Clone)]
pub struct SimulatedTorrent {
    pub name: String,
    pub files: Vec<SimulatedFile>,
    pub piece_length: u64,
    /// Delay before metadata "arrives"
    pub info_delay: Duration,
    /// Wall-clock interval between piece arrival batches
    pub piece_interval: Duration,
    /// Pieces completed per batch
    pub pieces_per_batch: u64,
    /// Simulated connected peer count
    pub peers: usize,
}

impl SimulatedTorrent {
    /// A single 64 MiB video file arriving fast enough for tests.
    pub fn quick_video(name: &str) -> Self {
        Self {
            name: name.to_string(),
            files: vec![SimulatedFile {
                path: format!("{name}/{name}.mkv"),
                length: 64 * 1024 * 1024,
            }],
            piece_length: 1024 * 1024,
            info_delay: Duration::from_millis(10),
            piece_interval: Duration::from_millis(10),
            pieces_per_batch: 8,
            peers: 7,
        }
    }

    /// A torrent whose metadata never arrives within any sane deadline.
    pub fn stalled(name: &str) -> Self {
        Self {
            info_delay: Duration::from_secs(3600),
            ..Self::quick_video(name)
        }
    }

    /// A torrent containing no recognizable video file.
    pub fn no_video(name: &str) -> Self {
        Self {
            files: vec![SimulatedFile {
                path: format!("{name}/readme.txt"),
                length: 4096,
            }],
            ..Self::quick_video(name)
        }
    }

    fn total_length(&self) -> u64 {
        self.files.iter().map(|file| file.length).sum()
    }

    fn num_pieces(&self) -> u64 {
        self.total_length().div_ceil(self.piece_length)
    }
}

/// Backend producing one scripted job per added magnet.
pub struct SimulationBackend {
    downloads_dir: PathBuf,
    script: Mutex<SimulatedTorrent>,
    urgent_marks: Arc<Mutex<Vec<Range<u64>>>>,
}

impl SimulationBackend {
    pub fn new(downloads_dir: PathBuf, script: SimulatedTorrent) -> Self {
        Self {
            downloads_dir,
            script: Mutex::new(script),
            urgent_marks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Replaces the script used for subsequently added magnets.
    pub fn set_script(&self, script: SimulatedTorrent) {
        *self.script.lock().expect("script lock poisoned") = script;
    }

    /// All urgent piece ranges marked by any job, in call order.
    pub fn urgent_marks(&self) -> Vec<Range<u64>> {
        self.urgent_marks.lock().expect("mark lock poisoned").clone()
    }
}

#[async_trait]
impl TorrentBackend for SimulationBackend {
    async fn add_magnet(&self, magnet: &str) -> Result<Box<dyn TorrentJob>, TorrentError> {
        if !magnet.starts_with("magnet:") {
            return Err(TorrentError::InvalidMagnet {
                reason: format!("not a magnet link: {magnet}"),
            });
        }

        let script = self.script.lock().expect("script lock poisoned").clone();
        let num_pieces = script.num_pieces() as usize;
        Ok(Box::new(SimulatedJob {
            downloads_dir: self.downloads_dir.clone(),
            script,
            complete: Arc::new(Mutex::new(vec![false; num_pieces])),
            urgent_marks: Arc::clone(&self.urgent_marks),
            feeder_cancel: CancellationToken::new(),
            dropped: AtomicBool::new(false),
        }))
    }
}

struct SimulatedJob {
    downloads_dir: PathBuf,
    script: SimulatedTorrent,
    complete: Arc<Mutex<Vec<bool>>>,
    urgent_marks: Arc<Mutex<Vec<Range<u64>>>>,
    feeder_cancel: CancellationToken,
    dropped: AtomicBool,
}

impl SimulatedJob {
    fn file_infos(&self) -> Vec<TorrentFileInfo> {
        let mut offset = 0u64;
        self.script
            .files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                let info = TorrentFileInfo {
                    index,
                    path: file.path.clone(),
                    length: file.length,
                    offset,
                };
                offset += file.length;
                info
            })
            .collect()
    }

    /// Grows on-disk files to match the contiguous completed prefix.
    fn materialize(
        downloads_dir: &std::path::Path,
        files: &[TorrentFileInfo],
        piece_length: u64,
        complete: &[bool],
    ) {
        let contiguous_pieces = complete.iter().take_while(|done| **done).count() as u64;
        let contiguous_bytes = contiguous_pieces * piece_length;

        for file in files {
            let have = contiguous_bytes
                .saturating_sub(file.offset)
                .min(file.length);
            if have == 0 {
                continue;
            }
            let path = downloads_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Ok(handle) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
            {
                let _ = handle.set_len(have);
            }
        }
    }
}

#[async_trait]
impl TorrentJob for SimulatedJob {
    async fn await_info(&self, deadline: Duration) -> Result<(), TorrentError> {
        if self.script.info_delay >= deadline {
            tokio::time::sleep(deadline).await;
            return Err(TorrentError::MetadataTimeout);
        }
        tokio::time::sleep(self.script.info_delay).await;
        Ok(())
    }

    fn name(&self) -> String {
        self.script.name.clone()
    }

    fn files(&self) -> Vec<TorrentFileInfo> {
        self.file_infos()
    }

    fn num_pieces(&self) -> u64 {
        self.script.num_pieces()
    }

    fn piece_length(&self) -> u64 {
        self.script.piece_length
    }

    fn bytes_completed(&self, file_index: usize) -> u64 {
        let files = self.file_infos();
        let Some(file) = files.get(file_index) else {
            return 0;
        };
        if file.length == 0 {
            return 0;
        }
        let complete = self.complete.lock().expect("piece lock poisoned");
        let piece_length = self.script.piece_length;

        let first = file.offset / piece_length;
        let last = (file.offset + file.length - 1) / piece_length;
        (first..=last)
            .filter(|index| complete.get(*index as usize).copied().unwrap_or(false))
            .map(|index| {
                let piece_start = index * piece_length;
                let piece_end = piece_start + piece_length;
                piece_end.min(file.offset + file.length) - piece_start.max(file.offset)
            })
            .sum()
    }

    async fn request_full_download(&self, file_index: usize) -> Result<(), TorrentError> {
        if file_index >= self.script.files.len() {
            return Err(TorrentError::FileNotFound { index: file_index });
        }

        let script = self.script.clone();
        let complete = Arc::clone(&self.complete);
        let files = self.file_infos();
        let downloads_dir = self.downloads_dir.clone();
        let cancel = self.feeder_cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(script.piece_interval) => {}
                }

                let finished = {
                    let mut complete = complete.lock().expect("piece lock poisoned");
                    let mut marked = 0;
                    for done in complete.iter_mut() {
                        if marked == script.pieces_per_batch {
                            break;
                        }
                        if !*done {
                            *done = true;
                            marked += 1;
                        }
                    }
                    let snapshot = complete.clone();
                    drop(complete);
                    SimulatedJob::materialize(
                        &downloads_dir,
                        &files,
                        script.piece_length,
                        &snapshot,
                    );
                    snapshot.iter().all(|done| *done)
                };

                if finished {
                    return;
                }
            }
        });

        Ok(())
    }

    async fn set_piece_priority(&self, pieces: Range<u64>, priority: PiecePriority) {
        if priority == PiecePriority::NowUrgent {
            self.urgent_marks
                .lock()
                .expect("mark lock poisoned")
                .push(pieces);
        }
    }

    fn piece_complete(&self, index: u64) -> bool {
        self.complete
            .lock()
            .expect("piece lock poisoned")
            .get(index as usize)
            .copied()
            .unwrap_or(false)
    }

    fn stats(&self) -> TorrentStats {
        let complete = self.complete.lock().expect("piece lock poisoned");
        let done = complete.iter().filter(|done| **done).count() as u64;
        TorrentStats {
            active_peers: self.script.peers,
            bytes_read: done * self.script.piece_length,
        }
    }

    async fn shutdown(&self) {
        if self.dropped.swap(true, Ordering::SeqCst) {
            tracing::warn!("simulated torrent already detached, ignoring repeat shutdown");
            return;
        }
        self.feeder_cancel.cancel();
    }
}
