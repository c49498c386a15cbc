//! Torrent engine seam.
//!
//! The BitTorrent protocol itself is delegated to an engine library; the
//! pipeline only relies on the contract expressed here: magnet admission,
//! metadata arrival, per-file byte completion, and "pieces marked urgent are
//! fetched ahead of normal ones". Two implementations exist: a production
//! backend over librqbit and a deterministic simulation for tests.

pub mod prioritizer;
pub mod rqbit;
pub mod simulation;

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;

pub use prioritizer::run_prioritizer;
pub use rqbit::RqbitBackend;
pub use simulation::{SimulatedTorrent, SimulationBackend};

/// Trackers appended when the user supplies a bare info-hash.
pub const DEFAULT_TRACKERS: [&str; 4] = [
    "udp://tracker.opentrackr.org:1337/announce",
    "udp://open.demonii.com:1337/announce",
    "udp://tracker.openbittorrent.com:6969/announce",
    "udp://exodus.desync.com:6969/announce",
];

/// File extensions recognized as video sources.
pub const VIDEO_EXTENSIONS: [&str; 6] = [".mp4", ".mkv", ".avi", ".mov", ".wmv", ".webm"];

/// Fetch urgency for a piece.
///
/// The engine guarantees only that `NowUrgent` pieces are fetched ahead of
/// `Normal` ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiecePriority {
    NowUrgent,
    Normal,
    Off,
}

/// One file within a torrent.
#[derive(Debug, Clone)]
pub struct TorrentFileInfo {
    /// Index within the torrent's file list
    pub index: usize,
    /// Path relative to the downloads root, as the engine lays it out on disk
    pub path: String,
    /// File length in bytes
    pub length: u64,
    /// Byte offset of the file within the torrent's piece space
    pub offset: u64,
}

impl TorrentFileInfo {
    /// Whether the file has a recognized video extension.
    pub fn is_video(&self) -> bool {
        let lower = self.path.to_lowercase();
        VIDEO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }
}

/// Live download statistics for a torrent.
#[derive(Debug, Clone, Copy, Default)]
pub struct TorrentStats {
    /// Currently connected peers
    pub active_peers: usize,
    /// Total payload bytes read from the swarm
    pub bytes_read: u64,
}

/// Errors from the torrent engine seam.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Invalid magnet link: {reason}")]
    InvalidMagnet { reason: String },

    #[error("Timed out waiting for torrent metadata")]
    MetadataTimeout,

    #[error("Torrent engine failure: {reason}")]
    EngineFailure { reason: String },

    #[error("Torrent has no file at index {index}")]
    FileNotFound { index: usize },
}

/// Factory for torrent jobs; one per process.
#[async_trait]
pub trait TorrentBackend: Send + Sync {
    /// Hands a magnet to the engine and returns a job handle.
    ///
    /// The returned job has no metadata yet; callers must `await_info` before
    /// touching files or piece geometry.
    ///
    /// # Errors
    /// - `TorrentError::InvalidMagnet` - Engine rejected the magnet
    /// - `TorrentError::EngineFailure` - Engine could not admit the torrent
    async fn add_magnet(&self, magnet: &str) -> Result<Box<dyn TorrentJob>, TorrentError>;
}

/// One added torrent.
///
/// Metadata accessors (`files`, `num_pieces`, `piece_length`) are valid only
/// after `await_info` has returned Ok.
#[async_trait]
pub trait TorrentJob: Send + Sync {
    /// Waits for torrent metadata, bounded by `deadline`.
    ///
    /// # Errors
    /// - `TorrentError::MetadataTimeout` - Deadline elapsed
    /// - `TorrentError::EngineFailure` - Engine failed while resolving
    async fn await_info(&self, deadline: Duration) -> Result<(), TorrentError>;

    /// Torrent display name.
    fn name(&self) -> String;

    /// Files in torrent order, with on-disk paths relative to the downloads root.
    fn files(&self) -> Vec<TorrentFileInfo>;

    /// Total piece count.
    fn num_pieces(&self) -> u64;

    /// Nominal piece length in bytes.
    fn piece_length(&self) -> u64;

    /// Bytes of the given file already on disk.
    fn bytes_completed(&self, file_index: usize) -> u64;

    /// Asks the engine to fetch the whole file, not just urgent windows.
    ///
    /// # Errors
    /// - `TorrentError::FileNotFound` - Index out of range
    async fn request_full_download(&self, file_index: usize) -> Result<(), TorrentError>;

    /// Marks a piece range (global indices) at the given priority.
    ///
    /// Out-of-range indices are clipped silently.
    async fn set_piece_priority(&self, pieces: Range<u64>, priority: PiecePriority);

    /// Whether a piece (global index) is complete on disk.
    fn piece_complete(&self, index: u64) -> bool;

    /// Live swarm statistics.
    fn stats(&self) -> TorrentStats;

    /// Detaches the torrent from the engine, keeping downloaded data on disk.
    ///
    /// Idempotent: a second call is a logged no-op.
    async fn shutdown(&self);
}

/// Normalizes user input into a magnet link.
///
/// A 40-hex info-hash is wrapped into a magnet with the default tracker set;
/// anything else (including magnets) passes through byte-for-byte.
pub fn parse_input(input: &str) -> String {
    let input = input.trim();

    if input.starts_with("magnet:") {
        return input.to_string();
    }

    if input.len() == 40 && input.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        let mut magnet = format!("magnet:?xt=urn:btih:{input}");
        for tracker in DEFAULT_TRACKERS {
            magnet.push_str("&tr=");
            magnet.push_str(tracker);
        }
        return magnet;
    }

    input.to_string()
}

/// Extracts the lowercase 40-hex info-hash from a magnet link, if present.
pub fn extract_info_hash(input: &str) -> Option<String> {
    let rest = input.split_once("urn:btih:")?.1;
    let hash: String = rest
        .chars()
        .take_while(|ch| ch.is_ascii_hexdigit())
        .collect();
    if hash.len() == 40 {
        Some(hash.to_lowercase())
    } else {
        None
    }
}

/// Picks the largest video file from a torrent's file list.
///
/// Ties keep the first file encountered.
pub fn select_video_file(files: &[TorrentFileInfo]) -> Option<TorrentFileInfo> {
    let mut best: Option<&TorrentFileInfo> = None;
    for file in files {
        if !file.is_video() {
            continue;
        }
        if best.is_none_or(|current| file.length > current.length) {
            best = Some(file);
        }
    }
    best.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_wraps_bare_hash() {
        let hash = "0123456789abcdef0123456789ABCDEF01234567";
        let magnet = parse_input(hash);
        assert!(magnet.starts_with(&format!("magnet:?xt=urn:btih:{hash}")));
        for tracker in DEFAULT_TRACKERS {
            assert!(magnet.contains(tracker));
        }
        // Round-trip: the synthesized magnet carries the same hash
        assert_eq!(
            extract_info_hash(&magnet).unwrap(),
            hash.to_lowercase()
        );
    }

    #[test]
    fn test_parse_input_passes_magnets_through() {
        let magnet = "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa&tr=udp://example:6969";
        assert_eq!(parse_input(magnet), magnet);
        assert_eq!(parse_input(&format!("  {magnet}  ")), magnet);
    }

    #[test]
    fn test_parse_input_leaves_garbage_verbatim() {
        assert_eq!(parse_input("not-a-hash"), "not-a-hash");
        // 39 hex chars is not an info-hash
        assert_eq!(parse_input(&"a".repeat(39)), "a".repeat(39));
    }

    #[test]
    fn test_extract_info_hash() {
        assert_eq!(
            extract_info_hash("magnet:?xt=urn:btih:0123456789ABCDEF0123456789abcdef01234567&tr=x"),
            Some("0123456789abcdef0123456789abcdef01234567".to_string())
        );
        assert_eq!(extract_info_hash("magnet:?xt=urn:btih:short"), None);
        assert_eq!(extract_info_hash("plain text"), None);
    }

    fn file(index: usize, path: &str, length: u64) -> TorrentFileInfo {
        TorrentFileInfo {
            index,
            path: path.to_string(),
            length,
            offset: 0,
        }
    }

    #[test]
    fn test_select_video_file_largest_wins() {
        let files = vec![
            file(0, "sample.mkv", 100),
            file(1, "movie.mkv", 5000),
            file(2, "readme.txt", 9999),
            file(3, "extras/clip.MP4", 300),
        ];
        let chosen = select_video_file(&files).unwrap();
        assert_eq!(chosen.index, 1);
    }

    #[test]
    fn test_select_video_file_tie_keeps_first() {
        let files = vec![file(0, "a.mkv", 100), file(1, "b.mkv", 100)];
        assert_eq!(select_video_file(&files).unwrap().index, 0);
    }

    #[test]
    fn test_select_video_file_none_without_video() {
        let files = vec![file(0, "a.txt", 100), file(1, "b.nfo", 200)];
        assert!(select_video_file(&files).is_none());
    }
}
