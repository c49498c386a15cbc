//! Centralized configuration for spate.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all spate components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SpateConfig {
    pub server: ServerConfig,
    pub torrent: TorrentConfig,
    pub transcode: TranscodeConfig,
    pub streaming: StreamingConfig,
}

/// HTTP server and stream admission configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen port
    pub port: u16,
    /// Root directory for torrent payloads and HLS output
    pub downloads_dir: PathBuf,
    /// Maximum concurrent streams; admission evicts the oldest beyond this
    pub max_streams: usize,
    /// How long eviction waits for a stream's teardown before giving up
    pub eviction_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            downloads_dir: PathBuf::from("./downloads"),
            max_streams: 2,
            eviction_grace: Duration::from_secs(5),
        }
    }
}

/// Torrent download timing and piece-window configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Deadline for fetching torrent metadata from a magnet
    pub metadata_deadline: Duration,
    /// Bytes pinned at highest priority at the head of the video file
    pub head_window_bytes: u64,
    /// Lower clamp on the head window, in pieces
    pub min_head_pieces: u64,
    /// Upper clamp on the head window, in pieces
    pub max_head_pieces: u64,
    /// Download progress poll interval
    pub poll_interval: Duration,
    /// Sliding-window size for the instantaneous download rate
    pub rate_window: Duration,
    /// Piece prioritizer wake-up interval
    pub prioritizer_tick: Duration,
    /// Bytes kept urgent ahead of the first incomplete piece
    pub prioritizer_window_bytes: u64,
    /// Minimum urgent window, in pieces
    pub prioritizer_min_pieces: u64,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            metadata_deadline: Duration::from_secs(60),
            head_window_bytes: 60 * 1024 * 1024, // 60 MiB
            min_head_pieces: 10,
            max_head_pieces: 2000,
            poll_interval: Duration::from_secs(1),
            rate_window: Duration::from_millis(500),
            prioritizer_tick: Duration::from_secs(2),
            prioritizer_window_bytes: 30 * 1024 * 1024, // 30 MiB
            prioritizer_min_pieces: 5,
        }
    }
}

/// Transcoder process configuration.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    /// Deadline for a worker's first HLS segment to appear
    pub first_segment_deadline: Duration,
    /// How often a worker checks its rendition directory for segments
    pub segment_poll_interval: Duration,
    /// HLS segment target duration in seconds
    pub segment_seconds: u32,
    /// Fixed keyframe cadence in frames; scene-change detection stays off
    pub gop_frames: u32,
    /// Deadline for a single ffprobe invocation
    pub probe_deadline: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            first_segment_deadline: Duration::from_secs(45),
            segment_poll_interval: Duration::from_secs(1),
            segment_seconds: 2,
            gop_frames: 48,
            probe_deadline: Duration::from_secs(3),
        }
    }
}

/// Playlist and segment serving configuration.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Long-poll deadline for a rendition playlist that is not on disk yet
    pub playlist_wait: Duration,
    /// Poll interval while long-polling for a playlist
    pub playlist_poll_interval: Duration,
    /// Overall deadline for a segment to appear and stabilize
    pub segment_wait: Duration,
    /// A file is stable once its size is unchanged for this window
    pub stability_window: Duration,
    /// Poll interval while waiting on a segment file
    pub file_poll_interval: Duration,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            playlist_wait: Duration::from_secs(90),
            playlist_poll_interval: Duration::from_millis(500),
            segment_wait: Duration::from_secs(30),
            stability_window: Duration::from_millis(200),
            file_poll_interval: Duration::from_millis(100),
        }
    }
}

impl SpateConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.server.port = port;
            }
        }

        if let Ok(dir) = std::env::var("SPATE_DOWNLOADS_DIR") {
            config.server.downloads_dir = PathBuf::from(dir);
        }

        if let Ok(max) = std::env::var("SPATE_MAX_STREAMS") {
            if let Ok(max) = max.parse::<usize>() {
                config.server.max_streams = max;
            }
        }

        config
    }

    /// Creates a configuration with short waits, suitable for tests.
    pub fn for_testing(downloads_dir: PathBuf) -> Self {
        Self {
            server: ServerConfig {
                port: 0,
                downloads_dir,
                max_streams: 2,
                eviction_grace: Duration::from_secs(2),
            },
            torrent: TorrentConfig {
                metadata_deadline: Duration::from_secs(5),
                poll_interval: Duration::from_millis(50),
                rate_window: Duration::from_millis(50),
                prioritizer_tick: Duration::from_millis(100),
                ..Default::default()
            },
            transcode: TranscodeConfig {
                first_segment_deadline: Duration::from_secs(5),
                segment_poll_interval: Duration::from_millis(50),
                ..Default::default()
            },
            streaming: StreamingConfig {
                playlist_wait: Duration::from_secs(5),
                playlist_poll_interval: Duration::from_millis(50),
                segment_wait: Duration::from_secs(5),
                stability_window: Duration::from_millis(200),
                file_poll_interval: Duration::from_millis(25),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SpateConfig::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.max_streams, 2);
        assert_eq!(config.torrent.metadata_deadline, Duration::from_secs(60));
        assert_eq!(config.torrent.head_window_bytes, 60 * 1024 * 1024);
        assert_eq!(config.transcode.first_segment_deadline, Duration::from_secs(45));
        assert_eq!(config.streaming.playlist_wait, Duration::from_secs(90));
        assert_eq!(config.streaming.stability_window, Duration::from_millis(200));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("PORT", "9090");
            std::env::set_var("SPATE_MAX_STREAMS", "4");
        }

        let config = SpateConfig::from_env();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.max_streams, 4);

        unsafe {
            std::env::remove_var("PORT");
            std::env::remove_var("SPATE_MAX_STREAMS");
        }
    }
}
