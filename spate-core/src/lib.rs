//! spate core - torrent-to-HLS streaming pipeline
//!
//! This crate provides the streaming pipeline: the torrent engine seam with
//! head-of-file prioritization, per-rendition transcoder workers, eager
//! master playlist construction, and the per-stream state machine that
//! interlocks them so partially written output can be served safely.

pub mod cache;
pub mod config;
pub mod hls;
pub mod probe;
pub mod readiness;
pub mod stream;
pub mod torrent;
pub mod tracing_setup;
pub mod transcode;

// Re-export main types for convenient access
pub use cache::{CacheEntry, METADATA_CACHE_FILE, MetadataCache};
pub use config::SpateConfig;
pub use probe::{AudioTrack, FfprobeProber, MediaProber, StaticProber};
pub use stream::{
    RegistryError, StreamContext, StreamHandle, StreamRegistry, StreamState, StreamStatus,
};
pub use torrent::{
    RqbitBackend, SimulatedTorrent, SimulationBackend, TorrentBackend, TorrentError, TorrentJob,
    parse_input,
};
pub use tracing_setup::{CliLogLevel, init_tracing};
pub use transcode::{
    FfmpegTranscoder, HwAccel, ScriptedBehavior, ScriptedTranscoder, TranscodeError, Transcoder,
};
