//! Per-stream state machine types and admission arithmetic.

pub mod controller;
pub mod registry;

use std::path::PathBuf;

pub use controller::{StreamContext, StreamHandle, spawn_stream};
pub use registry::{RegistryError, StreamRegistry};

use crate::probe::AudioTrack;

/// Lifecycle state of a stream.
///
/// Transitions are monotonic: Downloading → Transcoding → Ready, with Error
/// and Stopped as terminal states reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Downloading,
    Transcoding,
    Ready,
    Error,
    Stopped,
}

impl StreamState {
    /// Wire representation used by the status endpoint.
    pub fn as_str(self) -> &'static str {
        match self {
            StreamState::Downloading => "downloading",
            StreamState::Transcoding => "transcoding",
            StreamState::Ready => "ready",
            StreamState::Error => "error",
            StreamState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Error | StreamState::Stopped)
    }

    /// Position in the forward order; terminal states compare above all.
    fn rank(self) -> u8 {
        match self {
            StreamState::Downloading => 0,
            StreamState::Transcoding => 1,
            StreamState::Ready => 2,
            StreamState::Error | StreamState::Stopped => 3,
        }
    }
}

/// Mutable per-stream fields, guarded by the stream's mutex.
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub state: StreamState,
    pub last_error: Option<String>,
    /// Download progress of the chosen video file, 0..100
    pub progress: f64,
    pub peers: usize,
    /// Total payload bytes read from the swarm
    pub downloaded_bytes: u64,
    /// Instantaneous download rate, MB/s
    pub speed_mbps: f64,
    pub file_name: String,
    pub video_file_path: Option<PathBuf>,
    pub hls_root: Option<PathBuf>,
    pub source_width: u32,
    pub source_height: u32,
    pub audio_tracks: Vec<AudioTrack>,
    /// Names of the planned ladder, ascending by bandwidth
    pub planned_renditions: Vec<String>,
    /// Renditions with a first segment on disk, in readiness order
    pub ready_renditions: Vec<String>,
}

impl StreamShared {
    pub(crate) fn new() -> Self {
        Self {
            state: StreamState::Downloading,
            last_error: None,
            progress: 0.0,
            peers: 0,
            downloaded_bytes: 0,
            speed_mbps: 0.0,
            file_name: String::new(),
            video_file_path: None,
            hls_root: None,
            source_width: 0,
            source_height: 0,
            audio_tracks: Vec::new(),
            planned_renditions: Vec::new(),
            ready_renditions: Vec::new(),
        }
    }

    /// Applies a state transition, refusing regressions and writes past a
    /// terminal state. Only the controller and its children call this.
    pub(crate) fn transition(&mut self, next: StreamState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if next.rank() < self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }
}

/// Read-only snapshot of a stream for the status endpoint and serving code.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub id: String,
    pub state: StreamState,
    pub progress: f64,
    pub file_name: String,
    pub last_error: Option<String>,
    pub peers: usize,
    pub downloaded_bytes: u64,
    pub speed_mbps: f64,
    pub source_width: u32,
    pub source_height: u32,
    pub audio_tracks: Vec<AudioTrack>,
    pub planned_renditions: Vec<String>,
    pub ready_renditions: Vec<String>,
    pub hls_root: Option<PathBuf>,
}

/// How aggressively transcoding may start for a file of the given size.
///
/// Larger files start earlier in absolute terms: their header region is a
/// smaller fraction of the whole, and waiting for a fixed percentage would
/// stall 4K sources for minutes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionThresholds {
    pub min_bytes: u64,
    pub min_percent: f64,
}

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Byte/percent gates for starting transcoding.
pub fn admission_thresholds(total_bytes: u64) -> AdmissionThresholds {
    if total_bytes > 15 * GIB {
        AdmissionThresholds {
            min_bytes: 10 * MIB,
            min_percent: 0.1,
        }
    } else if total_bytes > 5 * GIB {
        AdmissionThresholds {
            min_bytes: 15 * MIB,
            min_percent: 0.3,
        }
    } else {
        AdmissionThresholds {
            min_bytes: 20 * MIB,
            min_percent: 1.0,
        }
    }
}

/// Minimum on-disk file size before probing is worth attempting.
pub fn min_probe_file_size(total_bytes: u64) -> u64 {
    if total_bytes > 10 * GIB {
        8 * MIB
    } else {
        10 * MIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_strings() {
        assert_eq!(StreamState::Downloading.as_str(), "downloading");
        assert_eq!(StreamState::Ready.as_str(), "ready");
        assert_eq!(StreamState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut shared = StreamShared::new();
        assert!(shared.transition(StreamState::Transcoding));
        assert!(shared.transition(StreamState::Ready));
        // No going back
        assert!(!shared.transition(StreamState::Downloading));
        assert_eq!(shared.state, StreamState::Ready);
        // Ready → Stopped is allowed
        assert!(shared.transition(StreamState::Stopped));
        // Terminal states reject everything
        assert!(!shared.transition(StreamState::Ready));
        assert!(!shared.transition(StreamState::Error));
        assert_eq!(shared.state, StreamState::Stopped);
    }

    #[test]
    fn test_error_reachable_from_any_state() {
        let mut shared = StreamShared::new();
        assert!(shared.transition(StreamState::Error));
        assert_eq!(shared.state, StreamState::Error);

        let mut shared = StreamShared::new();
        shared.transition(StreamState::Transcoding);
        assert!(shared.transition(StreamState::Error));
    }

    #[test]
    fn test_admission_thresholds_by_size() {
        let small = admission_thresholds(2 * GIB);
        assert_eq!(small.min_bytes, 20 * MIB);
        assert_eq!(small.min_percent, 1.0);

        let boundary = admission_thresholds(5 * GIB);
        assert_eq!(boundary.min_bytes, 20 * MIB);

        let large = admission_thresholds(10 * GIB);
        assert_eq!(large.min_bytes, 15 * MIB);
        assert_eq!(large.min_percent, 0.3);

        let huge = admission_thresholds(20 * GIB);
        assert_eq!(huge.min_bytes, 10 * MIB);
        assert_eq!(huge.min_percent, 0.1);
    }

    #[test]
    fn test_min_probe_file_size() {
        assert_eq!(min_probe_file_size(GIB), 10 * MIB);
        assert_eq!(min_probe_file_size(12 * GIB), 8 * MIB);
    }
}
