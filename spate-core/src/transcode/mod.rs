//! Transcoding: ABR ladder planning and per-rendition encoder workers.

pub mod hwaccel;
pub mod worker;

use std::path::PathBuf;

pub use hwaccel::{HwAccel, detect_hw_accel};
pub use worker::{
    ChildStatus, FfmpegTranscoder, ScriptedBehavior, ScriptedTranscoder, TranscodeChild,
    Transcoder, WorkerEvent, run_transcode_worker,
};

use crate::probe::AudioTrack;

/// One rung of the ABR ladder. Immutable plan row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionSpec {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    /// Nominal video bitrate, kbit/s
    pub video_bitrate_k: u32,
    /// VBV max bitrate, kbit/s
    pub max_bitrate_k: u32,
    /// VBV buffer size, kbit
    pub buffer_size_k: u32,
    /// AAC bitrate, kbit/s
    pub audio_bitrate_k: u32,
    /// Quality factor; lower is better
    pub crf: u32,
    /// Software encoder preset hint
    pub preset: &'static str,
}

/// Built-in ladder, ascending by bandwidth.
///
/// The bottom rungs use the cheapest presets so the first segment lands fast
/// on slow machines and large sources.
pub const BUILTIN_LADDER: [RenditionSpec; 7] = [
    RenditionSpec { name: "240p", width: 426, height: 240, video_bitrate_k: 400, max_bitrate_k: 428, buffer_size_k: 600, audio_bitrate_k: 64, crf: 30, preset: "ultrafast" },
    RenditionSpec { name: "360p", width: 640, height: 360, video_bitrate_k: 800, max_bitrate_k: 856, buffer_size_k: 1200, audio_bitrate_k: 96, crf: 28, preset: "ultrafast" },
    RenditionSpec { name: "480p", width: 854, height: 480, video_bitrate_k: 1400, max_bitrate_k: 1498, buffer_size_k: 2100, audio_bitrate_k: 128, crf: 26, preset: "veryfast" },
    RenditionSpec { name: "720p", width: 1280, height: 720, video_bitrate_k: 2800, max_bitrate_k: 2996, buffer_size_k: 4200, audio_bitrate_k: 128, crf: 24, preset: "fast" },
    RenditionSpec { name: "1080p", width: 1920, height: 1080, video_bitrate_k: 5000, max_bitrate_k: 5350, buffer_size_k: 7500, audio_bitrate_k: 192, crf: 22, preset: "fast" },
    RenditionSpec { name: "1440p", width: 2560, height: 1440, video_bitrate_k: 9000, max_bitrate_k: 9630, buffer_size_k: 13500, audio_bitrate_k: 192, crf: 21, preset: "fast" },
    RenditionSpec { name: "2160p", width: 3840, height: 2160, video_bitrate_k: 16000, max_bitrate_k: 17120, buffer_size_k: 24000, audio_bitrate_k: 256, crf: 20, preset: "fast" },
];

/// Plans the ladder for a source: every built-in rendition no taller than the
/// source, or the smallest rendition when the source is tiny.
pub fn plan_ladder(source_height: u32) -> Vec<RenditionSpec> {
    let planned: Vec<RenditionSpec> = BUILTIN_LADDER
        .iter()
        .filter(|spec| spec.height <= source_height)
        .cloned()
        .collect();

    if planned.is_empty() {
        vec![BUILTIN_LADDER[0].clone()]
    } else {
        planned
    }
}

/// Everything a worker needs to produce one rendition.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub source: PathBuf,
    pub rendition: RenditionSpec,
    /// Directory receiving `playlist.m3u8` and `segmentNNN.ts`
    pub rendition_dir: PathBuf,
    pub audio_tracks: Vec<AudioTrack>,
    pub hw_accel: HwAccel,
    /// HLS segment target duration in seconds
    pub segment_seconds: u32,
    /// Fixed keyframe cadence in frames
    pub gop_frames: u32,
}

/// Errors from transcoder workers.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Encoder failed to start: {reason}")]
    StartFailed { reason: String },

    #[error("No segment produced for {rendition} before the deadline")]
    SegmentTimeout { rendition: String },

    #[error("Encoder for {rendition} exited with code {code:?} before producing output")]
    ProcessExited { rendition: String, code: Option<i32> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_is_ascending_by_bandwidth() {
        let bitrates: Vec<u32> = BUILTIN_LADDER.iter().map(|spec| spec.video_bitrate_k).collect();
        let mut sorted = bitrates.clone();
        sorted.sort_unstable();
        assert_eq!(bitrates, sorted);
    }

    #[test]
    fn test_plan_ladder_filters_by_source_height() {
        let plan = plan_ladder(1080);
        let names: Vec<&str> = plan.iter().map(|spec| spec.name).collect();
        assert_eq!(names, ["240p", "360p", "480p", "720p", "1080p"]);
    }

    #[test]
    fn test_plan_ladder_full_for_4k() {
        assert_eq!(plan_ladder(2160).len(), BUILTIN_LADDER.len());
    }

    #[test]
    fn test_plan_ladder_tiny_source_gets_smallest_rung() {
        let plan = plan_ladder(144);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].name, "240p");
    }

    #[test]
    fn test_plan_ladder_exact_height_included() {
        let plan = plan_ladder(720);
        assert_eq!(plan.last().unwrap().name, "720p");
    }
}
