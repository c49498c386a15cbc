//! Per-rendition encoder workers.
//!
//! One worker wraps one external encoder process writing HLS output into a
//! rendition directory. The process is behind the `Transcoder` trait so joint
//! tests can substitute a scripted implementation that emits segment files on
//! a schedule instead of encoding video.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{HwAccel, TranscodeError, TranscodeRequest};
use crate::readiness::count_segments;

/// Observed state of an encoder process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    Exited(Option<i32>),
}

/// A running encoder process.
#[async_trait]
pub trait TranscodeChild: Send {
    /// Non-blocking status check.
    fn status(&mut self) -> ChildStatus;

    /// Kills the process and reaps it.
    async fn kill(&mut self);
}

/// Spawns encoder processes.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Starts one encoder for one rendition.
    ///
    /// # Errors
    /// - `TranscodeError::StartFailed` - Process could not be spawned
    async fn spawn(
        &self,
        request: &TranscodeRequest,
    ) -> Result<Box<dyn TranscodeChild>, TranscodeError>;
}

/// Readiness and failure signals a worker reports to its stream.
#[derive(Debug)]
pub enum WorkerEvent {
    /// First segment is on disk; the rendition is servable.
    Ready { rendition: String },
    Failed {
        rendition: String,
        error: TranscodeError,
    },
}

/// Supervises one rendition from spawn to readiness and beyond.
///
/// Polls the rendition directory once per `poll_interval`. Readiness fires
/// once a segment exists; `SegmentTimeout` fires if none appears before
/// `first_segment_deadline`. After readiness the worker keeps watching the
/// process so it is killed and reaped on cancellation.
pub async fn run_transcode_worker(
    transcoder: Arc<dyn Transcoder>,
    request: TranscodeRequest,
    first_segment_deadline: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
    events: mpsc::Sender<WorkerEvent>,
) {
    let rendition = request.rendition.name.to_string();

    let mut child = match transcoder.spawn(&request).await {
        Ok(child) => child,
        Err(error) => {
            let _ = events
                .send(WorkerEvent::Failed { rendition, error })
                .await;
            return;
        }
    };

    let started = Instant::now();
    let mut ready_sent = false;

    loop {
        if cancel.is_cancelled() {
            child.kill().await;
            return;
        }

        let segments = count_segments(&request.rendition_dir);

        match child.status() {
            ChildStatus::Exited(code) => {
                if segments >= 1 {
                    // Short source: the encoder finished before we looked
                    if !ready_sent {
                        let _ = events.send(WorkerEvent::Ready { rendition }).await;
                    }
                } else if !ready_sent {
                    let _ = events
                        .send(WorkerEvent::Failed {
                            rendition: rendition.clone(),
                            error: TranscodeError::ProcessExited {
                                rendition,
                                code,
                            },
                        })
                        .await;
                }
                return;
            }
            ChildStatus::Running => {
                if !ready_sent && segments >= 1 {
                    ready_sent = true;
                    tracing::info!("{rendition}: first segment ready");
                    let _ = events
                        .send(WorkerEvent::Ready {
                            rendition: rendition.clone(),
                        })
                        .await;
                }
            }
        }

        if !ready_sent && started.elapsed() >= first_segment_deadline {
            child.kill().await;
            let _ = events
                .send(WorkerEvent::Failed {
                    rendition: rendition.clone(),
                    error: TranscodeError::SegmentTimeout { rendition },
                })
                .await;
            return;
        }

        tokio::select! {
            () = cancel.cancelled() => {
                child.kill().await;
                return;
            }
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Production transcoder shelling out to ffmpeg.
pub struct FfmpegTranscoder;

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(
        &self,
        request: &TranscodeRequest,
    ) -> Result<Box<dyn TranscodeChild>, TranscodeError> {
        let args = build_ffmpeg_args(request);
        tracing::debug!("spawning ffmpeg for {}: {:?}", request.rendition.name, args);

        let mut child = tokio::process::Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| TranscodeError::StartFailed {
                reason: error.to_string(),
            })?;

        // Drain encoder chatter into the debug log so the pipe never fills
        if let Some(stderr) = child.stderr.take() {
            let rendition = request.rendition.name;
            tokio::spawn(async move {
                let mut lines = tokio::io::BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "ffmpeg", "{rendition}: {line}");
                }
            });
        }

        Ok(Box::new(FfmpegChild { child }))
    }
}

struct FfmpegChild {
    child: tokio::process::Child,
}

#[async_trait]
impl TranscodeChild for FfmpegChild {
    fn status(&mut self) -> ChildStatus {
        match self.child.try_wait() {
            Ok(None) => ChildStatus::Running,
            Ok(Some(status)) => ChildStatus::Exited(status.code()),
            Err(_) => ChildStatus::Exited(None),
        }
    }

    async fn kill(&mut self) {
        if self.child.start_kill().is_ok() {
            let _ = self.child.wait().await;
        }
    }
}

/// Builds the encoder argument vector for one rendition.
///
/// The input flags tolerate a file that is still downloading: short analysis
/// bounds, corrupt-packet tolerance, timestamp regeneration, no buffering.
/// Keyframes land every `gop_frames` frames with scene-change splitting off
/// so segment boundaries align across renditions.
pub fn build_ffmpeg_args(request: &TranscodeRequest) -> Vec<String> {
    let spec = &request.rendition;
    let mut args: Vec<String> = [
        "-y",
        "-fflags", "+genpts+igndts+discardcorrupt+nobuffer",
        "-flags", "low_delay",
        "-strict", "experimental",
        "-err_detect", "ignore_err",
        "-analyzeduration", "2000000",
        "-probesize", "10000000",
        "-max_delay", "0",
        "-thread_queue_size", "512",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();

    match request.hw_accel {
        HwAccel::Vaapi => args.extend(
            [
                "-hwaccel", "vaapi",
                "-hwaccel_device", "/dev/dri/renderD128",
                "-hwaccel_output_format", "vaapi",
            ]
            .iter()
            .map(ToString::to_string),
        ),
        HwAccel::Nvenc => args.extend(
            ["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"]
                .iter()
                .map(ToString::to_string),
        ),
        HwAccel::Qsv => args.extend(["-hwaccel", "qsv"].iter().map(ToString::to_string)),
        HwAccel::None => {}
    }

    args.push("-i".to_string());
    args.push(request.source.to_string_lossy().to_string());

    args.push("-map".to_string());
    args.push("0:v:0".to_string());

    if request.audio_tracks.len() > 1 {
        for index in 0..request.audio_tracks.len() {
            args.push("-map".to_string());
            args.push(format!("0:a:{index}"));
        }
    } else {
        // Single or undetected audio: map whatever is there
        args.push("-map".to_string());
        args.push("0:a?".to_string());
    }

    match request.hw_accel {
        HwAccel::Vaapi => {
            args.extend([
                "-vf".to_string(),
                format!(
                    "format=nv12|vaapi,hwupload,scale_vaapi={}:{}",
                    spec.width, spec.height
                ),
                "-c:v".to_string(),
                "h264_vaapi".to_string(),
                // VAAPI takes QP, not CRF
                "-qp".to_string(),
                format!("{}", spec.crf + 5),
                "-maxrate".to_string(),
                format!("{}k", spec.max_bitrate_k),
                "-bufsize".to_string(),
                format!("{}k", spec.buffer_size_k),
            ]);
        }
        HwAccel::Nvenc => {
            args.extend([
                "-vf".to_string(),
                format!("scale={}:{}", spec.width, spec.height),
                "-c:v".to_string(),
                "h264_nvenc".to_string(),
                "-preset".to_string(),
                "p4".to_string(),
                "-rc".to_string(),
                "vbr".to_string(),
                "-cq".to_string(),
                spec.crf.to_string(),
                "-maxrate".to_string(),
                format!("{}k", spec.max_bitrate_k),
                "-bufsize".to_string(),
                format!("{}k", spec.buffer_size_k),
            ]);
        }
        HwAccel::Qsv => {
            args.extend([
                "-vf".to_string(),
                format!("scale={}:{}", spec.width, spec.height),
                "-c:v".to_string(),
                "h264_qsv".to_string(),
                "-preset".to_string(),
                "faster".to_string(),
                "-global_quality".to_string(),
                spec.crf.to_string(),
                "-maxrate".to_string(),
                format!("{}k", spec.max_bitrate_k),
                "-bufsize".to_string(),
                format!("{}k", spec.buffer_size_k),
            ]);
        }
        HwAccel::None => {
            args.extend([
                "-vf".to_string(),
                format!("scale={}:{}:flags=bilinear", spec.width, spec.height),
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                spec.preset.to_string(),
                "-tune".to_string(),
                "zerolatency".to_string(),
                "-crf".to_string(),
                spec.crf.to_string(),
                "-maxrate".to_string(),
                format!("{}k", spec.max_bitrate_k),
                "-bufsize".to_string(),
                format!("{}k", spec.buffer_size_k),
                "-profile:v".to_string(),
                "main".to_string(),
                "-level".to_string(),
                "4.0".to_string(),
            ]);
        }
    }

    args.extend([
        "-g".to_string(),
        request.gop_frames.to_string(),
        "-keyint_min".to_string(),
        request.gop_frames.to_string(),
        "-sc_threshold".to_string(),
        "0".to_string(),
    ]);

    args.extend([
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        format!("{}k", spec.audio_bitrate_k),
        "-ac".to_string(),
        "2".to_string(),
        "-ar".to_string(),
        "48000".to_string(),
    ]);

    for (index, track) in request.audio_tracks.iter().enumerate() {
        args.push(format!("-metadata:s:a:{index}"));
        args.push(format!("language={}", track.language));
        if !track.title.is_empty() {
            args.push(format!("-metadata:s:a:{index}"));
            args.push(format!("title={}", track.title));
        }
    }

    let playlist = request.rendition_dir.join("playlist.m3u8");
    let segments = request.rendition_dir.join("segment%03d.ts");
    args.extend([
        "-hls_time".to_string(),
        request.segment_seconds.to_string(),
        "-hls_list_size".to_string(),
        "0".to_string(),
        // temp_file makes the muxer write segments and playlist to a temp
        // name and rename when done, so readers never see a partial .ts
        "-hls_flags".to_string(),
        "independent_segments+append_list+temp_file".to_string(),
        "-hls_segment_type".to_string(),
        "mpegts".to_string(),
        "-hls_segment_filename".to_string(),
        segments.to_string_lossy().to_string(),
        "-f".to_string(),
        "hls".to_string(),
        playlist.to_string_lossy().to_string(),
    ]);

    args
}

/// What a scripted encoder does for a rendition.
#[derive(Debug, Clone)]
pub enum ScriptedBehavior {
    /// Emits `segment_count` segments, then exits 0.
    Healthy {
        first_segment_delay: Duration,
        segment_interval: Duration,
        segment_count: u32,
        segment_bytes: usize,
        /// Writes each segment in this many growing appends, spaced by
        /// `grow_interval`, to exercise partial-file protection downstream
        grow_steps: u32,
        grow_interval: Duration,
    },
    /// Spawn itself fails.
    FailToStart,
    /// Runs but never writes anything.
    Silent,
    /// Exits immediately with the given code, writing nothing.
    ExitEarly { code: i32 },
}

impl ScriptedBehavior {
    /// Fast healthy encoder for tests.
    pub fn quick() -> Self {
        Self::Healthy {
            first_segment_delay: Duration::from_millis(50),
            segment_interval: Duration::from_millis(100),
            segment_count: 3,
            segment_bytes: 4096,
            grow_steps: 1,
            grow_interval: Duration::from_millis(0),
        }
    }
}

/// Simulation transcoder emitting a scriptable sequence of segment files.
pub struct ScriptedTranscoder {
    default: ScriptedBehavior,
    overrides: Mutex<HashMap<String, ScriptedBehavior>>,
}

impl ScriptedTranscoder {
    pub fn new(default: ScriptedBehavior) -> Self {
        Self {
            default,
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the behavior for one rendition name.
    pub fn script_rendition(&self, rendition: &str, behavior: ScriptedBehavior) {
        self.overrides
            .lock()
            .expect("override lock poisoned")
            .insert(rendition.to_string(), behavior);
    }

    fn behavior_for(&self, rendition: &str) -> ScriptedBehavior {
        self.overrides
            .lock()
            .expect("override lock poisoned")
            .get(rendition)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn spawn(
        &self,
        request: &TranscodeRequest,
    ) -> Result<Box<dyn TranscodeChild>, TranscodeError> {
        let behavior = self.behavior_for(request.rendition.name);
        let dir = request.rendition_dir.clone();
        let cancel = CancellationToken::new();
        let exit_code: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));

        match behavior {
            ScriptedBehavior::FailToStart => {
                return Err(TranscodeError::StartFailed {
                    reason: "scripted spawn failure".to_string(),
                });
            }
            ScriptedBehavior::ExitEarly { code } => {
                *exit_code.lock().expect("exit lock poisoned") = Some(code);
            }
            ScriptedBehavior::Silent => {
                // Nothing to do: the child just stays "running" until killed
            }
            ScriptedBehavior::Healthy {
                first_segment_delay,
                segment_interval,
                segment_count,
                segment_bytes,
                grow_steps,
                grow_interval,
            } => {
                let task_cancel = cancel.clone();
                let task_exit = Arc::clone(&exit_code);
                tokio::spawn(async move {
                    let _ = tokio::fs::create_dir_all(&dir).await;
                    tokio::select! {
                        () = task_cancel.cancelled() => return,
                        () = tokio::time::sleep(first_segment_delay) => {}
                    }

                    for segment in 0..segment_count {
                        let path = dir.join(format!("segment{segment:03}.ts"));
                        if grow_steps > 1 {
                            // Grow the file in place across several appends
                            let chunk = segment_bytes / grow_steps as usize;
                            for step in 0..grow_steps {
                                if task_cancel.is_cancelled() {
                                    return;
                                }
                                let mut data = Vec::new();
                                if path.exists() {
                                    data = std::fs::read(&path).unwrap_or_default();
                                }
                                data.extend(std::iter::repeat_n(step as u8, chunk));
                                let _ = std::fs::write(&path, &data);
                                tokio::time::sleep(grow_interval).await;
                            }
                        } else {
                            // Muxer-style: temp file renamed into place
                            let temp = dir.join(format!("segment{segment:03}.ts.tmp"));
                            let _ = std::fs::write(&temp, vec![0u8; segment_bytes]);
                            let _ = std::fs::rename(&temp, &path);
                        }

                        write_playlist(&dir, segment + 1);

                        tokio::select! {
                            () = task_cancel.cancelled() => return,
                            () = tokio::time::sleep(segment_interval) => {}
                        }
                    }

                    *task_exit.lock().expect("exit lock poisoned") = Some(0);
                });
            }
        }

        Ok(Box::new(ScriptedChild { cancel, exit_code }))
    }
}

fn write_playlist(dir: &std::path::Path, segments: u32) {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n");
    for segment in 0..segments {
        playlist.push_str("#EXTINF:2.000000,\n");
        playlist.push_str(&format!("segment{segment:03}.ts\n"));
    }
    let temp = dir.join("playlist.m3u8.tmp");
    if std::fs::write(&temp, playlist).is_ok() {
        let _ = std::fs::rename(temp, dir.join("playlist.m3u8"));
    }
}

struct ScriptedChild {
    cancel: CancellationToken,
    exit_code: Arc<Mutex<Option<i32>>>,
}

#[async_trait]
impl TranscodeChild for ScriptedChild {
    fn status(&mut self) -> ChildStatus {
        match *self.exit_code.lock().expect("exit lock poisoned") {
            Some(code) => ChildStatus::Exited(Some(code)),
            None => ChildStatus::Running,
        }
    }

    async fn kill(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::super::{BUILTIN_LADDER, plan_ladder};
    use super::*;
    use crate::probe::AudioTrack;

    fn request(dir: &std::path::Path, hw_accel: HwAccel, tracks: Vec<AudioTrack>) -> TranscodeRequest {
        TranscodeRequest {
            source: dir.join("movie.mkv"),
            rendition: BUILTIN_LADDER[0].clone(),
            rendition_dir: dir.join("240p"),
            audio_tracks: tracks,
            hw_accel,
            segment_seconds: 2,
            gop_frames: 48,
        }
    }

    fn track(index: usize, language: &str, title: &str) -> AudioTrack {
        AudioTrack {
            index,
            stream_index: index + 1,
            language: language.to_string(),
            title: title.to_string(),
            codec: "ac3".to_string(),
            channels: 2,
            is_default: index == 0,
        }
    }

    #[test]
    fn test_software_args_carry_quality_settings() {
        let dir = tempdir().unwrap();
        let args = build_ffmpeg_args(&request(dir.path(), HwAccel::None, vec![]));

        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-preset ultrafast"));
        assert!(joined.contains("-crf 30"));
        assert!(joined.contains("-maxrate 428k"));
        assert!(joined.contains("-bufsize 600k"));
        assert!(joined.contains("scale=426:240:flags=bilinear"));
        assert!(joined.contains("-g 48 -keyint_min 48 -sc_threshold 0"));
        assert!(joined.contains("-hls_time 2"));
        assert!(joined.contains("independent_segments+append_list+temp_file"));
        assert!(joined.contains("-hls_segment_type mpegts"));
        // Single/unknown audio maps optionally
        assert!(joined.contains("-map 0:a?"));
    }

    #[test]
    fn test_multi_audio_args_map_and_tag_each_track() {
        let dir = tempdir().unwrap();
        let tracks = vec![track(0, "eng", "English"), track(1, "jpn", "日本語")];
        let args = build_ffmpeg_args(&request(dir.path(), HwAccel::None, tracks));

        let joined = args.join(" ");
        assert!(joined.contains("-map 0:a:0"));
        assert!(joined.contains("-map 0:a:1"));
        assert!(!joined.contains("-map 0:a?"));
        assert!(joined.contains("-metadata:s:a:0 language=eng"));
        assert!(joined.contains("-metadata:s:a:1 language=jpn"));
        assert!(joined.contains("-metadata:s:a:1 title=日本語"));
    }

    #[test]
    fn test_vaapi_args_use_qp_offset() {
        let dir = tempdir().unwrap();
        let args = build_ffmpeg_args(&request(dir.path(), HwAccel::Vaapi, vec![]));
        let joined = args.join(" ");
        assert!(joined.contains("-c:v h264_vaapi"));
        assert!(joined.contains("-qp 35")); // crf 30 + 5
        assert!(joined.contains("scale_vaapi=426:240"));
    }

    #[tokio::test]
    async fn test_scripted_worker_reaches_ready() {
        let dir = tempdir().unwrap();
        let rendition_dir = dir.path().join("240p");
        std::fs::create_dir_all(&rendition_dir).unwrap();

        let transcoder: Arc<dyn Transcoder> =
            Arc::new(ScriptedTranscoder::new(ScriptedBehavior::quick()));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let mut request = request(dir.path(), HwAccel::None, vec![]);
        request.rendition_dir = rendition_dir.clone();

        tokio::spawn(run_transcode_worker(
            transcoder,
            request,
            Duration::from_secs(5),
            Duration::from_millis(25),
            cancel.clone(),
            events_tx,
        ));

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("worker should report")
            .expect("channel open");
        assert!(matches!(event, WorkerEvent::Ready { ref rendition } if rendition == "240p"));
        assert!(count_segments(&rendition_dir) >= 1);
        assert!(rendition_dir.join("playlist.m3u8").exists());
    }

    #[tokio::test]
    async fn test_silent_worker_times_out() {
        let dir = tempdir().unwrap();
        let rendition_dir = dir.path().join("240p");
        std::fs::create_dir_all(&rendition_dir).unwrap();

        let transcoder: Arc<dyn Transcoder> =
            Arc::new(ScriptedTranscoder::new(ScriptedBehavior::Silent));
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let mut request = request(dir.path(), HwAccel::None, vec![]);
        request.rendition_dir = rendition_dir;

        tokio::spawn(run_transcode_worker(
            transcoder,
            request,
            Duration::from_millis(200),
            Duration::from_millis(25),
            cancel.clone(),
            events_tx,
        ));

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("worker should report")
            .expect("channel open");
        assert!(matches!(
            event,
            WorkerEvent::Failed {
                error: TranscodeError::SegmentTimeout { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_exit_early_worker_reports_process_exit() {
        let dir = tempdir().unwrap();
        let rendition_dir = dir.path().join("240p");
        std::fs::create_dir_all(&rendition_dir).unwrap();

        let transcoder: Arc<dyn Transcoder> =
            Arc::new(ScriptedTranscoder::new(ScriptedBehavior::ExitEarly { code: 1 }));
        let (events_tx, mut events_rx) = mpsc::channel(8);

        let mut request = request(dir.path(), HwAccel::None, vec![]);
        request.rendition_dir = rendition_dir;

        tokio::spawn(run_transcode_worker(
            transcoder,
            request,
            Duration::from_secs(1),
            Duration::from_millis(25),
            CancellationToken::new(),
            events_tx,
        ));

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("worker should report")
            .expect("channel open");
        assert!(matches!(
            event,
            WorkerEvent::Failed {
                error: TranscodeError::ProcessExited { code: Some(1), .. },
                ..
            }
        ));
    }

    #[test]
    fn test_plan_ladder_reexport_sanity() {
        // Guard against the ladder and planner drifting apart
        assert_eq!(plan_ladder(240), vec![BUILTIN_LADDER[0].clone()]);
    }
}
