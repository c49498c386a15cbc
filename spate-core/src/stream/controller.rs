//! Per-stream pipeline orchestration.
//!
//! One driver task per stream walks the download phase, flips to transcoding
//! once the head of the file is servable, and then babysits the torrent until
//! the stream is torn down. Children (prioritizer, workers, event collector)
//! run on child cancellation tokens and report through channels; only code in
//! this module writes the stream's state.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    StreamShared, StreamState, StreamStatus, admission_thresholds, min_probe_file_size,
};
use crate::cache::{CacheEntry, MetadataCache};
use crate::config::SpateConfig;
use crate::hls::write_master_playlist;
use crate::probe::{DEFAULT_RESOLUTION, MediaProber};
use crate::readiness::file_size;
use crate::torrent::prioritizer::initial_window_pieces;
use crate::torrent::{
    PiecePriority, TorrentBackend, TorrentError, TorrentFileInfo, TorrentJob, run_prioritizer,
    select_video_file,
};
use crate::transcode::{
    HwAccel, TranscodeRequest, Transcoder, WorkerEvent, detect_hw_accel, plan_ladder,
    run_transcode_worker,
};

/// Shared collaborators handed to every stream.
pub struct StreamContext {
    pub config: SpateConfig,
    pub backend: Arc<dyn TorrentBackend>,
    pub prober: Arc<dyn MediaProber>,
    pub transcoder: Arc<dyn Transcoder>,
    pub cache: Arc<MetadataCache>,
    /// Fixed hardware-acceleration choice; `None` probes once on first use
    pub hw_accel: Option<HwAccel>,
}

/// Handle to one live stream, held by the registry.
pub struct StreamHandle {
    pub id: String,
    pub created_at: Instant,
    /// Normalized magnet link this stream was admitted with
    pub input: String,
    shared: Arc<Mutex<StreamShared>>,
    cancel: CancellationToken,
    driver: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Locks a shared block, recovering from a poisoned mutex.
fn lock(shared: &Mutex<StreamShared>) -> MutexGuard<'_, StreamShared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fail(shared: &Mutex<StreamShared>, reason: String) {
    let mut guard = lock(shared);
    if guard.transition(StreamState::Error) {
        tracing::error!("stream failed: {reason}");
        guard.last_error = Some(reason);
    } else {
        tracing::debug!("ignoring failure after terminal state: {reason}");
    }
}

impl StreamHandle {
    /// Snapshot of the stream for status and serving code.
    pub fn status(&self) -> StreamStatus {
        let guard = lock(&self.shared);
        StreamStatus {
            id: self.id.clone(),
            state: guard.state,
            progress: guard.progress,
            file_name: guard.file_name.clone(),
            last_error: guard.last_error.clone(),
            peers: guard.peers,
            downloaded_bytes: guard.downloaded_bytes,
            speed_mbps: guard.speed_mbps,
            source_width: guard.source_width,
            source_height: guard.source_height,
            audio_tracks: guard.audio_tracks.clone(),
            planned_renditions: guard.planned_renditions.clone(),
            ready_renditions: guard.ready_renditions.clone(),
            hls_root: guard.hls_root.clone(),
        }
    }

    /// On-disk location of the chosen video file, once known.
    pub fn video_file_path(&self) -> Option<PathBuf> {
        lock(&self.shared).video_file_path.clone()
    }

    /// Signals every task belonging to this stream to stop.
    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the driver task to finish, bounded by `grace`.
    ///
    /// Returns false if the driver did not wind down in time.
    pub async fn await_teardown(&self, grace: std::time::Duration) -> bool {
        let driver = lock_driver(&self.driver).take();
        match driver {
            None => true,
            Some(handle) => tokio::time::timeout(grace, handle).await.is_ok(),
        }
    }
}

fn lock_driver(
    driver: &Mutex<Option<tokio::task::JoinHandle<()>>>,
) -> MutexGuard<'_, Option<tokio::task::JoinHandle<()>>> {
    driver.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates a stream in `Downloading` state and spawns its driver task.
pub fn spawn_stream(ctx: Arc<StreamContext>, id: String, magnet: String) -> Arc<StreamHandle> {
    let shared = Arc::new(Mutex::new(StreamShared::new()));
    let cancel = CancellationToken::new();

    let handle = Arc::new(StreamHandle {
        id: id.clone(),
        created_at: Instant::now(),
        input: magnet.clone(),
        shared: Arc::clone(&shared),
        cancel: cancel.clone(),
        driver: Mutex::new(None),
    });

    let driver = tokio::spawn(drive_stream(ctx, id, magnet, shared, cancel));
    *lock_driver(&handle.driver) = Some(driver);

    handle
}

enum PipelineEnd {
    Cancelled,
    Fatal(String),
}

/// Slot the download loop drops the transcode-phase task handle into, so
/// teardown can wait for the workers to finish killing their children.
type TranscodeSlot = Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>;

async fn drive_stream(
    ctx: Arc<StreamContext>,
    id: String,
    magnet: String,
    shared: Arc<Mutex<StreamShared>>,
    cancel: CancellationToken,
) {
    let job: Arc<dyn TorrentJob> = match ctx.backend.add_magnet(&magnet).await {
        Ok(job) => Arc::from(job),
        Err(error) => {
            fail(&shared, format!("Could not add magnet: {error}"));
            return;
        }
    };

    let transcode_slot: TranscodeSlot = Arc::new(Mutex::new(None));

    // The pipeline runs in its own task so a panic anywhere inside it is
    // caught here and recorded instead of silently killing the stream.
    let mut pipeline = tokio::spawn(run_pipeline(
        Arc::clone(&ctx),
        id.clone(),
        magnet,
        Arc::clone(&job),
        Arc::clone(&shared),
        cancel.clone(),
        Arc::clone(&transcode_slot),
    ));

    let outcome = tokio::select! {
        () = cancel.cancelled() => {
            pipeline.abort();
            Err(PipelineEnd::Cancelled)
        }
        joined = &mut pipeline => match joined {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                Err(PipelineEnd::Fatal(format!("internal: {join_error}")))
            }
            Err(_) => Err(PipelineEnd::Cancelled),
        }
    };

    match outcome {
        Ok(()) => {
            // Download finished; keep the torrent attached for serving until
            // the registry tears the stream down.
            cancel.cancelled().await;
            lock(&shared).transition(StreamState::Stopped);
        }
        Err(PipelineEnd::Cancelled) => {
            lock(&shared).transition(StreamState::Stopped);
        }
        Err(PipelineEnd::Fatal(reason)) => fail(&shared, reason),
    }

    // Wait for the workers to kill and reap their encoder children before the
    // registry deletes this stream's directories.
    let transcode_task = transcode_slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    if let Some(task) = transcode_task {
        let _ = tokio::time::timeout(ctx.config.server.eviction_grace, task).await;
    }

    job.shutdown().await;
    tracing::info!("stream {id} driver finished");
}

/// Download phase plus the hand-off into transcoding.
///
/// Returns Ok once the chosen file is fully downloaded; transcoding continues
/// on its own tasks past that point.
#[allow(clippy::too_many_arguments)]
async fn run_pipeline(
    ctx: Arc<StreamContext>,
    id: String,
    magnet: String,
    job: Arc<dyn TorrentJob>,
    shared: Arc<Mutex<StreamShared>>,
    cancel: CancellationToken,
    transcode_slot: TranscodeSlot,
) -> Result<(), PipelineEnd> {
    tracing::info!("stream {id}: waiting for torrent metadata");

    job.await_info(ctx.config.torrent.metadata_deadline)
        .await
        .map_err(|error| match error {
            TorrentError::MetadataTimeout => {
                PipelineEnd::Fatal("Timed out fetching torrent metadata".to_string())
            }
            other => PipelineEnd::Fatal(other.to_string()),
        })?;

    let files = job.files();
    let video = select_video_file(&files).ok_or_else(|| {
        PipelineEnd::Fatal("No video file found in torrent".to_string())
    })?;

    let video_path = ctx.config.server.downloads_dir.join(&video.path);
    let file_name = video
        .path
        .rsplit('/')
        .next()
        .unwrap_or(video.path.as_str())
        .to_string();

    tracing::info!(
        "stream {id}: downloading {file_name} ({:.2} MB)",
        video.length as f64 / 1_048_576.0
    );

    {
        let mut guard = lock(&shared);
        guard.file_name = file_name.clone();
        guard.video_file_path = Some(video_path.clone());
    }

    job.request_full_download(video.index)
        .await
        .map_err(|error| PipelineEnd::Fatal(error.to_string()))?;

    // Pin the head of the file so container headers arrive first
    let piece_length = job.piece_length();
    if piece_length == 0 {
        return Err(PipelineEnd::Fatal("Torrent reports zero piece length".to_string()));
    }
    let first_piece = video.offset / piece_length;
    let head_pieces = initial_window_pieces(
        ctx.config.torrent.head_window_bytes,
        piece_length,
        ctx.config.torrent.min_head_pieces,
        ctx.config.torrent.max_head_pieces,
    );
    let head_end = (first_piece + head_pieces).min(job.num_pieces());
    tracing::debug!("stream {id}: pinning head pieces {first_piece}..{head_end}");
    job.set_piece_priority(first_piece..head_end, PiecePriority::NowUrgent)
        .await;

    tokio::spawn(run_prioritizer(
        Arc::clone(&job),
        video.clone(),
        ctx.config.torrent.prioritizer_tick,
        ctx.config.torrent.prioritizer_window_bytes,
        ctx.config.torrent.prioritizer_min_pieces,
        cancel.child_token(),
    ));

    download_loop(
        &ctx,
        &id,
        &magnet,
        &job,
        &video,
        video_path,
        file_name,
        first_piece..head_end,
        &shared,
        &cancel,
        &transcode_slot,
    )
    .await
}

/// 1 Hz progress loop; flips the stream to transcoding once head-ready.
#[allow(clippy::too_many_arguments)]
async fn download_loop(
    ctx: &Arc<StreamContext>,
    id: &str,
    magnet: &str,
    job: &Arc<dyn TorrentJob>,
    video: &TorrentFileInfo,
    video_path: PathBuf,
    file_name: String,
    head_window: std::ops::Range<u64>,
    shared: &Arc<Mutex<StreamShared>>,
    cancel: &CancellationToken,
    transcode_slot: &TranscodeSlot,
) -> Result<(), PipelineEnd> {
    let thresholds = admission_thresholds(video.length);
    let min_file = min_probe_file_size(video.length);

    let mut head_ready = false;
    let mut transcode_started = false;
    let mut last_bytes_read = 0u64;
    let mut last_rate_check: Option<Instant> = None;

    loop {
        tokio::time::sleep(ctx.config.torrent.poll_interval).await;

        let bytes = job.bytes_completed(video.index);
        let progress = if video.length > 0 {
            bytes as f64 / video.length as f64 * 100.0
        } else {
            0.0
        };
        let stats = job.stats();

        {
            let mut guard = lock(shared);
            guard.progress = progress;
            guard.peers = stats.active_peers;
            guard.downloaded_bytes = stats.bytes_read;

            // Instantaneous rate over a sliding window
            let now = Instant::now();
            match last_rate_check {
                Some(previous) => {
                    let elapsed = now.duration_since(previous).as_secs_f64();
                    if elapsed > ctx.config.torrent.rate_window.as_secs_f64() {
                        let delta = stats.bytes_read.saturating_sub(last_bytes_read);
                        guard.speed_mbps = delta as f64 / 1_048_576.0 / elapsed;
                        last_bytes_read = stats.bytes_read;
                        last_rate_check = Some(now);
                    }
                }
                None => {
                    last_bytes_read = stats.bytes_read;
                    last_rate_check = Some(now);
                }
            }
        }

        if !head_ready {
            head_ready = head_window.clone().all(|index| job.piece_complete(index));
            if head_ready {
                tracing::info!(
                    "stream {id}: head window complete ({} pieces)",
                    head_window.end - head_window.start
                );
            }
        }

        let thresholds_met = bytes >= thresholds.min_bytes || progress >= thresholds.min_percent;
        if head_ready && thresholds_met && !transcode_started {
            let legible = file_size(&video_path).is_some_and(|size| size > min_file)
                && ctx
                    .prober
                    .can_probe(&video_path, ctx.config.transcode.probe_deadline)
                    .await;

            if legible {
                transcode_started = true;
                tracing::info!(
                    "stream {id}: source legible at {:.2} MB, starting transcoders",
                    bytes as f64 / 1_048_576.0
                );
                let task = tokio::spawn(run_transcode_phase(
                    Arc::clone(ctx),
                    id.to_string(),
                    magnet.to_string(),
                    video_path.clone(),
                    file_name.clone(),
                    video.length,
                    Arc::clone(shared),
                    cancel.child_token(),
                ));
                *transcode_slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
            } else {
                tracing::debug!("stream {id}: waiting for more data, source not yet legible");
            }
        }

        if bytes >= video.length {
            tracing::info!("stream {id}: download complete");
            return Ok(());
        }
    }
}

/// Transcoding phase: probe, plan, write the master eagerly, fan out workers.
#[allow(clippy::too_many_arguments)]
async fn run_transcode_phase(
    ctx: Arc<StreamContext>,
    id: String,
    magnet: String,
    video_path: PathBuf,
    file_name: String,
    total_bytes: u64,
    shared: Arc<Mutex<StreamShared>>,
    cancel: CancellationToken,
) {
    let hls_root = ctx.config.server.downloads_dir.join(&id).join("hls");
    if let Err(error) = tokio::fs::create_dir_all(&hls_root).await {
        fail(&shared, format!("Could not create HLS directory: {error}"));
        return;
    }
    lock(&shared).hls_root = Some(hls_root.clone());

    // The admission gate already saw the file; give a slow disk a moment if
    // the engine is still flushing early pieces
    for _ in 0..30 {
        if file_size(&video_path).is_some_and(|size| size > 5 * 1024 * 1024) {
            break;
        }
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }

    let (source_width, source_height) = ctx
        .prober
        .resolution(&video_path)
        .await
        .unwrap_or(DEFAULT_RESOLUTION);
    let audio_tracks = ctx.prober.audio_tracks(&video_path).await;
    tracing::info!(
        "stream {id}: source {source_width}x{source_height}, {} audio tracks",
        audio_tracks.len()
    );

    let ladder = plan_ladder(source_height);
    {
        let mut guard = lock(&shared);
        guard.source_width = source_width;
        guard.source_height = source_height;
        guard.audio_tracks = audio_tracks.clone();
        guard.planned_renditions = ladder.iter().map(|spec| spec.name.to_string()).collect();
    }

    for spec in &ladder {
        if let Err(error) = tokio::fs::create_dir_all(hls_root.join(spec.name)).await {
            tracing::warn!("stream {id}: could not create {} dir: {error}", spec.name);
        }
    }

    // Master goes out before any worker starts: players fetch every listed
    // rendition on load, and those requests block until playlists appear
    if let Err(error) =
        write_master_playlist(&hls_root.join("master.m3u8"), &ladder, &audio_tracks)
    {
        tracing::warn!("stream {id}: master playlist write failed: {error}");
    }

    // Transcoding only becomes observable once the master is servable, so a
    // client that sees the state flip can fetch it immediately
    lock(&shared).transition(StreamState::Transcoding);

    let hw_accel = match ctx.hw_accel {
        Some(choice) => choice,
        None => detect_hw_accel().await,
    };

    let (events_tx, events_rx) = mpsc::channel(ladder.len().max(1) * 2);
    for spec in &ladder {
        let request = TranscodeRequest {
            source: video_path.clone(),
            rendition: spec.clone(),
            rendition_dir: hls_root.join(spec.name),
            audio_tracks: audio_tracks.clone(),
            hw_accel,
            segment_seconds: ctx.config.transcode.segment_seconds,
            gop_frames: ctx.config.transcode.gop_frames,
        };
        tokio::spawn(run_transcode_worker(
            Arc::clone(&ctx.transcoder),
            request,
            ctx.config.transcode.first_segment_deadline,
            ctx.config.transcode.segment_poll_interval,
            cancel.child_token(),
            events_tx.clone(),
        ));
    }
    drop(events_tx);

    collect_worker_events(
        ctx,
        id,
        magnet,
        video_path,
        file_name,
        total_bytes,
        ladder.len(),
        shared,
        events_rx,
        cancel,
    )
    .await;
}

/// Funnels worker readiness and failures into the stream's state.
#[allow(clippy::too_many_arguments)]
async fn collect_worker_events(
    ctx: Arc<StreamContext>,
    id: String,
    magnet: String,
    video_path: PathBuf,
    file_name: String,
    total_bytes: u64,
    worker_count: usize,
    shared: Arc<Mutex<StreamShared>>,
    mut events_rx: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
) {
    let mut any_ready = false;
    let mut failures = 0usize;

    // Every worker holds a sender until it returns, so this loop ends exactly
    // when all workers have wound down (including killing their children on
    // cancellation). Teardown relies on that ordering.
    while let Some(event) = events_rx.recv().await {
        match event {
            WorkerEvent::Ready { rendition } => {
                {
                    let mut guard = lock(&shared);
                    if !guard.ready_renditions.contains(&rendition) {
                        guard.ready_renditions.push(rendition.clone());
                    }
                    guard.transition(StreamState::Ready);
                }

                if any_ready || cancel.is_cancelled() {
                    tracing::info!("stream {id}: additional rendition ready: {rendition}");
                    continue;
                }
                any_ready = true;
                tracing::info!("stream {id}: ready, base rendition {rendition} is servable");

                // Remember what we learned about this source
                let info = ctx.prober.media_info(&video_path).await.unwrap_or_default();
                let (width, height) = {
                    let guard = lock(&shared);
                    (guard.source_width, guard.source_height)
                };
                let now = std::time::SystemTime::now();
                ctx.cache.set(
                    &magnet,
                    CacheEntry {
                        info_hash: String::new(),
                        name: file_name.clone(),
                        file_name: file_name.clone(),
                        file_size: total_bytes,
                        duration: info.duration_secs,
                        width,
                        height,
                        video_codec: info.video_codec,
                        audio_codec: info.audio_codec,
                        audio_tracks: info.audio_track_count,
                        subtitle_tracks: info.subtitle_track_count,
                        created_at: now,
                        last_access: now,
                        access_count: 0,
                    },
                );
            }
            WorkerEvent::Failed { rendition, error } => {
                tracing::warn!("stream {id}: rendition {rendition} failed: {error}");
                failures += 1;
            }
        }
    }

    if !any_ready && failures >= worker_count && !cancel.is_cancelled() {
        fail(&shared, "All renditions failed to start".to_string());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tempfile::tempdir;

    use super::*;
    use crate::probe::StaticProber;
    use crate::torrent::{SimulatedTorrent, SimulationBackend};
    use crate::transcode::{ScriptedBehavior, ScriptedTranscoder};

    fn test_context(downloads: PathBuf, script: SimulatedTorrent) -> Arc<StreamContext> {
        Arc::new(StreamContext {
            config: SpateConfig::for_testing(downloads.clone()),
            backend: Arc::new(SimulationBackend::new(downloads, script)),
            prober: Arc::new(StaticProber::plain_1080p()),
            transcoder: Arc::new(ScriptedTranscoder::new(ScriptedBehavior::quick())),
            cache: Arc::new(MetadataCache::open(std::env::temp_dir().join(format!(
                "spate-test-cache-{}.json",
                uuid::Uuid::new_v4()
            )))),
            hw_accel: Some(HwAccel::None),
        })
    }

    async fn wait_for_state(
        handle: &StreamHandle,
        state: StreamState,
        deadline: Duration,
    ) -> bool {
        let until = tokio::time::Instant::now() + deadline;
        while tokio::time::Instant::now() < until {
            if handle.status().state == state {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_stream_reaches_ready_over_simulation() {
        let dir = tempdir().unwrap();
        let ctx = test_context(
            dir.path().to_path_buf(),
            SimulatedTorrent::quick_video("demo"),
        );

        let handle = spawn_stream(
            Arc::clone(&ctx),
            "stream-1".to_string(),
            "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
        );

        assert_eq!(handle.status().state, StreamState::Downloading);
        assert!(
            wait_for_state(&handle, StreamState::Ready, Duration::from_secs(20)).await,
            "stream should become ready, last status: {:?}",
            handle.status()
        );

        let status = handle.status();
        // Master exists and lists the full planned ladder
        let master = status.hls_root.as_ref().unwrap().join("master.m3u8");
        let content = std::fs::read_to_string(master).unwrap();
        for name in &status.planned_renditions {
            assert!(content.contains(&format!("{name}/playlist.m3u8")));
        }
        assert!(!status.ready_renditions.is_empty());
        // Ready renditions are a subset of the plan
        for rendition in &status.ready_renditions {
            assert!(status.planned_renditions.contains(rendition));
        }

        handle.request_stop();
        assert!(handle.await_teardown(Duration::from_secs(5)).await);
        assert_eq!(handle.status().state, StreamState::Stopped);
    }

    #[tokio::test]
    async fn test_metadata_timeout_fails_stream() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path().to_path_buf(), SimulatedTorrent::stalled("stuck"));

        let handle = spawn_stream(
            ctx,
            "stream-2".to_string(),
            "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
        );

        assert!(wait_for_state(&handle, StreamState::Error, Duration::from_secs(10)).await);
        let status = handle.status();
        assert!(status.last_error.unwrap().contains("metadata"));
    }

    #[tokio::test]
    async fn test_torrent_without_video_fails_stream() {
        let dir = tempdir().unwrap();
        let ctx = test_context(dir.path().to_path_buf(), SimulatedTorrent::no_video("docs"));

        let handle = spawn_stream(
            ctx,
            "stream-3".to_string(),
            "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
        );

        assert!(wait_for_state(&handle, StreamState::Error, Duration::from_secs(10)).await);
        assert!(
            handle
                .status()
                .last_error
                .unwrap()
                .contains("No video file")
        );
    }

    #[tokio::test]
    async fn test_worker_failures_do_not_kill_stream_if_one_succeeds() {
        let dir = tempdir().unwrap();
        let script = SimulatedTorrent::quick_video("demo");
        let transcoder = ScriptedTranscoder::new(ScriptedBehavior::quick());
        // Every rendition above the base fails
        for name in ["360p", "480p", "720p", "1080p"] {
            transcoder.script_rendition(name, ScriptedBehavior::FailToStart);
        }

        let downloads = dir.path().to_path_buf();
        let ctx = Arc::new(StreamContext {
            config: SpateConfig::for_testing(downloads.clone()),
            backend: Arc::new(SimulationBackend::new(downloads, script)),
            prober: Arc::new(StaticProber::plain_1080p()),
            transcoder: Arc::new(transcoder),
            cache: Arc::new(MetadataCache::open(
                dir.path().join("metadata_cache.json"),
            )),
            hw_accel: Some(HwAccel::None),
        });

        let handle = spawn_stream(
            ctx,
            "stream-4".to_string(),
            "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
        );

        assert!(wait_for_state(&handle, StreamState::Ready, Duration::from_secs(20)).await);
        let status = handle.status();
        assert_eq!(status.ready_renditions, vec!["240p".to_string()]);

        handle.request_stop();
        handle.await_teardown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stop_during_download_is_clean() {
        let dir = tempdir().unwrap();
        let mut script = SimulatedTorrent::quick_video("slow");
        script.piece_interval = Duration::from_millis(500);
        let ctx = test_context(dir.path().to_path_buf(), script);

        let handle = spawn_stream(
            ctx,
            "stream-5".to_string(),
            "magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.request_stop();
        assert!(handle.await_teardown(Duration::from_secs(5)).await);
        assert_eq!(handle.status().state, StreamState::Stopped);
    }
}
