//! Sliding urgent-window piece prioritization.
//!
//! Keeps a window of pieces ahead of the first gap in the video file marked
//! urgent, so the transcoder's read cursor rarely lands on a piece the swarm
//! has not been asked for yet. Priorities are only ever raised: demoting
//! in-flight pieces would thrash when pieces arrive out of order.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{PiecePriority, TorrentFileInfo, TorrentJob};

/// Runs until the file is fully downloaded or `cancel` fires.
///
/// Every `tick`: scan the file's pieces in order, find the first incomplete
/// one, and mark `max(min_pieces, window_bytes / piece_length)` pieces from
/// there as urgent, clipped to the file's last piece.
pub async fn run_prioritizer(
    job: Arc<dyn TorrentJob>,
    file: TorrentFileInfo,
    tick: Duration,
    window_bytes: u64,
    min_pieces: u64,
    cancel: CancellationToken,
) {
    let piece_length = job.piece_length();
    if piece_length == 0 || file.length == 0 {
        return;
    }

    let num_pieces = job.num_pieces();
    let first_piece = file.offset / piece_length;
    let last_piece = ((file.offset + file.length - 1) / piece_length).min(num_pieces.saturating_sub(1));
    let window_pieces = (window_bytes / piece_length).max(min_pieces);

    tracing::debug!(
        "prioritizer started: pieces {first_piece}..={last_piece}, window {window_pieces}"
    );

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(tick) => {}
        }

        let head = (first_piece..=last_piece).find(|index| !job.piece_complete(*index));

        let Some(head) = head else {
            tracing::debug!("prioritizer done: file fully downloaded");
            return;
        };

        let window_end = (head + window_pieces).min(last_piece + 1);
        job.set_piece_priority(head..window_end, PiecePriority::NowUrgent)
            .await;
    }
}

/// Number of pieces to pin at the head of a file when the download starts.
///
/// `window_bytes` worth of pieces, clamped to `[min, max]`.
pub fn initial_window_pieces(window_bytes: u64, piece_length: u64, min: u64, max: u64) -> u64 {
    if piece_length == 0 {
        return min;
    }
    (window_bytes / piece_length).clamp(min, max)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::super::{SimulatedTorrent, SimulationBackend, TorrentBackend};
    use super::*;

    #[test]
    fn test_initial_window_clamps() {
        let mib = 1024 * 1024;
        // 60 MiB of 1 MiB pieces
        assert_eq!(initial_window_pieces(60 * mib, mib, 10, 2000), 60);
        // Huge pieces: floor would be 3, clamp raises to 10
        assert_eq!(initial_window_pieces(60 * mib, 16 * mib, 10, 2000), 10);
        // Tiny pieces: cap at 2000
        assert_eq!(initial_window_pieces(60 * mib, 16 * 1024, 10, 2000), 2000);
        assert_eq!(initial_window_pieces(60 * mib, 0, 10, 2000), 10);
    }

    #[tokio::test]
    async fn test_window_tracks_download_head() {
        let dir = tempdir().unwrap();
        let mut script = SimulatedTorrent::quick_video("demo");
        script.files[0].length = 16 * 1024 * 1024; // 16 pieces
        let backend = SimulationBackend::new(dir.path().to_path_buf(), script);

        let job = backend
            .add_magnet("magnet:?xt=urn:btih:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
            .await
            .unwrap();
        job.await_info(Duration::from_secs(1)).await.unwrap();
        let file = job.files()[0].clone();
        job.request_full_download(0).await.unwrap();

        let job: Arc<dyn TorrentJob> = Arc::from(job);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_prioritizer(
            Arc::clone(&job),
            file,
            Duration::from_millis(20),
            4 * 1024 * 1024,
            2,
            cancel.clone(),
        ));

        // Prioritizer exits on its own once every piece is complete
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("prioritizer should finish")
            .unwrap();

        let marks = backend.urgent_marks();
        assert!(!marks.is_empty());
        // Windows never extend past the file's last piece
        assert!(marks.iter().all(|range| range.end <= 16));
        // Windows are 4 MiB / 1 MiB pieces wide except at the tail
        assert!(marks.iter().all(|range| range.end - range.start <= 4));
    }
}
