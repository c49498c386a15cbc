//! File readiness predicates shared by the stream pipeline and the HTTP surface.
//!
//! Transcoder output appears on disk incrementally, so serving code must never
//! trust a bare `stat`. A file is treated as fully written once its size has
//! held still for a short window.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of waiting for a file to exist and stop growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableWait {
    /// File exists and its size was unchanged for the whole stability window.
    Stable,
    /// File never appeared before the deadline.
    NeverAppeared,
    /// File appeared but kept changing until the deadline.
    NeverStabilized,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// Waits until `path` exists and its size has been unchanged for
/// `stability_window`, polling at `poll_interval`.
///
/// The stability window restarts whenever the observed size changes.
pub async fn wait_for_stable_file(
    path: &Path,
    deadline: Duration,
    stability_window: Duration,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> StableWait {
    let until = Instant::now() + deadline;
    let mut last_size: Option<u64> = None;
    let mut stable_since: Option<Instant> = None;
    let mut appeared = false;

    loop {
        if cancel.is_cancelled() {
            return StableWait::Cancelled;
        }

        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                appeared = true;
                let size = meta.len();
                if last_size == Some(size) {
                    let since = *stable_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= stability_window {
                        return StableWait::Stable;
                    }
                } else {
                    last_size = Some(size);
                    stable_since = None;
                }
            }
            Err(_) => {
                last_size = None;
                stable_since = None;
            }
        }

        if Instant::now() >= until {
            return if appeared {
                StableWait::NeverStabilized
            } else {
                StableWait::NeverAppeared
            };
        }

        tokio::select! {
            () = cancel.cancelled() => return StableWait::Cancelled,
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Counts `.ts` segment files in a rendition directory.
///
/// Missing or unreadable directories count as zero segments.
pub fn count_segments(dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("ts"))
        })
        .count()
}

/// Returns the size of `path`, or `None` if it does not exist.
pub fn file_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|meta| meta.len())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn test_stable_file_detected_after_growth_stops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("segment000.ts");
        let cancel = CancellationToken::new();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            for chunk in 0..3u8 {
                tokio::fs::write(&writer_path, vec![chunk; 1024 * (chunk as usize + 1)])
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let result = wait_for_stable_file(
            &path,
            Duration::from_secs(5),
            Duration::from_millis(200),
            Duration::from_millis(25),
            &cancel,
        )
        .await;

        writer.await.unwrap();
        assert_eq!(result, StableWait::Stable);
        assert_eq!(file_size(&path), Some(3 * 1024));
    }

    #[tokio::test]
    async fn test_missing_file_reports_never_appeared() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.ts");
        let cancel = CancellationToken::new();

        let result = wait_for_stable_file(
            &path,
            Duration::from_millis(200),
            Duration::from_millis(100),
            Duration::from_millis(25),
            &cancel,
        )
        .await;

        assert_eq!(result, StableWait::NeverAppeared);
    }

    #[tokio::test]
    async fn test_forever_growing_file_reports_never_stabilized() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("grow.ts");
        let cancel = CancellationToken::new();

        let writer_path = path.clone();
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            let mut size = 1usize;
            while !writer_cancel.is_cancelled() {
                tokio::fs::write(&writer_path, vec![0u8; size]).await.unwrap();
                size += 1;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let result = wait_for_stable_file(
            &path,
            Duration::from_millis(500),
            Duration::from_millis(200),
            Duration::from_millis(25),
            &cancel,
        )
        .await;

        cancel.cancel();
        writer.await.unwrap();
        assert_eq!(result, StableWait::NeverStabilized);
    }

    #[tokio::test]
    async fn test_cancellation_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("never.ts");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = wait_for_stable_file(
            &path,
            Duration::from_secs(5),
            Duration::from_millis(200),
            Duration::from_millis(25),
            &cancel,
        )
        .await;

        assert_eq!(result, StableWait::Cancelled);
    }

    #[test]
    fn test_count_segments_ignores_other_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("segment000.ts"), b"a").unwrap();
        std::fs::write(dir.path().join("segment001.ts"), b"b").unwrap();
        std::fs::write(dir.path().join("playlist.m3u8"), b"#EXTM3U").unwrap();
        std::fs::write(dir.path().join("segment002.ts.tmp"), b"c").unwrap();

        assert_eq!(count_segments(dir.path()), 2);
        assert_eq!(count_segments(&dir.path().join("missing")), 0);
    }
}
