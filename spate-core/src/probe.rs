//! Media probing via ffprobe.
//!
//! The pipeline needs three answers from a partially downloaded file: can the
//! demuxer open it at all, what resolution is the video, and which audio
//! tracks exist. Probing is behind a trait so tests can run without ffprobe
//! installed.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Resolution assumed when the source cannot be probed.
pub const DEFAULT_RESOLUTION: (u32, u32) = (1920, 1080);

/// One audio track discovered in the source container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTrack {
    /// Dense 0-based index among audio tracks
    pub index: usize,
    /// Absolute stream index within the container
    pub stream_index: usize,
    /// ISO-639 language code, "und" when untagged
    pub language: String,
    /// Track title, falls back to a display name for the language
    pub title: String,
    /// Source codec name (aac, ac3, dts, ...)
    pub codec: String,
    /// Channel count (2 = stereo, 6 = 5.1)
    pub channels: u32,
    /// Whether this is the container's default track
    pub is_default: bool,
}

/// Probe results persisted in the metadata cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub video_codec: String,
    pub audio_codec: String,
    pub audio_track_count: usize,
    pub subtitle_track_count: usize,
}

/// Source-file probing operations.
#[async_trait]
pub trait MediaProber: Send + Sync {
    /// Whether the demuxer can open the file, bounded by `deadline`.
    ///
    /// A partially downloaded file is legible once its header pieces are on
    /// disk; before that this returns false.
    async fn can_probe(&self, path: &Path, deadline: Duration) -> bool;

    /// Video resolution of the first video stream, if readable.
    async fn resolution(&self, path: &Path) -> Option<(u32, u32)>;

    /// All audio tracks in the container, in stream order.
    async fn audio_tracks(&self, path: &Path) -> Vec<AudioTrack>;

    /// Duration, codecs and track counts for the metadata cache.
    async fn media_info(&self, path: &Path) -> Option<MediaInfo>;
}

/// Production prober shelling out to ffprobe.
pub struct FfprobeProber;

impl FfprobeProber {
    async fn probe_json(
        &self,
        path: &Path,
        select: Option<&str>,
        entries: &str,
    ) -> Option<serde_json::Value> {
        let mut command = tokio::process::Command::new("ffprobe");
        command.args(["-v", "error"]);
        if let Some(select) = select {
            command.args(["-select_streams", select]);
        }
        let output = command
            .args(["-show_entries", entries])
            .args(["-of", "json"])
            .arg(path)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            tracing::debug!(
                "ffprobe failed for {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr)
            );
            return None;
        }

        serde_json::from_slice(&output.stdout).ok()
    }
}

#[derive(Deserialize)]
struct FfprobeStreams {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    codec_name: String,
    #[serde(default)]
    codec_type: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    channels: Option<u32>,
    #[serde(default)]
    tags: FfprobeTags,
}

#[derive(Default, Deserialize)]
struct FfprobeTags {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    #[serde(default)]
    duration: Option<String>,
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn can_probe(&self, path: &Path, deadline: Duration) -> bool {
        let mut command = tokio::process::Command::new("ffprobe");
        command
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            // Short analysis bounds so a file with only header pieces answers fast
            .args(["-analyzeduration", "1000000"])
            .args(["-probesize", "5000000"])
            .arg(path);

        match tokio::time::timeout(deadline, command.output()).await {
            Ok(Ok(output)) => output.status.success(),
            Ok(Err(error)) => {
                tracing::warn!("ffprobe could not be spawned: {error}");
                false
            }
            Err(_) => false,
        }
    }

    async fn resolution(&self, path: &Path) -> Option<(u32, u32)> {
        let value = self
            .probe_json(path, Some("v:0"), "stream=width,height")
            .await?;
        let parsed: FfprobeStreams = serde_json::from_value(value).ok()?;
        let stream = parsed.streams.first()?;
        match (stream.width, stream.height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => Some((width, height)),
            _ => None,
        }
    }

    async fn audio_tracks(&self, path: &Path) -> Vec<AudioTrack> {
        let Some(value) = self
            .probe_json(
                path,
                Some("a"),
                "stream=index,codec_name,channels:stream_tags=language,title",
            )
            .await
        else {
            return Vec::new();
        };
        let Ok(parsed) = serde_json::from_value::<FfprobeStreams>(value) else {
            return Vec::new();
        };

        parsed
            .streams
            .into_iter()
            .enumerate()
            .map(|(index, stream)| {
                let language = stream
                    .tags
                    .language
                    .filter(|lang| !lang.is_empty())
                    .unwrap_or_else(|| "und".to_string());
                let title = stream
                    .tags
                    .title
                    .filter(|title| !title.is_empty())
                    .unwrap_or_else(|| language_display_name(&language).to_string());
                AudioTrack {
                    index,
                    stream_index: stream.index,
                    language,
                    title,
                    codec: stream.codec_name,
                    channels: stream.channels.unwrap_or(0),
                    // First track is the default unless the container says otherwise
                    is_default: index == 0,
                }
            })
            .collect()
    }

    async fn media_info(&self, path: &Path) -> Option<MediaInfo> {
        let value = self
            .probe_json(path, None, "stream=index,codec_type,codec_name:format=duration")
            .await?;
        let parsed: FfprobeStreams = serde_json::from_value(value).ok()?;

        let duration_secs = parsed
            .format
            .and_then(|format| format.duration)
            .and_then(|duration| duration.trim().parse::<f64>().ok())
            .unwrap_or(0.0);

        let mut info = MediaInfo {
            duration_secs,
            ..Default::default()
        };
        for stream in &parsed.streams {
            match stream.codec_type.as_str() {
                "video" if info.video_codec.is_empty() => {
                    info.video_codec = stream.codec_name.clone();
                }
                "audio" => {
                    if info.audio_codec.is_empty() {
                        info.audio_codec = stream.codec_name.clone();
                    }
                    info.audio_track_count += 1;
                }
                "subtitle" => info.subtitle_track_count += 1,
                _ => {}
            }
        }
        Some(info)
    }
}

/// Simulation prober returning fixed answers once the file exists.
///
/// Lets the pipeline be exercised end-to-end without ffprobe installed.
pub struct StaticProber {
    pub width: u32,
    pub height: u32,
    pub tracks: Vec<AudioTrack>,
    pub info: MediaInfo,
    /// Minimum file size before `can_probe` reports success
    pub min_probe_size: u64,
}

impl StaticProber {
    /// A 1080p source with a single untagged stereo track.
    pub fn plain_1080p() -> Self {
        Self {
            width: 1920,
            height: 1080,
            tracks: vec![AudioTrack {
                index: 0,
                stream_index: 1,
                language: "und".to_string(),
                title: "Unknown".to_string(),
                codec: "aac".to_string(),
                channels: 2,
                is_default: true,
            }],
            info: MediaInfo {
                duration_secs: 120.0,
                video_codec: "h264".to_string(),
                audio_codec: "aac".to_string(),
                audio_track_count: 1,
                subtitle_track_count: 0,
            },
            min_probe_size: 1,
        }
    }
}

#[async_trait]
impl MediaProber for StaticProber {
    async fn can_probe(&self, path: &Path, _deadline: Duration) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.len() >= self.min_probe_size)
            .unwrap_or(false)
    }

    async fn resolution(&self, _path: &Path) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }

    async fn audio_tracks(&self, _path: &Path) -> Vec<AudioTrack> {
        self.tracks.clone()
    }

    async fn media_info(&self, _path: &Path) -> Option<MediaInfo> {
        Some(self.info.clone())
    }
}

/// Display name for an ISO-639 language code, used when a track has no title.
pub fn language_display_name(code: &str) -> &str {
    match code {
        "por" | "pt" => "Português",
        "eng" | "en" => "English",
        "spa" | "es" => "Español",
        "jpn" | "ja" => "日本語",
        "ger" | "de" => "Deutsch",
        "fre" | "fr" => "Français",
        "ita" | "it" => "Italiano",
        "rus" | "ru" => "Русский",
        "kor" | "ko" => "한국어",
        "chi" | "zh" => "中文",
        "ara" | "ar" => "العربية",
        "hin" | "hi" => "हिन्दी",
        "und" => "Unknown",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_display_name() {
        assert_eq!(language_display_name("eng"), "English");
        assert_eq!(language_display_name("und"), "Unknown");
        assert_eq!(language_display_name("xyz"), "xyz");
    }

    #[tokio::test]
    async fn test_static_prober_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.mkv");
        let prober = StaticProber::plain_1080p();

        assert!(!prober.can_probe(&path, Duration::from_secs(1)).await);

        std::fs::write(&path, b"data").unwrap();
        assert!(prober.can_probe(&path, Duration::from_secs(1)).await);
        assert_eq!(prober.resolution(&path).await, Some((1920, 1080)));
        assert_eq!(prober.audio_tracks(&path).await.len(), 1);
    }

    #[test]
    fn test_ffprobe_json_shape_parses() {
        let raw = serde_json::json!({
            "streams": [
                {"index": 1, "codec_name": "ac3", "channels": 6,
                 "tags": {"language": "eng", "title": "Surround"}},
                {"index": 2, "codec_name": "aac", "channels": 2, "tags": {}}
            ]
        });
        let parsed: FfprobeStreams = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.streams.len(), 2);
        assert_eq!(parsed.streams[0].tags.language.as_deref(), Some("eng"));
        assert_eq!(parsed.streams[1].channels, Some(2));
    }
}
