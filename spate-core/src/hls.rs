//! Master playlist construction.
//!
//! The master is written eagerly, before any rendition worker has produced a
//! playlist: ABR players fetch every listed rendition during initial load, so
//! the master must exist while the per-rendition requests block downstream.

use std::fmt::Write as _;
use std::path::Path;

use crate::probe::AudioTrack;
use crate::transcode::RenditionSpec;

/// Name of the audio group referenced by every variant row.
const AUDIO_GROUP: &str = "audio";

/// Renders the master playlist for a planned ladder.
///
/// Every planned rendition is listed regardless of whether its worker has
/// started writing. With two or more audio tracks the playlist carries an
/// audio group; the tracks are multiplexed into the segments, so the media
/// rows have no URI.
pub fn build_master_playlist(ladder: &[RenditionSpec], audio_tracks: &[AudioTrack]) -> String {
    let multi_audio = audio_tracks.len() >= 2;

    let mut playlist = String::from("#EXTM3U\n");
    // EXT-X-MEDIA needs version 4
    let version = if multi_audio { 4 } else { 3 };
    let _ = writeln!(playlist, "#EXT-X-VERSION:{version}");

    if multi_audio {
        let default_index = audio_tracks
            .iter()
            .position(|track| track.is_default)
            .unwrap_or(0);

        for (index, track) in audio_tracks.iter().enumerate() {
            let flag = if index == default_index { "YES" } else { "NO" };
            let name = if track.title.is_empty() {
                crate::probe::language_display_name(&track.language)
            } else {
                track.title.as_str()
            };
            let _ = write!(
                playlist,
                "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{AUDIO_GROUP}\",NAME=\"{name}\",LANGUAGE=\"{}\",DEFAULT={flag},AUTOSELECT={flag}",
                track.language
            );
            if track.channels > 0 {
                let _ = write!(playlist, ",CHANNELS=\"{}\"", track.channels);
            }
            playlist.push('\n');
        }
        playlist.push('\n');
    }

    for spec in ladder {
        let bandwidth = u64::from(spec.video_bitrate_k) * 1000;
        let _ = write!(
            playlist,
            "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},RESOLUTION={}x{},NAME=\"{}\"",
            spec.width, spec.height, spec.name
        );
        if multi_audio {
            let _ = write!(playlist, ",AUDIO=\"{AUDIO_GROUP}\"");
        }
        playlist.push('\n');
        let _ = writeln!(playlist, "{}/playlist.m3u8", spec.name);
    }

    playlist
}

/// Writes the master playlist atomically (temp file + rename).
///
/// # Errors
/// Returns the underlying I/O error if the temp file cannot be written or
/// renamed into place.
pub fn write_master_playlist(
    path: &Path,
    ladder: &[RenditionSpec],
    audio_tracks: &[AudioTrack],
) -> std::io::Result<()> {
    let content = build_master_playlist(ladder, audio_tracks);
    let temp = path.with_extension("m3u8.tmp");
    std::fs::write(&temp, content)?;
    std::fs::rename(&temp, path)?;
    tracing::debug!(
        "master playlist written: {} renditions, {} audio tracks",
        ladder.len(),
        audio_tracks.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::transcode::plan_ladder;

    fn track(index: usize, language: &str, title: &str, is_default: bool) -> AudioTrack {
        AudioTrack {
            index,
            stream_index: index + 1,
            language: language.to_string(),
            title: title.to_string(),
            codec: "aac".to_string(),
            channels: 2,
            is_default,
        }
    }

    #[test]
    fn test_single_audio_master_lists_whole_ladder() {
        let ladder = plan_ladder(1080);
        let master = build_master_playlist(&ladder, &[track(0, "und", "Unknown", true)]);

        assert!(master.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n"));
        assert!(!master.contains("#EXT-X-MEDIA"));
        for spec in &ladder {
            assert!(master.contains(&format!("NAME=\"{}\"", spec.name)));
            assert!(master.contains(&format!("{}/playlist.m3u8", spec.name)));
        }
        // Bandwidth is the nominal video bitrate in bits per second
        assert!(master.contains("BANDWIDTH=400000,RESOLUTION=426x240"));
        assert!(master.contains("BANDWIDTH=5000000,RESOLUTION=1920x1080"));
    }

    #[test]
    fn test_multi_audio_master_declares_group() {
        let ladder = plan_ladder(720);
        let tracks = vec![
            track(0, "eng", "English", false),
            track(1, "jpn", "日本語", true),
        ];
        let master = build_master_playlist(&ladder, &tracks);

        assert!(master.contains("#EXT-X-VERSION:4"));
        assert!(master.contains(
            "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"English\",LANGUAGE=\"eng\",DEFAULT=NO,AUTOSELECT=NO,CHANNELS=\"2\""
        ));
        // The flagged default wins over the first track
        assert!(master.contains("NAME=\"日本語\",LANGUAGE=\"jpn\",DEFAULT=YES"));
        // Every variant references the audio group
        assert_eq!(master.matches("AUDIO=\"audio\"").count(), ladder.len());
    }

    #[test]
    fn test_bandwidth_ordering_is_ascending() {
        let master = build_master_playlist(&plan_ladder(2160), &[]);
        let bandwidths: Vec<u64> = master
            .lines()
            .filter_map(|line| line.strip_prefix("#EXT-X-STREAM-INF:BANDWIDTH="))
            .filter_map(|rest| rest.split(',').next())
            .filter_map(|value| value.parse().ok())
            .collect();
        let mut sorted = bandwidths.clone();
        sorted.sort_unstable();
        assert_eq!(bandwidths, sorted);
        assert_eq!(bandwidths.len(), 7);
    }

    #[test]
    fn test_write_is_atomic_rename() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master.m3u8");
        write_master_playlist(&path, &plan_ladder(480), &[]).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("480p/playlist.m3u8"));
        // No temp file left behind
        assert!(!dir.path().join("master.m3u8.tmp").exists());
    }
}
