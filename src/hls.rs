//! The HLS Window Writer: a multi-variant structure that keeps per-track
//! media playlists and segment files in sync with decrypted DASH segments,
//! and composes the top-level master playlist.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ConverterError, Result};

/// One segment already written to a track's directory.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsSegment {
    pub sequence: u64,
    pub duration: f64,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Video,
    Audio,
}

/// Per-track bookkeeping: its own directory, playlist window, and metadata
/// used when composing the master playlist.
struct VariantState {
    track_type: TrackType,
    dir: PathBuf,
    /// Directory relative to the writer's output root, used in the master
    /// playlist's variant URI. Empty when this track's files live directly
    /// in the output root (the single-track layout).
    rel_dir: String,
    bandwidth: u64,
    codecs: Option<String>,
    resolution: Option<(u64, u64)>,
    init_written: bool,
    segments: VecDeque<HlsSegment>,
    target_duration: f64,
    finalized: bool,
}

impl VariantState {
    fn playlist_path(&self) -> PathBuf {
        self.dir.join("index.m3u8")
    }

    fn relative_playlist_uri(&self) -> String {
        if self.rel_dir.is_empty() {
            "index.m3u8".to_string()
        } else {
            format!("{}/index.m3u8", self.rel_dir)
        }
    }
}

/// Write `contents` to `path` via a sibling temp file plus rename, so HTTP
/// readers never observe a half-written playlist.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ConverterError::io(e, format!("creating {}", dir.display())))?;
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("playlist")
    ));
    std::fs::write(&tmp_path, contents).map_err(|e| ConverterError::io(e, format!("writing {}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path).map_err(|e| ConverterError::io(e, format!("renaming into {}", path.display())))?;
    Ok(())
}

/// Maintains every active track's media playlist and segment window, and
/// the master playlist referencing them all.
pub struct MultiVariantHlsWriter {
    output_dir: PathBuf,
    is_live: bool,
    window_size: usize,
    variants: Vec<(String, VariantState)>,
}

impl MultiVariantHlsWriter {
    pub fn new(output_dir: impl Into<PathBuf>, is_live: bool, window_size: usize) -> Self {
        MultiVariantHlsWriter {
            output_dir: output_dir.into(),
            is_live,
            window_size,
            variants: Vec::new(),
        }
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut VariantState> {
        self.variants.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Idempotent: creates the track on first call (deciding its directory
    /// from `single_track`), updates its metadata on every call after.
    /// `single_track` should be true only while this session has exactly
    /// one configured track, letting that track's files live directly in
    /// the output root instead of a subdirectory; once decided for a track
    /// it is not revisited, so a track set changing mid-session keeps
    /// whichever layout it started with.
    pub fn ensure_variant(
        &mut self,
        name: &str,
        track_type: TrackType,
        bandwidth: u64,
        codecs: Option<String>,
        resolution: Option<(u64, u64)>,
        single_track: bool,
    ) -> Result<()> {
        if let Some(state) = self.find_mut(name) {
            state.bandwidth = bandwidth;
            state.codecs = codecs;
            state.resolution = resolution;
            return Ok(());
        }

        let (dir, rel_dir) = if single_track {
            (self.output_dir.clone(), String::new())
        } else {
            (self.output_dir.join(name), name.to_string())
        };
        std::fs::create_dir_all(&dir).map_err(|e| ConverterError::io(e, format!("creating {}", dir.display())))?;

        self.variants.push((
            name.to_string(),
            VariantState {
                track_type,
                dir,
                rel_dir,
                bandwidth,
                codecs,
                resolution,
                init_written: false,
                segments: VecDeque::new(),
                target_duration: 1.0,
                finalized: false,
            },
        ));
        Ok(())
    }

    pub fn is_init_written(&self, name: &str) -> bool {
        self.variants.iter().find(|(n, _)| n == name).map(|(_, v)| v.init_written).unwrap_or(false)
    }

    pub fn write_init(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let state = self
            .find_mut(name)
            .ok_or_else(|| ConverterError::Other(format!("unknown track {name}")))?;
        let path = state.dir.join("init.mp4");
        std::fs::write(&path, bytes).map_err(|e| ConverterError::io(e, format!("writing {}", path.display())))?;
        state.init_written = true;
        self.write_master_playlist()
    }

    pub fn add_segment(&mut self, name: &str, sequence: u64, duration: f64, bytes: &[u8]) -> Result<()> {
        let is_live = self.is_live;
        let window_size = self.window_size;
        let state = self
            .find_mut(name)
            .ok_or_else(|| ConverterError::Other(format!("unknown track {name}")))?;

        let filename = format!("segment_{sequence}.m4s");
        let path = state.dir.join(&filename);
        std::fs::write(&path, bytes).map_err(|e| ConverterError::io(e, format!("writing {}", path.display())))?;

        state.segments.push_back(HlsSegment { sequence, duration, filename });
        state.target_duration = state.target_duration.max(duration);

        if is_live {
            while state.segments.len() > window_size {
                if let Some(evicted) = state.segments.pop_front() {
                    let evicted_path = state.dir.join(&evicted.filename);
                    if evicted_path.exists() {
                        if let Err(e) = std::fs::remove_file(&evicted_path) {
                            warn!("failed to evict {}: {e}", evicted_path.display());
                        }
                    }
                }
            }
        }

        self.write_media_playlist(name)
    }

    fn write_media_playlist(&mut self, name: &str) -> Result<()> {
        let is_live = self.is_live;
        let state = self
            .find_mut(name)
            .ok_or_else(|| ConverterError::Other(format!("unknown track {name}")))?;
        if state.segments.is_empty() {
            return Ok(());
        }

        let media_sequence = state.segments[0].sequence;
        let mut lines = vec![
            "#EXTM3U".to_string(),
            "#EXT-X-VERSION:7".to_string(),
            format!("#EXT-X-TARGETDURATION:{}", (state.target_duration + 0.5) as u64),
            format!("#EXT-X-MEDIA-SEQUENCE:{media_sequence}"),
        ];
        if !is_live {
            lines.push("#EXT-X-PLAYLIST-TYPE:VOD".to_string());
        }
        lines.push("#EXT-X-MAP:URI=\"init.mp4\"".to_string());
        for seg in &state.segments {
            lines.push(format!("#EXTINF:{:.6},", seg.duration));
            lines.push(seg.filename.clone());
        }
        if state.finalized && !is_live {
            lines.push("#EXT-X-ENDLIST".to_string());
        }
        lines.push(String::new());

        let path = state.playlist_path();
        write_atomic(&path, &lines.join("\n"))
    }

    fn write_master_playlist(&self) -> Result<()> {
        if !self.variants.iter().any(|(_, v)| v.init_written) {
            return Ok(());
        }

        let audio_bandwidth_sum: u64 = self
            .variants
            .iter()
            .filter(|(_, v)| v.track_type == TrackType::Audio && v.init_written)
            .map(|(_, v)| v.bandwidth)
            .sum();
        let has_video = self.variants.iter().any(|(_, v)| v.track_type == TrackType::Video && v.init_written);

        let mut lines = vec!["#EXTM3U".to_string(), "#EXT-X-VERSION:7".to_string()];

        for (name, v) in &self.variants {
            if v.track_type != TrackType::Audio || !v.init_written {
                continue;
            }
            if has_video {
                lines.push(format!(
                    "#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"audio\",NAME=\"{name}\",URI=\"{}\",DEFAULT=YES,AUTOSELECT=YES",
                    v.relative_playlist_uri()
                ));
            }
        }

        let has_audio = self.variants.iter().any(|(_, s)| s.track_type == TrackType::Audio && s.init_written);
        let audio_codecs: Vec<&str> = self
            .variants
            .iter()
            .filter(|(_, s)| s.track_type == TrackType::Audio && s.init_written)
            .filter_map(|(_, s)| s.codecs.as_deref())
            .collect();

        for (_, v) in &self.variants {
            if v.track_type != TrackType::Video || !v.init_written {
                continue;
            }
            let bandwidth = v.bandwidth + audio_bandwidth_sum;
            let mut attrs = vec![format!("BANDWIDTH={bandwidth}")];
            if let Some((w, h)) = v.resolution {
                attrs.push(format!("RESOLUTION={w}x{h}"));
            }
            let mut codecs: Vec<&str> = v.codecs.as_deref().into_iter().collect();
            codecs.extend(audio_codecs.iter().copied());
            if !codecs.is_empty() {
                attrs.push(format!("CODECS=\"{}\"", codecs.join(",")));
            }
            if has_audio {
                attrs.push("AUDIO=\"audio\"".to_string());
            }
            lines.push(format!("#EXT-X-STREAM-INF:{}", attrs.join(",")));
            lines.push(v.relative_playlist_uri());
        }

        if !has_video {
            // Audio-only streams: emit audio as plain variants, no #EXT-X-MEDIA tags.
            for (_, v) in &self.variants {
                if v.track_type != TrackType::Audio || !v.init_written {
                    continue;
                }
                let mut attrs = vec![format!("BANDWIDTH={}", v.bandwidth)];
                if let Some(codecs) = &v.codecs {
                    attrs.push(format!("CODECS=\"{codecs}\""));
                }
                lines.push(format!("#EXT-X-STREAM-INF:{}", attrs.join(",")));
                lines.push(v.relative_playlist_uri());
            }
        }

        lines.push(String::new());
        let path = self.output_dir.join("master.m3u8");
        write_atomic(&path, &lines.join("\n"))
    }

    /// Flip every track's `finalized` flag and rewrite its media playlist so
    /// VOD completion emits `#EXT-X-ENDLIST`.
    pub fn finalize(&mut self) -> Result<()> {
        let names: Vec<String> = self.variants.iter().map(|(n, _)| n.clone()).collect();
        for (_, v) in &mut self.variants {
            v.finalized = true;
        }
        for name in names {
            self.write_media_playlist(&name)?;
        }
        debug!("finalized HLS output at {}", self.output_dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn live_window_evicts_oldest() {
        let dir = tempdir().unwrap();
        let mut writer = MultiVariantHlsWriter::new(dir.path(), true, 3);
        writer.ensure_variant("video", TrackType::Video, 1_000_000, Some("avc1".into()), Some((640, 360)), true).unwrap();
        writer.write_init("video", b"ftypinit").unwrap();
        for seq in 1..=6u64 {
            writer.add_segment("video", seq, 1.0, format!("seg{seq}").as_bytes()).unwrap();
        }

        for seq in 1..=3u64 {
            assert!(!dir.path().join(format!("segment_{seq}.m4s")).exists());
        }
        for seq in 4..=6u64 {
            assert!(dir.path().join(format!("segment_{seq}.m4s")).exists());
        }

        let playlist = read(&dir.path().join("index.m3u8"));
        assert!(playlist.contains("#EXT-X-MEDIA-SEQUENCE:4"));
        assert_eq!(playlist.matches("#EXTINF").count(), 3);
    }

    #[test]
    fn vod_finalize_emits_endlist_and_master_references_both_tracks() {
        let dir = tempdir().unwrap();
        let mut writer = MultiVariantHlsWriter::new(dir.path(), false, 6);
        writer.ensure_variant("video", TrackType::Video, 900_000, Some("avc1".into()), Some((1280, 720)), false).unwrap();
        writer.ensure_variant("audio", TrackType::Audio, 128_000, Some("mp4a".into()), None, false).unwrap();
        writer.write_init("video", b"ftypinit").unwrap();
        writer.write_init("audio", b"ftypinit").unwrap();
        for seq in 1..=3u64 {
            writer.add_segment("video", seq, 4.0, b"v").unwrap();
        }
        for seq in 1..=2u64 {
            writer.add_segment("audio", seq, 6.0, b"a").unwrap();
        }
        writer.finalize().unwrap();

        let video_playlist = read(&dir.path().join("video/index.m3u8"));
        let audio_playlist = read(&dir.path().join("audio/index.m3u8"));
        assert!(video_playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
        assert!(audio_playlist.trim_end().ends_with("#EXT-X-ENDLIST"));

        let master = read(&dir.path().join("master.m3u8"));
        assert!(master.contains("GROUP-ID=\"audio\""));
        assert!(master.contains("AUDIO=\"audio\""));
        assert!(master.contains("video/index.m3u8"));
    }

    #[test]
    fn single_track_video_uses_root_directory() {
        let dir = tempdir().unwrap();
        let mut writer = MultiVariantHlsWriter::new(dir.path(), false, 6);
        writer.ensure_variant("video", TrackType::Video, 500_000, None, None, true).unwrap();
        writer.write_init("video", b"ftypinit").unwrap();
        writer.add_segment("video", 1, 4.0, b"v").unwrap();

        assert!(dir.path().join("init.mp4").exists());
        assert!(dir.path().join("index.m3u8").exists());
        let master = read(&dir.path().join("master.m3u8"));
        assert!(master.contains("index.m3u8"));
        assert!(!master.contains("video/index.m3u8"));
    }

    #[test]
    fn master_not_written_until_an_init_is_present() {
        let dir = tempdir().unwrap();
        let mut writer = MultiVariantHlsWriter::new(dir.path(), true, 6);
        writer.ensure_variant("video", TrackType::Video, 500_000, None, None, true).unwrap();
        assert!(!dir.path().join("master.m3u8").exists());
    }
}
