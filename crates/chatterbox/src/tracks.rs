//! The clip library: playable files in the sound directory.

use std::path::{Path, PathBuf};

use chatterconf::TrackMeta;
use serde::Serialize;

use crate::decode::read_duration;
use crate::error::ChatterError;

/// Extensions offered as tracks (compared case-insensitively).
pub const TRACK_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg"];

/// A playable clip. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Track {
    pub path: PathBuf,
    /// File name inside the sound directory; what `play` takes.
    pub file: String,
    /// Display name: the stem with underscores as spaces.
    pub name: String,
    /// Seconds, when the header states it.
    pub duration: Option<f64>,
    /// Default gain from the settings document.
    pub gain_db: Option<f32>,
    /// Categories from the settings document.
    pub tags: Vec<String>,
}

impl Track {
    pub fn from_path(path: PathBuf) -> Option<Self> {
        let file = path.file_name()?.to_str()?.to_string();
        let name = path.file_stem()?.to_str()?.replace('_', " ");
        Some(Self {
            path,
            file,
            name,
            duration: None,
            gain_db: None,
            tags: Vec::new(),
        })
    }

    /// Attach the stored gain and categories for this file, if any.
    pub fn with_meta(mut self, meta: Option<&TrackMeta>) -> Self {
        if let Some(meta) = meta {
            self.gain_db = meta.gain_db;
            self.tags = meta.tags.clone();
        }
        self
    }
}

fn is_playable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| TRACK_EXTENSIONS.iter().any(|t| e.eq_ignore_ascii_case(t)))
            .unwrap_or(false)
}

/// Playable files in `dir`, sorted by file name, with durations read from
/// their headers. A missing directory is empty.
pub fn list_tracks(dir: &Path) -> Result<Vec<Track>, ChatterError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(ChatterError::Store(format!(
                "cannot list {}: {}",
                dir.display(),
                e
            )))
        }
    };

    let mut tracks: Vec<Track> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| is_playable(p))
        .filter_map(Track::from_path)
        .map(|mut track| {
            track.duration = read_duration(&track.path);
            track
        })
        .collect();
    tracks.sort_by(|a, b| a.file.cmp(&b.file));
    Ok(tracks)
}

/// Resolve `file` to a track strictly inside `dir`.
pub fn resolve_track(dir: &Path, file: &str) -> Result<Track, ChatterError> {
    let invalid = || ChatterError::DecodeFailure(format!("invalid track name '{file}'"));

    let candidate = Path::new(file);
    if file.is_empty() || candidate.is_absolute() || candidate.components().count() != 1 {
        return Err(invalid());
    }

    let root = dir
        .canonicalize()
        .map_err(|e| ChatterError::DecodeFailure(format!("{}: {}", dir.display(), e)))?;
    let path = root
        .join(candidate)
        .canonicalize()
        .map_err(|_| ChatterError::DecodeFailure(format!("track not found: {file}")))?;
    if !path.starts_with(&root) {
        return Err(invalid());
    }
    if !is_playable(&path) {
        return Err(ChatterError::DecodeFailure(format!("not a playable file: {file}")));
    }

    Track::from_path(path).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn library() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b_side.wav", "Intro.MP3", "notes.txt", "a_laugh.ogg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("sub.mp3")).unwrap();
        dir
    }

    #[test]
    fn test_list_filters_and_sorts() {
        let dir = library();
        let tracks = list_tracks(dir.path()).unwrap();
        let files: Vec<_> = tracks.iter().map(|t| t.file.as_str()).collect();
        assert_eq!(files, ["Intro.MP3", "a_laugh.ogg", "b_side.wav"]);
        assert_eq!(tracks[1].name, "a laugh");
    }

    #[test]
    fn test_list_reads_duration() {
        let dir = library();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(dir.path().join("c_clip.wav"), spec).unwrap();
        for _ in 0..2_000 {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();

        let tracks = list_tracks(dir.path()).unwrap();
        let clip = tracks.iter().find(|t| t.file == "c_clip.wav").unwrap();
        assert_eq!(clip.duration, Some(0.25));
        // placeholder bytes carry no header
        let side = tracks.iter().find(|t| t.file == "b_side.wav").unwrap();
        assert_eq!(side.duration, None);
    }

    #[test]
    fn test_with_meta() {
        let dir = library();
        let meta = TrackMeta {
            gain_db: Some(-3.0),
            tags: vec!["greetings".into()],
            ..TrackMeta::default()
        };
        let track = resolve_track(dir.path(), "b_side.wav").unwrap();
        assert_eq!(track.clone().with_meta(None), track);

        let track = track.with_meta(Some(&meta));
        assert_eq!(track.gain_db, Some(-3.0));
        assert_eq!(track.tags, ["greetings"]);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        assert!(list_tracks(Path::new("/nonexistent/sounds")).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = library();
        for bad in ["../etc/passwd", "/etc/passwd", "", "sub/../b_side.wav"] {
            assert!(
                matches!(resolve_track(dir.path(), bad), Err(ChatterError::DecodeFailure(_))),
                "{bad} should be rejected"
            );
        }
        assert!(resolve_track(dir.path(), "missing.wav").is_err());
        assert!(resolve_track(dir.path(), "notes.txt").is_err());
        assert_eq!(resolve_track(dir.path(), "b_side.wav").unwrap().name, "b side");
    }
}
