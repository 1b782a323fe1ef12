//! Single-rendition HLS packaging of a merged recording through ffmpeg.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use hex::encode as hex_encode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;

use crate::config::TranscodeSection;
use crate::exec::{self, CommandExecutor, CommandOutcome};

const SEGMENT_PATTERN: &str = "segment_%05d.ts";
const MANIFEST_NAME: &str = "manifest.json";

pub type TranscodeResult<T> = Result<T, TranscodeError>;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("could not start encoder ({command}): {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoder timed out after {limit:?} ({command})")]
    Timeout { command: String, limit: Duration },
    #[error("encoder failed ({command}) with status {status:?}: {stderr}")]
    Encoder {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("invalid playlist {path}: {detail}")]
    Playlist { path: PathBuf, detail: String },
    #[error("playlist references missing segment {path}")]
    MissingSegment { path: PathBuf },
    #[error("segments add up to {actual:.3}s but the recording is {expected:.3}s (tolerance {tolerance}s)")]
    DurationMismatch {
        expected: f64,
        actual: f64,
        tolerance: f64,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid playback url: {0}")]
    Url(#[from] url::ParseError),
    #[error("manifest serialisation failed: {0}")]
    Manifest(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub ffmpeg: PathBuf,
    pub max_width: u32,
    pub max_height: u32,
    pub video_codec: String,
    pub preset: String,
    pub video_bitrate: String,
    pub video_maxrate: String,
    pub video_bufsize: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub segment_duration: u32,
    pub playlist_name: String,
    pub timeout: Duration,
    pub duration_tolerance: f64,
}

impl From<&TranscodeSection> for TranscodeSettings {
    fn from(section: &TranscodeSection) -> Self {
        Self {
            ffmpeg: PathBuf::from(&section.ffmpeg),
            max_width: section.max_width,
            max_height: section.max_height,
            video_codec: section.video_codec.clone(),
            preset: section.preset.clone(),
            video_bitrate: section.video_bitrate.clone(),
            video_maxrate: section.video_maxrate.clone(),
            video_bufsize: section.video_bufsize.clone(),
            audio_codec: section.audio_codec.clone(),
            audio_bitrate: section.audio_bitrate.clone(),
            segment_duration: section.segment_duration_seconds,
            playlist_name: section.playlist_name.clone(),
            timeout: Duration::from_secs(section.timeout_seconds),
            duration_tolerance: section.duration_tolerance_seconds,
        }
    }
}

/// Encoder arguments: bounded resolution, capped bitrates and keyframes
/// forced on every segment boundary so each segment decodes on its own.
pub fn build_ffmpeg_args(settings: &TranscodeSettings, input: &Path, output_dir: &Path) -> Vec<String> {
    let scale = format!(
        "scale=w='min({w},iw)':h='min({h},ih)':force_original_aspect_ratio=decrease:force_divisible_by=2",
        w = settings.max_width,
        h = settings.max_height,
    );
    let segment = settings.segment_duration;
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-i".into(),
        input.display().to_string(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a:0?".into(),
        "-vf".into(),
        scale,
        "-c:v".into(),
        settings.video_codec.clone(),
        "-preset".into(),
        settings.preset.clone(),
        "-b:v".into(),
        settings.video_bitrate.clone(),
        "-maxrate".into(),
        settings.video_maxrate.clone(),
        "-bufsize".into(),
        settings.video_bufsize.clone(),
        "-force_key_frames".into(),
        format!("expr:gte(t,n_forced*{segment})"),
        "-sc_threshold".into(),
        "0".into(),
        "-c:a".into(),
        settings.audio_codec.clone(),
        "-b:a".into(),
        settings.audio_bitrate.clone(),
        "-ac".into(),
        "2".into(),
        "-f".into(),
        "hls".into(),
        "-hls_time".into(),
        segment.to_string(),
        "-hls_playlist_type".into(),
        "vod".into(),
        "-hls_flags".into(),
        "independent_segments".into(),
        "-hls_segment_filename".into(),
        output_dir.join(SEGMENT_PATTERN).display().to_string(),
        output_dir.join(&settings.playlist_name).display().to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct HlsPlaylist {
    pub version: u32,
    pub target_duration: f64,
    pub segments: Vec<HlsEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HlsEntry {
    pub duration: f64,
    pub uri: String,
}

impl HlsPlaylist {
    pub fn parse(contents: &str) -> Result<Self, String> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err("missing #EXTM3U header".into());
        }
        let mut version = 3u32;
        let mut target_duration = 0.0f64;
        let mut segments = Vec::new();
        let mut pending_duration: Option<f64> = None;
        for line in contents.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
                version = value.parse().map_err(|_| "invalid EXT-X-VERSION")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                target_duration = value.parse().map_err(|_| "invalid EXT-X-TARGETDURATION")?;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .parse()
                    .map_err(|_| "invalid EXTINF duration")?;
                pending_duration = Some(duration);
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else if let Some(duration) = pending_duration.take() {
                segments.push(HlsEntry {
                    duration,
                    uri: line.to_string(),
                });
            }
        }
        if segments.is_empty() {
            return Err("playlist has no segments".into());
        }
        Ok(Self {
            version,
            target_duration,
            segments,
        })
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|segment| segment.duration).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    pub index: usize,
    pub duration: f64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeOutcome {
    pub output_dir: PathBuf,
    pub playlist_path: PathBuf,
    pub playback_url: String,
    pub segments: Vec<Segment>,
    pub total_duration: f64,
    pub manifest_path: PathBuf,
}

impl TranscodeOutcome {
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

#[derive(Debug, Serialize)]
struct Manifest {
    session_id: String,
    playlist: String,
    playlist_sha256: String,
    total_duration: f64,
    segments: Vec<ManifestSegment>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ManifestSegment {
    index: usize,
    uri: String,
    duration: f64,
    bytes: u64,
    sha256: String,
}

pub struct Transcoder {
    settings: TranscodeSettings,
    executor: Arc<dyn CommandExecutor>,
    output_root: PathBuf,
    public_base: Url,
}

impl Transcoder {
    pub fn new(
        settings: TranscodeSettings,
        executor: Arc<dyn CommandExecutor>,
        output_root: impl Into<PathBuf>,
        public_base: Url,
    ) -> Self {
        Self {
            settings,
            executor,
            output_root: output_root.into(),
            public_base,
        }
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    pub fn output_dir(&self, session_id: &str) -> PathBuf {
        self.output_root.join(session_id)
    }

    pub fn playback_url(&self, session_id: &str) -> TranscodeResult<Url> {
        Ok(self
            .public_base
            .join(&format!("{session_id}/{}", self.settings.playlist_name))?)
    }

    /// Encodes `input` into `<output_root>/<session>/` and validates the
    /// result. `expected_duration` (from probing the input) is compared with
    /// the sum of segment durations when known.
    pub async fn transcode(
        &self,
        session_id: &str,
        input: &Path,
        expected_duration: Option<f64>,
    ) -> TranscodeResult<TranscodeOutcome> {
        let output_dir = self.output_dir(session_id);
        reset_dir(&output_dir).await?;

        let args = build_ffmpeg_args(&self.settings, input, &output_dir);
        let mut command = Command::new(&self.settings.ffmpeg);
        command.args(&args);
        let description = exec::describe(&command);
        debug!(session_id, command = %description, "starting encoder");
        exec::run_checked(self.executor.as_ref(), &mut command, self.settings.timeout)
            .await
            .map_err(|outcome| match outcome {
                CommandOutcome::Spawn(source) => TranscodeError::Spawn {
                    command: description.clone(),
                    source,
                },
                CommandOutcome::TimedOut(limit) => TranscodeError::Timeout {
                    command: description.clone(),
                    limit,
                },
                CommandOutcome::Failed { status, stderr } => TranscodeError::Encoder {
                    command: description.clone(),
                    status,
                    stderr,
                },
            })?;

        let playlist_path = output_dir.join(&self.settings.playlist_name);
        let contents = fs::read_to_string(&playlist_path)
            .await
            .map_err(|source| TranscodeError::Io {
                path: playlist_path.clone(),
                source,
            })?;
        let playlist = HlsPlaylist::parse(&contents).map_err(|detail| TranscodeError::Playlist {
            path: playlist_path.clone(),
            detail,
        })?;

        let mut segments = Vec::with_capacity(playlist.segments.len());
        for (index, entry) in playlist.segments.iter().enumerate() {
            let path = output_dir.join(&entry.uri);
            if !fs::try_exists(&path).await.unwrap_or(false) {
                return Err(TranscodeError::MissingSegment { path });
            }
            segments.push(Segment {
                index,
                duration: entry.duration,
                path,
            });
        }

        let total_duration = playlist.total_duration();
        if let Some(expected) = expected_duration {
            if (total_duration - expected).abs() > self.settings.duration_tolerance {
                return Err(TranscodeError::DurationMismatch {
                    expected,
                    actual: total_duration,
                    tolerance: self.settings.duration_tolerance,
                });
            }
        }

        let manifest_path = self
            .write_manifest(session_id, &output_dir, &playlist_path, &playlist, total_duration)
            .await?;
        let playback_url = self.playback_url(session_id)?.to_string();
        info!(
            session_id,
            segments = segments.len(),
            total_duration,
            playback_url = %playback_url,
            "transcode complete"
        );
        Ok(TranscodeOutcome {
            output_dir,
            playlist_path,
            playback_url,
            segments,
            total_duration,
            manifest_path,
        })
    }

    async fn write_manifest(
        &self,
        session_id: &str,
        output_dir: &Path,
        playlist_path: &Path,
        playlist: &HlsPlaylist,
        total_duration: f64,
    ) -> TranscodeResult<PathBuf> {
        let entries = try_join_all(playlist.segments.iter().enumerate().map(
            |(index, entry)| async move {
                let (sha256, bytes) = compute_sha256(&output_dir.join(&entry.uri)).await?;
                TranscodeResult::Ok(ManifestSegment {
                    index,
                    uri: entry.uri.clone(),
                    duration: entry.duration,
                    bytes,
                    sha256,
                })
            },
        ))
        .await?;
        let manifest = Manifest {
            session_id: session_id.to_string(),
            playlist: self.settings.playlist_name.clone(),
            playlist_sha256: compute_sha256(playlist_path).await?.0,
            total_duration,
            segments: entries,
            created_at: Utc::now(),
        };
        let path = output_dir.join(MANIFEST_NAME);
        let body = serde_json::to_vec_pretty(&manifest)?;
        fs::write(&path, body)
            .await
            .map_err(|source| TranscodeError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// A re-run after a failed attempt starts from an empty output directory.
async fn reset_dir(dir: &Path) -> TranscodeResult<()> {
    let io = |source| TranscodeError::Io {
        path: dir.to_path_buf(),
        source,
    };
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(io(err)),
    }
    fs::create_dir_all(dir).await.map_err(io)
}

async fn compute_sha256(path: &Path) -> TranscodeResult<(String, u64)> {
    let bytes = fs::read(path).await.map_err(|source| TranscodeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((hex_encode(hasher.finalize()), bytes.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use tempfile::TempDir;

    fn settings() -> TranscodeSettings {
        TranscodeSettings {
            ffmpeg: "ffmpeg".into(),
            max_width: 1280,
            max_height: 720,
            video_codec: "libx264".into(),
            preset: "veryfast".into(),
            video_bitrate: "800k".into(),
            video_maxrate: "1000k".into(),
            video_bufsize: "2000k".into(),
            audio_codec: "aac".into(),
            audio_bitrate: "96k".into(),
            segment_duration: 6,
            playlist_name: "index.m3u8".into(),
            timeout: Duration::from_secs(60),
            duration_tolerance: 1.0,
        }
    }

    /// Writes an HLS output with the given segment durations, like ffmpeg would.
    struct FakeEncoder {
        durations: Vec<f64>,
        skip_segment: Option<usize>,
    }

    #[async_trait::async_trait]
    impl CommandExecutor for FakeEncoder {
        async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
            let args: Vec<String> = command
                .as_std()
                .get_args()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            let playlist = PathBuf::from(args.last().unwrap());
            let dir = playlist.parent().unwrap().to_path_buf();
            let mut body = String::from("#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-TARGETDURATION:6\n");
            for (index, duration) in self.durations.iter().enumerate() {
                let name = format!("segment_{index:05}.ts");
                if self.skip_segment != Some(index) {
                    std::fs::write(dir.join(&name), format!("ts-{index}"))?;
                }
                body.push_str(&format!("#EXTINF:{duration:.6},\n{name}\n"));
            }
            body.push_str("#EXT-X-ENDLIST\n");
            std::fs::write(&playlist, body)?;
            Ok(Output {
                status: ExitStatus::from_raw(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    struct BrokenEncoder;

    #[async_trait::async_trait]
    impl CommandExecutor for BrokenEncoder {
        async fn run(&self, _command: &mut Command) -> std::io::Result<Output> {
            Ok(Output {
                status: ExitStatus::from_raw(1 << 8),
                stdout: Vec::new(),
                stderr: b"moov atom not found".to_vec(),
            })
        }
    }

    fn transcoder(dir: &TempDir, executor: Arc<dyn CommandExecutor>) -> Transcoder {
        Transcoder::new(
            settings(),
            executor,
            dir.path().join("media"),
            Url::parse("https://media.example.com/recordings/").unwrap(),
        )
    }

    #[test]
    fn arguments_pin_segment_length_and_keyframes() {
        let args = build_ffmpeg_args(&settings(), Path::new("/in/merged.webm"), Path::new("/out/s1"));
        let joined = args.join(" ");
        assert!(joined.contains("-hls_time 6"));
        assert!(joined.contains("-force_key_frames expr:gte(t,n_forced*6)"));
        assert!(joined.contains("-hls_flags independent_segments"));
        assert!(joined.contains("min(1280,iw)"));
        assert!(joined.contains("-maxrate 1000k"));
        assert_eq!(args.last().unwrap(), "/out/s1/index.m3u8");
    }

    #[test]
    fn parses_playlist_entries() {
        let playlist = HlsPlaylist::parse(
            "#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.000000,\nsegment_00000.ts\n#EXTINF:2.5,\nsegment_00001.ts\n#EXT-X-ENDLIST\n",
        )
        .unwrap();
        assert_eq!(playlist.segments.len(), 2);
        assert!((playlist.total_duration() - 8.5).abs() < f64::EPSILON);
        assert!(HlsPlaylist::parse("not a playlist").is_err());
        assert!(HlsPlaylist::parse("#EXTM3U\n#EXT-X-ENDLIST\n").is_err());
    }

    #[tokio::test]
    async fn successful_run_writes_manifest_and_url() {
        let dir = TempDir::new().unwrap();
        let encoder = FakeEncoder {
            durations: vec![6.0, 6.0, 6.0, 2.4],
            skip_segment: None,
        };
        let outcome = transcoder(&dir, Arc::new(encoder))
            .transcode("s1", Path::new("/in/merged.webm"), Some(20.5))
            .await
            .unwrap();
        assert_eq!(outcome.segment_count(), 4);
        assert_eq!(
            outcome.playback_url,
            "https://media.example.com/recordings/s1/index.m3u8"
        );
        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&outcome.manifest_path).unwrap()).unwrap();
        assert_eq!(manifest["segments"].as_array().unwrap().len(), 4);
        assert_eq!(manifest["playlist_sha256"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn duration_outside_tolerance_fails() {
        let dir = TempDir::new().unwrap();
        let encoder = FakeEncoder {
            durations: vec![6.0, 6.0],
            skip_segment: None,
        };
        let err = transcoder(&dir, Arc::new(encoder))
            .transcode("s1", Path::new("/in/merged.webm"), Some(30.0))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::DurationMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_segment_file_fails() {
        let dir = TempDir::new().unwrap();
        let encoder = FakeEncoder {
            durations: vec![6.0, 6.0, 3.0],
            skip_segment: Some(1),
        };
        let err = transcoder(&dir, Arc::new(encoder))
            .transcode("s1", Path::new("/in/merged.webm"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::MissingSegment { .. }));
    }

    #[tokio::test]
    async fn encoder_failure_keeps_stderr() {
        let dir = TempDir::new().unwrap();
        let err = transcoder(&dir, Arc::new(BrokenEncoder))
            .transcode("s1", Path::new("/in/merged.webm"), None)
            .await
            .unwrap_err();
        match err {
            TranscodeError::Encoder { status, stderr, .. } => {
                assert_eq!(status, Some(1));
                assert_eq!(stderr, "moov atom not found");
            }
            other => panic!("unexpected error {other}"),
        }
    }
}
