use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::error::{ConfigError, Result};
use crate::merger::GapPolicy;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IvcapConfig {
    pub paths: PathsSection,
    pub server: ServerSection,
    pub recorder: RecorderSection,
    pub uploader: UploaderSection,
    pub merge: MergeSection,
    pub transcode: TranscodeSection,
    pub worker: WorkerSection,
}

impl IvcapConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.data_dir)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.staging_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.resolve_path(&self.paths.output_dir)
    }

    pub fn sessions_db(&self) -> PathBuf {
        self.data_dir().join("sessions.sqlite")
    }

    pub fn jobs_db(&self) -> PathBuf {
        self.data_dir().join("jobs.sqlite")
    }

    pub fn validate(&self) -> Result<()> {
        if self.recorder.fragment_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "recorder.fragment_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.uploader.max_concurrent == 0 {
            return Err(ConfigError::invalid(
                "uploader.max_concurrent",
                "must be greater than zero",
            ));
        }
        if self.uploader.retry.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "uploader.retry.max_attempts",
                "must be greater than zero",
            ));
        }
        if self.uploader.retry.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "uploader.retry.multiplier",
                "must be at least 1.0",
            ));
        }
        if self.worker.pool_size == 0 {
            return Err(ConfigError::invalid(
                "worker.pool_size",
                "must be greater than zero",
            ));
        }
        if self.worker.max_job_attempts == 0 {
            return Err(ConfigError::invalid(
                "worker.max_job_attempts",
                "must be greater than zero",
            ));
        }
        if self.transcode.segment_duration_seconds == 0 {
            return Err(ConfigError::invalid(
                "transcode.segment_duration_seconds",
                "must be greater than zero",
            ));
        }
        self.server.public_base_url()?;
        Url::parse(&self.uploader.endpoint).map_err(|err| {
            ConfigError::invalid("uploader.endpoint", err.to_string())
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub data_dir: String,
    pub staging_dir: String,
    pub output_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub bind_address: String,
    pub public_base_url: String,
    pub max_fragment_bytes: Option<usize>,
}

impl ServerSection {
    /// Base URL with a guaranteed trailing slash so session paths join below it.
    pub fn public_base_url(&self) -> Result<Url> {
        let mut raw = self.public_base_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        Url::parse(&raw).map_err(|err| ConfigError::invalid("server.public_base_url", err.to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecorderSection {
    pub fragment_interval_ms: u64,
    pub preferred_formats: Vec<String>,
    pub fallback_format: String,
    #[serde(default)]
    pub mix_secondary_audio: bool,
    #[serde(default = "default_gain")]
    pub primary_gain: f32,
    #[serde(default = "default_gain")]
    pub secondary_gain: f32,
    #[serde(default = "default_secondary_audio_timeout_ms")]
    pub secondary_audio_timeout_ms: u64,
}

impl RecorderSection {
    pub fn fragment_interval(&self) -> Duration {
        Duration::from_millis(self.fragment_interval_ms)
    }

    pub fn secondary_audio_timeout(&self) -> Duration {
        Duration::from_millis(self.secondary_audio_timeout_ms)
    }
}

fn default_secondary_audio_timeout_ms() -> u64 {
    100
}

fn default_gain() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploaderSection {
    pub endpoint: String,
    pub max_concurrent: usize,
    pub request_timeout_seconds: u64,
    pub retry: RetrySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub jitter_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeSection {
    #[serde(default)]
    pub gap_policy: GapPolicy,
    pub merged_file_stem: String,
    pub probe_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscodeSection {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub max_width: u32,
    pub max_height: u32,
    pub video_codec: String,
    pub preset: String,
    pub video_bitrate: String,
    pub video_maxrate: String,
    pub video_bufsize: String,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub segment_duration_seconds: u32,
    pub playlist_name: String,
    pub timeout_seconds: u64,
    pub duration_tolerance_seconds: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    pub pool_size: usize,
    pub poll_interval_ms: u64,
    pub max_job_attempts: u32,
}

impl WorkerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<IvcapConfig> {
    let config: IvcapConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/ivcap.toml")
    }

    #[test]
    fn load_fixture_config() {
        let config = load_config(fixture()).expect("config should parse");
        assert_eq!(config.uploader.max_concurrent, 2);
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.merge.gap_policy, GapPolicy::BestEffort);
        assert_eq!(config.recorder.fragment_interval(), Duration::from_secs(5));
        assert_eq!(
            config.staging_dir(),
            PathBuf::from("/var/lib/ivcap/staging")
        );
    }

    #[test]
    fn public_base_url_gains_trailing_slash() {
        let mut config = load_config(fixture()).unwrap();
        config.server.public_base_url = "https://cdn.example.com/rec".into();
        let url = config.server.public_base_url().unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/rec/");
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let mut config = load_config(fixture()).unwrap();
        config.worker.pool_size = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "worker.pool_size",
                ..
            }
        ));
    }
}
