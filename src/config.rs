//! Environment driven configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}={value:?} is not valid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: u16,
    /// Root of the artifact store
    pub artifact_dir: PathBuf,
    /// Parent of per-job scratch directories
    pub work_dir: PathBuf,
    pub max_concurrent_jobs: usize,
    /// Pending jobs allowed beyond the running ones before `Overloaded`
    pub max_queue_depth: usize,
    pub max_store_bytes: u64,
    pub max_payload_bytes: u64,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    /// Connect timeout and longest silence while streaming a payload
    pub fetch_timeout: Duration,
    pub resolve_attempts: u32,
    pub resolve_timeout: Duration,
    pub transcode_timeout: Duration,
    /// How long a finished job's handle stays queryable
    pub handle_retention: Duration,
    pub ffmpeg_path: PathBuf,
    pub ytdlp_path: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            addr: String::from("127.0.0.1"),
            port: 3000,
            artifact_dir: PathBuf::from("./artifacts"),
            work_dir: env::temp_dir().join("sonata"),
            max_concurrent_jobs: 4,
            max_queue_depth: 64,
            max_store_bytes: 10 * 1024 * 1024 * 1024,
            max_payload_bytes: 1024 * 1024 * 1024,
            fetch_attempts: 3,
            fetch_backoff: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(30),
            resolve_attempts: 3,
            resolve_timeout: Duration::from_secs(60),
            transcode_timeout: Duration::from_secs(600),
            handle_retention: Duration::from_secs(3600),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ytdlp_path: PathBuf::from("yt-dlp"),
        }
    }
}

impl PipelineConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source; unset variables keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            addr: lookup("ADDR").unwrap_or(defaults.addr),
            port: parse(&lookup, "PORT", defaults.port)?,
            artifact_dir: lookup("ARTIFACT_DIR").map(PathBuf::from).unwrap_or(defaults.artifact_dir),
            work_dir: lookup("WORK_DIR").map(PathBuf::from).unwrap_or(defaults.work_dir),
            max_concurrent_jobs: parse(&lookup, "MAX_CONCURRENT_JOBS", defaults.max_concurrent_jobs)?,
            max_queue_depth: parse(&lookup, "MAX_QUEUE_DEPTH", defaults.max_queue_depth)?,
            max_store_bytes: parse(&lookup, "MAX_STORE_BYTES", defaults.max_store_bytes)?,
            max_payload_bytes: parse(&lookup, "MAX_PAYLOAD_BYTES", defaults.max_payload_bytes)?,
            fetch_attempts: parse(&lookup, "FETCH_ATTEMPTS", defaults.fetch_attempts)?,
            fetch_backoff: millis(&lookup, "FETCH_BACKOFF_MS", defaults.fetch_backoff)?,
            fetch_timeout: secs(&lookup, "FETCH_TIMEOUT_SECS", defaults.fetch_timeout)?,
            resolve_attempts: parse(&lookup, "RESOLVE_ATTEMPTS", defaults.resolve_attempts)?,
            resolve_timeout: secs(&lookup, "RESOLVE_TIMEOUT_SECS", defaults.resolve_timeout)?,
            transcode_timeout: secs(&lookup, "TRANSCODE_TIMEOUT_SECS", defaults.transcode_timeout)?,
            handle_retention: secs(&lookup, "HANDLE_RETENTION_SECS", defaults.handle_retention)?,
            ffmpeg_path: lookup("FFMPEG_PATH").map(PathBuf::from).unwrap_or(defaults.ffmpeg_path),
            ytdlp_path: lookup("YTDLP_PATH").map(PathBuf::from).unwrap_or(defaults.ytdlp_path),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive: [(&'static str, u64); 6] = [
            ("MAX_CONCURRENT_JOBS", self.max_concurrent_jobs as u64),
            ("MAX_PAYLOAD_BYTES", self.max_payload_bytes),
            ("MAX_STORE_BYTES", self.max_store_bytes),
            ("FETCH_ATTEMPTS", self.fetch_attempts as u64),
            ("RESOLVE_ATTEMPTS", self.resolve_attempts as u64),
            ("TRANSCODE_TIMEOUT_SECS", self.transcode_timeout.as_secs()),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

fn parse<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn secs<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, name, default.as_secs()).map(Duration::from_secs)
}

fn millis<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, name, default.as_millis() as u64).map(Duration::from_millis)
}
