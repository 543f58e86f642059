use super::artifact::Artifact;
use super::error::JobFailure;
use super::source::{InvalidSource, SourceReference};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Bumped whenever the key encoding changes, so old cache entries stop matching.
const KEY_VERSION: &str = "sonata-job-v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Source(#[from] InvalidSource),
    #[error("unsupported output format `{0}`")]
    UnknownFormat(String),
    #[error("unsupported quality `{0}`")]
    UnknownQuality(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Mp3,
    M4a,
    Opus,
    Ogg,
    Flac,
    Wav,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 6] = [
        OutputFormat::Mp3,
        OutputFormat::M4a,
        OutputFormat::Opus,
        OutputFormat::Ogg,
        OutputFormat::Flac,
        OutputFormat::Wav,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::M4a => "m4a",
            OutputFormat::Opus => "opus",
            OutputFormat::Ogg => "ogg",
            OutputFormat::Flac => "flac",
            OutputFormat::Wav => "wav",
        }
    }

    /// File extension of the published artifact.
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// ffmpeg muxer name passed to `-f`.
    pub fn muxer(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::M4a => "ipod",
            OutputFormat::Opus => "opus",
            OutputFormat::Ogg => "ogg",
            OutputFormat::Flac => "flac",
            OutputFormat::Wav => "wav",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "audio/mpeg",
            OutputFormat::M4a => "audio/mp4",
            OutputFormat::Opus => "audio/ogg; codecs=opus",
            OutputFormat::Ogg => "audio/ogg",
            OutputFormat::Flac => "audio/flac",
            OutputFormat::Wav => "audio/wav",
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, OutputFormat::Flac | OutputFormat::Wav)
    }
}

impl FromStr for OutputFormat {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        OutputFormat::ALL
            .into_iter()
            .find(|format| format.as_str() == wanted)
            .ok_or_else(|| RequestError::UnknownFormat(s.to_string()))
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    #[default]
    Medium,
    High,
    Lossless,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
            Quality::Lossless => "lossless",
        }
    }

    /// Lossless containers ignore bitrate, so every request for them maps to
    /// `Lossless`; lossy formats asked for `Lossless` get their best preset.
    pub fn normalized_for(self, format: OutputFormat) -> Quality {
        match (format.is_lossless(), self) {
            (true, _) => Quality::Lossless,
            (false, Quality::Lossless) => Quality::High,
            (false, quality) => quality,
        }
    }
}

impl FromStr for Quality {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            "lossless" => Ok(Quality::Lossless),
            _ => Err(RequestError::UnknownQuality(s.to_string())),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated conversion request. Quality is always normalised for the format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub source: SourceReference,
    pub format: OutputFormat,
    pub quality: Quality,
}

impl JobRequest {
    pub fn new(source: SourceReference, format: OutputFormat, quality: Quality) -> Self {
        Self {
            source,
            format,
            quality: quality.normalized_for(format),
        }
    }

    /// Validate untrusted input before it can reach a subprocess.
    pub fn parse(source: &str, format: &str, quality: Option<&str>) -> Result<Self, RequestError> {
        let source = SourceReference::parse(source)?;
        let format = format.parse::<OutputFormat>()?;
        let quality = match quality {
            Some(raw) if !raw.trim().is_empty() => raw.parse::<Quality>()?,
            _ => Quality::default(),
        };
        Ok(Self::new(source, format, quality))
    }

    pub fn key(&self) -> JobKey {
        JobKey::derive(self)
    }
}

/// Cache and de-duplication key: hex SHA-256 of the versioned request tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn derive(request: &JobRequest) -> Self {
        let mut hasher = Sha256::new();
        for part in [
            KEY_VERSION,
            request.source.as_str(),
            request.format.as_str(),
            request.quality.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        JobKey(format!("{:x}", hasher.finalize()))
    }

    /// Accepts only a well-formed key (64 lowercase hex characters).
    pub fn from_hex(raw: &str) -> Option<Self> {
        let valid = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| JobKey(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two character prefix used to fan entries out on disk.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Resolving,
    Fetching,
    Transcoding,
    Ready,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Resolving => 1,
            JobState::Fetching => 2,
            JobState::Transcoding => 3,
            JobState::Ready => 4,
            JobState::Failed => 5,
        }
    }

    /// Forward one step along the happy path, or to `Failed` from any
    /// non-terminal state. Terminal states accept nothing.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobState::Failed => true,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "pending",
            JobState::Resolving => "resolving",
            JobState::Fetching => "fetching",
            JobState::Transcoding => "transcoding",
            JobState::Ready => "ready",
            JobState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Identifies one caller's attachment to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        HandleId(Uuid::new_v4())
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for HandleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(HandleId)
    }
}

/// Read-only view of a job, as handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub key: JobKey,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
}

impl JobSnapshot {
    pub fn pending(key: JobKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            artifact: None,
            failure: None,
        }
    }
}
