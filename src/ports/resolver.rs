use crate::domain::SourceReference;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where the raw media can be downloaded from, plus any headers the
/// extractor says the origin requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLocation {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    /// Average audio bitrate in kbit/s.
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceMetadata {
    pub title: Option<String>,
    pub duration_secs: Option<f64>,
    pub formats: Vec<FormatInfo>,
    pub extractor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub location: StreamLocation,
    pub metadata: SourceMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Unknown, removed, private or region-blocked content. Never retried.
    #[error("{0}")]
    Unresolvable(String),
    /// Network trouble during lookup; the coordinator may retry.
    #[error("{0}")]
    Transient(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::Transient(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve(&self, source: &SourceReference) -> Result<ResolvedSource, ResolveError>;
}
