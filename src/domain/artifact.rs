use super::jobs::{JobKey, OutputFormat, Quality};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

/// A published, validated output file. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub key: JobKey,
    #[serde(skip)]
    pub path: PathBuf,
    pub format: OutputFormat,
    pub quality: Quality,
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub checksum: String,
    pub duration_secs: Option<f64>,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Download name offered to clients, e.g. `Some Title.mp3`.
    pub fn file_name(&self) -> String {
        let stem: String = self
            .title
            .as_deref()
            .unwrap_or(self.key.as_str())
            .chars()
            .map(|c| match c {
                '/' | '\\' | '"' | ':' | '*' | '?' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        let stem = stem.trim();
        let stem = if stem.is_empty() { self.key.as_str() } else { stem };
        format!("{}.{}", stem, self.format.extension())
    }
}
