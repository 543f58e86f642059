use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;
use url::Url;

use regex::Regex;

/// Canonical watch page used when a caller passes a bare video id.
const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

fn video_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("video id pattern is valid"))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSource {
    #[error("source reference is empty")]
    Empty,
    #[error("unsupported scheme `{0}`, expected http or https")]
    Scheme(String),
    #[error("source URL has no host")]
    MissingHost,
    #[error("source URL must not embed credentials")]
    Credentials,
    #[error("malformed source reference: {0}")]
    Malformed(String),
}

/// A validated reference to a remote media item.
///
/// Either an absolute `http(s)` URL or a bare 11 character video id, which is
/// expanded to its watch page. The fragment is dropped so that two spellings
/// of the same page share a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceReference {
    url: Url,
}

impl SourceReference {
    pub fn parse(raw: &str) -> Result<Self, InvalidSource> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(InvalidSource::Empty);
        }

        if video_id_pattern().is_match(trimmed) {
            let url = Url::parse(&format!("{}{}", WATCH_URL_PREFIX, trimmed))
                .map_err(|e| InvalidSource::Malformed(e.to_string()))?;
            return Ok(Self { url });
        }

        let mut url = Url::parse(trimmed).map_err(|e| InvalidSource::Malformed(e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(InvalidSource::Scheme(other.to_string())),
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(InvalidSource::MissingHost);
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(InvalidSource::Credentials);
        }
        url.set_fragment(None);

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl FromStr for SourceReference {
    type Err = InvalidSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SourceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SourceReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
