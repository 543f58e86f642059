use super::resolver::StreamLocation;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Raw download owned by one job. The file is removed when the payload is
/// dropped, so it cannot outlive the job on any exit path.
#[derive(Debug)]
pub struct FetchedPayload {
    path: PathBuf,
    size_bytes: u64,
}

impl FetchedPayload {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl Drop for FetchedPayload {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove fetched payload");
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("source answered HTTP {status}")]
    Status { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid stream location: {0}")]
    InvalidLocation(String),
    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("I/O error while writing payload: {0}")]
    Io(#[from] io::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Stream `location` into `destination`. On error nothing is left at
    /// `destination`.
    async fn fetch(
        &self,
        location: &StreamLocation,
        destination: &Path,
    ) -> Result<FetchedPayload, FetchError>;
}
