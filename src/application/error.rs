use super::artifact_store::StoreError;
use super::transcoder::TranscodeError;
use crate::domain::{ErrorKind, HandleId, JobFailure, RequestError};
use crate::ports::fetcher::FetchError;
use crate::ports::resolver::ResolveError;
use std::time::Duration;
use thiserror::Error;

/// Everything the pipeline can report to a caller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("source cannot be resolved: {0}")]
    UnresolvableSource(String),
    #[error("source lookup failed: {0}")]
    TransientResolution(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("payload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("transcode did not finish within {0:?}")]
    TranscodeTimeout(Duration),
    #[error("transcoder exited with status {exit_code:?}")]
    TranscodeFailed {
        exit_code: Option<i32>,
        diagnostics: String,
    },
    #[error("corrupt output: {0}")]
    CorruptOutput(String),
    #[error("too many pending jobs, try again later")]
    Overloaded,
    #[error("unknown handle {0}")]
    NotFound(HandleId),
    #[error("job was cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            PipelineError::UnresolvableSource(_) => ErrorKind::UnresolvableSource,
            PipelineError::TransientResolution(_) => ErrorKind::TransientResolution,
            PipelineError::Fetch(_) => ErrorKind::Fetch,
            PipelineError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
            PipelineError::TranscodeTimeout(_) => ErrorKind::TranscodeTimeout,
            PipelineError::TranscodeFailed { .. } => ErrorKind::TranscodeFailed,
            PipelineError::CorruptOutput(_) => ErrorKind::CorruptOutput,
            PipelineError::Overloaded => ErrorKind::Overloaded,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Store(_) => ErrorKind::Store,
            PipelineError::ShuttingDown => ErrorKind::ShuttingDown,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Terminal record stored on a failed job.
    pub fn to_failure(&self) -> JobFailure {
        let diagnostics = match self {
            PipelineError::TranscodeFailed { diagnostics, .. } if !diagnostics.is_empty() => {
                Some(diagnostics.clone())
            }
            _ => None,
        };
        JobFailure {
            kind: self.kind(),
            message: self.to_string(),
            diagnostics,
        }
    }
}

impl From<RequestError> for PipelineError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::Source(invalid) => PipelineError::UnresolvableSource(invalid.to_string()),
            other => PipelineError::InvalidRequest(other.to_string()),
        }
    }
}

impl From<ResolveError> for PipelineError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Unresolvable(msg) => PipelineError::UnresolvableSource(msg),
            ResolveError::Transient(msg) => PipelineError::TransientResolution(msg),
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::PayloadTooLarge { limit } => PipelineError::PayloadTooLarge { limit },
            other => PipelineError::Fetch(other.to_string()),
        }
    }
}

impl From<TranscodeError> for PipelineError {
    fn from(e: TranscodeError) -> Self {
        match e {
            TranscodeError::Timeout(timeout) => PipelineError::TranscodeTimeout(timeout),
            TranscodeError::Failed {
                exit_code,
                diagnostics,
            } => PipelineError::TranscodeFailed {
                exit_code,
                diagnostics,
            },
            TranscodeError::CorruptOutput(msg) => PipelineError::CorruptOutput(msg),
            TranscodeError::Launch(msg) => PipelineError::Internal(msg),
        }
    }
}
