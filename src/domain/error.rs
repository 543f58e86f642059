use serde::Serialize;
use std::fmt;

/// Stable, serialisable classification of a pipeline failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    UnresolvableSource,
    TransientResolution,
    Fetch,
    PayloadTooLarge,
    TranscodeTimeout,
    TranscodeFailed,
    CorruptOutput,
    Overloaded,
    NotFound,
    Cancelled,
    Store,
    ShuttingDown,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UnresolvableSource => "unresolvable_source",
            ErrorKind::TransientResolution => "transient_resolution",
            ErrorKind::Fetch => "fetch",
            ErrorKind::PayloadTooLarge => "payload_too_large",
            ErrorKind::TranscodeTimeout => "transcode_timeout",
            ErrorKind::TranscodeFailed => "transcode_failed",
            ErrorKind::CorruptOutput => "corrupt_output",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Store => "store",
            ErrorKind::ShuttingDown => "shutting_down",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Terminal error carried by a failed job and delivered to every caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Tail of the codec tool's stderr, when the failure came from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for JobFailure {}
