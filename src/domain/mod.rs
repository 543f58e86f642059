//! Domain layer - Pure types and rules, no I/O.

pub mod artifact;
pub mod error;
pub mod jobs;
pub mod media;
pub mod retry;
pub mod source;

pub use artifact::Artifact;
pub use error::{ErrorKind, JobFailure};
pub use jobs::{HandleId, JobKey, JobRequest, JobSnapshot, JobState, OutputFormat, Quality, RequestError};
pub use retry::RetryPolicy;
pub use source::{InvalidSource, SourceReference};
