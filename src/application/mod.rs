//! Application layer - Pipeline services generic over the ports.

pub mod artifact_store;
pub mod coordinator;
pub mod error;
pub mod transcoder;

pub use artifact_store::{ArtifactDraft, ArtifactLease, ArtifactStore, EvictionPolicy, StoreError};
pub use coordinator::{CoordinatorSettings, JobCoordinator, JobHandle};
pub use error::PipelineError;
pub use transcoder::{TranscodeError, TranscodeRequest, Transcoder};
