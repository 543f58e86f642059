//! Ports - Traits the application layer depends on.

pub mod command;
pub mod fetcher;
pub mod resolver;

pub use command::{CommandOutput, CommandRunner, Invocation, RunError};
pub use fetcher::{FetchError, FetchedPayload, Fetcher};
pub use resolver::{
    FormatInfo, ResolveError, ResolvedSource, SourceMetadata, SourceResolver, StreamLocation,
};
