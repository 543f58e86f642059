//! Sonata - audio acquisition and transcoding pipeline
//!
//! Hexagonal Architecture:
//! - domain/: Pure types and rules (requests, keys, job states, artifacts)
//! - ports/: Trait definitions (resolver, fetcher, subprocess runner)
//! - adapters/: Concrete implementations (yt-dlp, reqwest, tokio process, axum)
//! - application/: Transcoder, artifact store and job coordinator
//! - config: Environment configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use application::{JobCoordinator, JobHandle, PipelineError};
pub use config::PipelineConfig;
