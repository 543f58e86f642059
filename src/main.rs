//! Sonata server binary.
//!
//! Wires up:
//! - yt-dlp resolver, reqwest fetcher and ffmpeg transcoder (subprocess adapters)
//! - the on-disk artifact store
//! - the job coordinator behind the JSON HTTP API

use anyhow::Context;
use sonata::adapters::{http, HttpFetcher, TokioCommandRunner, YtDlpResolver};
use sonata::application::{ArtifactStore, CoordinatorSettings, JobCoordinator, Transcoder};
use sonata::config::PipelineConfig;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 1. Adapters
    let runner = Arc::new(TokioCommandRunner::new());
    let resolver = Arc::new(YtDlpResolver::new(
        runner.clone(),
        config.ytdlp_path.clone(),
        config.resolve_timeout,
    ));
    let fetcher = Arc::new(HttpFetcher::from_config(&config).context("failed to build HTTP client")?);
    let transcoder = Arc::new(Transcoder::new(
        runner,
        config.ffmpeg_path.clone(),
        config.transcode_timeout,
    ));
    match transcoder.check_available().await {
        Ok(version) => info!(version = %version, "codec tool found"),
        Err(e) => warn!(error = %e, "codec tool unavailable, transcodes will fail"),
    }

    // 2. Artifact store
    let store = ArtifactStore::open(&config.artifact_dir, config.max_store_bytes)
        .await
        .context("failed to open artifact store")?;

    // 3. Coordinator
    let coordinator = JobCoordinator::new(
        resolver,
        fetcher,
        transcoder,
        Arc::new(store),
        CoordinatorSettings::from_config(&config),
    );

    // 4. HTTP
    let listener = tokio::net::TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;
    info!(address = %config.bind_address(), "listening");

    axum::serve(listener, http::router(coordinator.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    coordinator.shutdown().await;
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
