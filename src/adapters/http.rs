//! JSON HTTP inbound adapter.
//!
//! Routes:
//! - `POST   /api/jobs`                    submit `{ url, format, quality? }`
//! - `GET    /api/jobs/:handle`            job snapshot
//! - `DELETE /api/jobs/:handle`            detach (and maybe abort)
//! - `GET    /api/jobs/:handle/artifact`   download once Ready
//! - `GET    /health`

use crate::application::artifact_store::StoreStats;
use crate::application::coordinator::JobCoordinator;
use crate::application::error::PipelineError;
use crate::domain::{Artifact, ErrorKind, HandleId, JobKey, JobRequest, JobSnapshot, JobState};
use crate::ports::command::CommandRunner;
use crate::ports::fetcher::Fetcher;
use crate::ports::resolver::SourceResolver;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("`{0}` is not a valid handle")]
    BadHandle(String),
    #[error("malformed request body: {}", .0.body_text())]
    BadBody(#[from] JsonRejection),
    /// The job exists but has no artifact (yet).
    #[error("job is {}", .0.state)]
    NotReady(JobSnapshot),
    #[error("artifact unreadable: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Pipeline(e) => (status_for(e.kind()), e.kind().to_string()),
            ApiError::BadHandle(_) => (StatusCode::BAD_REQUEST, ErrorKind::InvalidRequest.to_string()),
            ApiError::BadBody(JsonRejection::MissingJsonContentType(_)) => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ErrorKind::InvalidRequest.to_string(),
            ),
            ApiError::BadBody(_) => (StatusCode::BAD_REQUEST, ErrorKind::InvalidRequest.to_string()),
            ApiError::NotReady(_) => (StatusCode::CONFLICT, "not_ready".to_string()),
            ApiError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal.to_string()),
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        });
        if let ApiError::NotReady(snapshot) = &self {
            body["job"] = json!(snapshot);
        }
        (status, Json(body)).into_response()
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::UnresolvableSource => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Overloaded | ErrorKind::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::TransientResolution
        | ErrorKind::Fetch
        | ErrorKind::PayloadTooLarge
        | ErrorKind::TranscodeTimeout
        | ErrorKind::TranscodeFailed
        | ErrorKind::CorruptOutput => StatusCode::BAD_GATEWAY,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Store | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitBody {
    pub url: String,
    pub format: String,
    #[serde(default)]
    pub quality: Option<String>,
}

#[derive(Debug, Serialize)]
struct Submitted {
    handle: HandleId,
    key: JobKey,
    state: JobState,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    live_jobs: usize,
    store: StoreStats,
}

pub fn router<R, F, C>(coordinator: JobCoordinator<R, F, C>) -> Router
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    Router::new()
        .route("/api/jobs", post(submit_job::<R, F, C>))
        .route(
            "/api/jobs/:handle",
            get(job_status::<R, F, C>).delete(cancel_job::<R, F, C>),
        )
        .route("/api/jobs/:handle/artifact", get(download_artifact::<R, F, C>))
        .route("/health", get(health::<R, F, C>))
        .with_state(coordinator)
}

fn parse_handle(raw: &str) -> Result<HandleId, ApiError> {
    raw.parse().map_err(|_| ApiError::BadHandle(raw.to_string()))
}

async fn submit_job<R, F, C>(
    State(coordinator): State<JobCoordinator<R, F, C>>,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Submitted>), ApiError>
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    let Json(body) = body?;
    let request = JobRequest::parse(&body.url, &body.format, body.quality.as_deref())
        .map_err(PipelineError::from)?;
    let handle = coordinator.submit(request)?;
    let state = handle.snapshot().state;
    let status = if state == JobState::Ready {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(Submitted {
            handle: handle.id(),
            key: handle.key().clone(),
            state,
        }),
    ))
}

async fn job_status<R, F, C>(
    State(coordinator): State<JobCoordinator<R, F, C>>,
    Path(handle): Path<String>,
) -> Result<Json<JobSnapshot>, ApiError>
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    let id = parse_handle(&handle)?;
    Ok(Json(coordinator.status(&id)?))
}

async fn cancel_job<R, F, C>(
    State(coordinator): State<JobCoordinator<R, F, C>>,
    Path(handle): Path<String>,
) -> Result<StatusCode, ApiError>
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    let id = parse_handle(&handle)?;
    coordinator.cancel(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_artifact<R, F, C>(
    State(coordinator): State<JobCoordinator<R, F, C>>,
    Path(handle): Path<String>,
) -> Result<Response, ApiError>
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    let id = parse_handle(&handle)?;
    let Some(lease) = coordinator.artifact(&id)? else {
        return Err(ApiError::NotReady(coordinator.status(&id)?));
    };

    let artifact = lease.artifact().clone();
    let file = tokio::fs::File::open(lease.path()).await?;
    // The lease rides along with the body so the file cannot be evicted
    // while it is being streamed.
    let stream = ReaderStream::new(file).map(move |chunk| {
        let _pinned = &lease;
        chunk
    });

    Ok((
        [
            (header::CONTENT_TYPE, artifact.format.mime_type().to_string()),
            (header::CONTENT_LENGTH, artifact.size_bytes.to_string()),
            (header::CONTENT_DISPOSITION, content_disposition(&artifact)),
            (header::ETAG, format!("\"{}\"", artifact.checksum)),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn health<R, F, C>(State(coordinator): State<JobCoordinator<R, F, C>>) -> Json<Health>
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    Json(Health {
        status: "ok",
        live_jobs: coordinator.live_jobs(),
        store: coordinator.store().stats(),
    })
}

/// Header values must be visible ASCII; anything else becomes `_`.
fn content_disposition(artifact: &Artifact) -> String {
    let name: String = artifact
        .file_name()
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '_' })
        .collect();
    format!("attachment; filename=\"{}\"", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::artifact_store::ArtifactStore;
    use crate::application::coordinator::CoordinatorSettings;
    use crate::application::transcoder::Transcoder;
    use crate::domain::RetryPolicy;
    use crate::ports::command::{CommandOutput, MockCommandRunner};
    use crate::ports::fetcher::{FetchedPayload, MockFetcher};
    use crate::ports::resolver::{
        MockSourceResolver, ResolvedSource, SourceMetadata, StreamLocation,
    };
    use axum::http::Request;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    type TestCoordinator = JobCoordinator<MockSourceResolver, MockFetcher, MockCommandRunner>;

    async fn app() -> (Router, TestCoordinator, TempDir) {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ArtifactStore::open(root.path().join("store"), 1 << 20)
                .await
                .unwrap(),
        );

        let mut resolver = MockSourceResolver::new();
        resolver.expect_resolve().returning(|_| {
            Ok(ResolvedSource {
                location: StreamLocation {
                    url: "https://media.example.com/a.webm".to_string(),
                    headers: Vec::new(),
                },
                metadata: SourceMetadata {
                    title: Some("Ünïcode / Song".to_string()),
                    ..Default::default()
                },
            })
        });
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().returning(|_, dest| {
            std::fs::write(dest, b"raw").unwrap();
            Ok(FetchedPayload::new(dest, 3))
        });
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|invocation, _| {
            std::fs::write(PathBuf::from(invocation.args.last().unwrap()), b"ID3\x04 encoded").unwrap();
            Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        });

        let coordinator = JobCoordinator::new(
            Arc::new(resolver),
            Arc::new(fetcher),
            Arc::new(Transcoder::new(Arc::new(runner), "ffmpeg", Duration::from_secs(5))),
            store,
            CoordinatorSettings {
                max_concurrent_jobs: 2,
                max_queue_depth: 2,
                resolve_retry: RetryPolicy::new(1, Duration::from_millis(1)),
                handle_retention: Duration::from_secs(60),
                work_dir: root.path().join("work"),
            },
        );
        (router(coordinator.clone()), coordinator, root)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::body::Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    fn submit(json: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/jobs")
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    fn get_uri(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn wait_ready(coordinator: &TestCoordinator, handle: &str) {
        let id: HandleId = handle.parse().unwrap();
        for _ in 0..200 {
            if coordinator.status(&id).unwrap().state.is_terminal() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn test_unknown_format_is_bad_request() {
        let (app, _, _dir) = app().await;
        let (status, body) = send(&app, submit(r#"{"url": "dQw4w9WgXcQ", "format": "aiff"}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_malformed_body_uses_error_envelope() {
        let (app, _, _dir) = app().await;
        for raw in [r#"{"url": "dQw4w9WgXcQ""#, r#"{"format": "mp3"}"#] {
            let (status, body) = send(&app, submit(raw)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["error"]["code"], "invalid_request");
            assert!(body["error"]["message"].as_str().unwrap().starts_with("malformed request body"));
        }
    }

    #[tokio::test]
    async fn test_bad_source_is_unprocessable() {
        let (app, _, _dir) = app().await;
        let (status, _) = send(&app, submit(r#"{"url": "ftp://host/file", "format": "mp3"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_handles() {
        let (app, _, _dir) = app().await;
        let (status, _) = send(&app, get_uri(&format!("/api/jobs/{}", HandleId::new()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&app, get_uri("/api/jobs/not-a-handle")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_poll_download_and_cancel() {
        let (app, coordinator, _dir) = app().await;

        let (status, body) = send(&app, submit(r#"{"url": "dQw4w9WgXcQ", "format": "mp3", "quality": "low"}"#)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let handle = body["handle"].as_str().unwrap().to_string();
        assert_eq!(body["key"].as_str().unwrap().len(), 64);

        wait_ready(&coordinator, &handle).await;
        let (status, body) = send(&app, get_uri(&format!("/api/jobs/{}", handle))).await;
        assert_eq!(status, StatusCode::OK);
        let snapshot: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot["state"], "ready");
        assert_eq!(snapshot["artifact"]["format"], "mp3");

        let response = app
            .clone()
            .oneshot(get_uri(&format!("/api/jobs/{}/artifact", handle)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"_n_code _ Song.mp3\""
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ID3\x04 encoded");

        let (status, _) = send(
            &app,
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/jobs/{}", handle))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, get_uri(&format!("/api/jobs/{}", handle))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Same request again is a cache hit.
        let (status, body) = send(&app, submit(r#"{"url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ", "format": "MP3", "quality": "low"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["state"], "ready");
    }

    #[tokio::test]
    async fn test_health_reports_store() {
        let (app, _, _dir) = app().await;
        let (status, body) = send(&app, get_uri("/health")).await;
        assert_eq!(status, StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["live_jobs"], 0);
        assert_eq!(body["store"]["entries"], 0);
    }
}
