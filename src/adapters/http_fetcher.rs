//! Streaming HTTP [`Fetcher`] with bounded retries and resume.

use crate::config::PipelineConfig;
use crate::domain::RetryPolicy;
use crate::ports::fetcher::{FetchError, FetchedPayload, Fetcher};
use crate::ports::resolver::StreamLocation;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, StatusCode, Url};
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Outcome of a single attempt that did not finish the download.
enum AttemptError {
    Retryable(FetchError),
    Fatal(FetchError),
}

pub struct HttpFetcher {
    client: Client,
    retry: RetryPolicy,
    max_payload_bytes: u64,
    /// Longest gap tolerated between two body chunks.
    idle_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        client: Client,
        retry: RetryPolicy,
        max_payload_bytes: u64,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            client,
            retry,
            max_payload_bytes,
            idle_timeout,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(config.fetch_timeout)
            .build()
            .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::new(
            client,
            RetryPolicy::new(config.fetch_attempts, config.fetch_backoff),
            config.max_payload_bytes,
            config.fetch_timeout,
        ))
    }

    async fn download(&self, url: &Url, headers: &HeaderMap, destination: &Path) -> Result<u64, FetchError> {
        // Bytes already on disk from earlier attempts.
        let mut written: u64 = 0;
        let mut last = String::new();

        for attempt in 1..=self.retry.attempts {
            match self.attempt(url, headers, destination, &mut written).await {
                Ok(()) => {
                    info!(url = %redacted(url), bytes = written, attempt, "payload fetched");
                    return Ok(written);
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable(e)) => {
                    warn!(url = %redacted(url), attempt, written, error = %e, "fetch attempt failed");
                    last = e.to_string();
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(FetchError::Exhausted {
            attempts: self.retry.attempts,
            last,
        })
    }

    async fn attempt(
        &self,
        url: &Url,
        headers: &HeaderMap,
        destination: &Path,
        written: &mut u64,
    ) -> Result<(), AttemptError> {
        let mut request = self.client.get(url.clone()).headers(headers.clone());
        if *written > 0 {
            request = request.header(RANGE, format!("bytes={}-", *written));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                AttemptError::Fatal(FetchError::InvalidLocation(e.to_string()))
            } else {
                AttemptError::Retryable(FetchError::Network(e.to_string()))
            }
        })?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && *written > 0 {
            // Our offset is no good any more; start over on the next attempt.
            *written = 0;
            truncate(destination).await.map_err(|e| AttemptError::Fatal(e.into()))?;
            return Err(AttemptError::Retryable(FetchError::Status {
                status: status.as_u16(),
            }));
        }
        if !status.is_success() {
            let error = FetchError::Status {
                status: status.as_u16(),
            };
            return Err(if is_retryable_status(status) {
                AttemptError::Retryable(error)
            } else {
                AttemptError::Fatal(error)
            });
        }

        let resuming = *written > 0 && status == StatusCode::PARTIAL_CONTENT;
        if !resuming {
            *written = 0;
        }
        if let Some(length) = response.content_length() {
            if *written + length > self.max_payload_bytes {
                return Err(AttemptError::Fatal(FetchError::PayloadTooLarge {
                    limit: self.max_payload_bytes,
                }));
            }
        }

        let opened = if resuming {
            debug!(offset = *written, "resuming download");
            OpenOptions::new().append(true).open(destination).await
        } else {
            File::create(destination).await
        };
        let mut file = opened.map_err(|e| AttemptError::Fatal(e.into()))?;

        let streamed = self.copy_body(response, &mut file, written).await;
        file.flush().await.map_err(|e| AttemptError::Fatal(e.into()))?;
        streamed
    }

    async fn copy_body(
        &self,
        response: reqwest::Response,
        file: &mut File,
        written: &mut u64,
    ) -> Result<(), AttemptError> {
        let mut body = response.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.idle_timeout, body.next()).await {
                Err(_) => {
                    return Err(AttemptError::Retryable(FetchError::Network(format!(
                        "no data for {:?}",
                        self.idle_timeout
                    ))))
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(AttemptError::Retryable(FetchError::Network(e.to_string()))),
                Ok(Some(Ok(chunk))) => chunk,
            };

            if *written + chunk.len() as u64 > self.max_payload_bytes {
                return Err(AttemptError::Fatal(FetchError::PayloadTooLarge {
                    limit: self.max_payload_bytes,
                }));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Fatal(e.into()))?;
            *written += chunk.len() as u64;
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        location: &StreamLocation,
        destination: &Path,
    ) -> Result<FetchedPayload, FetchError> {
        let url = parse_location(&location.url)?;
        let headers = header_map(&location.headers)?;

        match self.download(&url, &headers, destination).await {
            Ok(size) => Ok(FetchedPayload::new(destination, size)),
            Err(e) => {
                remove_partial(destination).await;
                Err(e)
            }
        }
    }
}

fn parse_location(raw: &str) -> Result<Url, FetchError> {
    let url = Url::parse(raw).map_err(|e| FetchError::InvalidLocation(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::InvalidLocation(format!("unsupported scheme `{}`", other))),
    }
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::InvalidLocation(format!("bad header name `{}`: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::InvalidLocation(format!("bad header value for `{}`: {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Signed media URLs carry credentials in the query string; keep them out of logs.
fn redacted(url: &Url) -> String {
    format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or_default(), url.path())
}

async fn truncate(path: &Path) -> io::Result<()> {
    File::create(path).await.map(drop)
}

async fn remove_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove partial payload");
        }
    }
}
