//! yt-dlp backed [`SourceResolver`].

use crate::domain::SourceReference;
use crate::ports::command::{CommandRunner, Invocation, RunError};
use crate::ports::resolver::{
    FormatInfo, ResolveError, ResolvedSource, SourceMetadata, SourceResolver, StreamLocation,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Lowercased stderr fragments meaning the content will never resolve.
const UNRESOLVABLE_MARKERS: &[&str] = &[
    "video unavailable",
    "private video",
    "has been removed",
    "removed by the uploader",
    "not available in your country",
    "blocked it in your country",
    "unsupported url",
    "account associated with this video has been terminated",
    "sign in to confirm your age",
    "members-only",
    "http error 404",
    "http error 410",
    "is not a valid url",
];

/// Lowercased stderr fragments for network trouble worth retrying.
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "unable to download webpage",
    "temporary failure in name resolution",
    "connection reset",
    "connection refused",
    "remote end closed connection",
    "http error 429",
    "http error 500",
    "http error 502",
    "http error 503",
    "http error 504",
];

#[derive(Debug, Deserialize)]
struct Dump {
    url: Option<String>,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
    title: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<FormatInfo>,
    extractor_key: Option<String>,
    is_live: Option<bool>,
    #[serde(default)]
    requested_formats: Vec<RequestedFormat>,
}

#[derive(Debug, Deserialize)]
struct RequestedFormat {
    url: Option<String>,
    acodec: Option<String>,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
}

pub struct YtDlpResolver<C> {
    runner: Arc<C>,
    program: PathBuf,
    timeout: Duration,
}

impl<C: CommandRunner> YtDlpResolver<C> {
    pub fn new(runner: Arc<C>, program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    fn invocation(&self, source: &SourceReference) -> Invocation {
        Invocation::new(&self.program)
            .args([
                "--dump-single-json",
                "--no-playlist",
                "--no-warnings",
                "-f",
                "bestaudio/best",
                "--",
            ])
            .arg(source.as_str())
    }
}

#[async_trait]
impl<C: CommandRunner> SourceResolver for YtDlpResolver<C> {
    async fn resolve(&self, source: &SourceReference) -> Result<ResolvedSource, ResolveError> {
        info!(source = %source, "resolving source");

        let output = match self.runner.run(&self.invocation(source), self.timeout).await {
            Ok(output) => output,
            Err(RunError::TimedOut { timeout, .. }) => {
                return Err(ResolveError::Transient(format!(
                    "lookup did not finish within {:?}",
                    timeout
                )))
            }
            Err(RunError::Io { source, .. }) => return Err(ResolveError::Transient(source.to_string())),
            Err(e @ RunError::Spawn { .. }) => return Err(ResolveError::Unresolvable(e.to_string())),
        };

        if !output.success() {
            let stderr = output.stderr_tail(4096);
            debug!(source = %source, exit_code = ?output.exit_code, stderr = %stderr, "yt-dlp failed");
            return Err(classify_failure(&stderr));
        }

        parse_dump(&output.stdout)
    }
}

/// Map yt-dlp's stderr to an error kind. Unknown failures are not retried.
pub(crate) fn classify_failure(stderr: &str) -> ResolveError {
    let lowered = stderr.to_lowercase();
    let message = stderr
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with("ERROR:"))
        .or_else(|| stderr.lines().rev().find(|line| !line.trim().is_empty()))
        .unwrap_or("resolver exited without output")
        .trim()
        .to_string();

    if UNRESOLVABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        ResolveError::Unresolvable(message)
    } else if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        ResolveError::Transient(message)
    } else {
        ResolveError::Unresolvable(message)
    }
}

pub(crate) fn parse_dump(stdout: &[u8]) -> Result<ResolvedSource, ResolveError> {
    let dump: Dump = serde_json::from_slice(stdout)
        .map_err(|e| ResolveError::Unresolvable(format!("unreadable resolver output: {}", e)))?;

    if dump.is_live == Some(true) {
        return Err(ResolveError::Unresolvable(
            "live streams cannot be converted".to_string(),
        ));
    }

    // With split video+audio selections the top-level url is absent; prefer
    // the audio half.
    let (url, headers) = match dump.url {
        Some(url) => (url, dump.http_headers),
        None => {
            let picked = dump
                .requested_formats
                .into_iter()
                .filter(|f| f.url.is_some())
                .max_by_key(|f| f.acodec.as_deref().map_or(false, |codec| codec != "none"))
                .ok_or_else(|| ResolveError::Unresolvable("no downloadable stream".to_string()))?;
            let headers = if picked.http_headers.is_empty() {
                dump.http_headers
            } else {
                picked.http_headers
            };
            (picked.url.unwrap_or_default(), headers)
        }
    };

    Ok(ResolvedSource {
        location: StreamLocation {
            url,
            headers: headers.into_iter().collect(),
        },
        metadata: SourceMetadata {
            title: dump.title,
            duration_secs: dump.duration,
            formats: dump.formats,
            extractor: dump.extractor_key,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::command::{CommandOutput, MockCommandRunner};

    const DUMP: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Never Gonna Give You Up",
        "duration": 212.0,
        "extractor_key": "Youtube",
        "url": "https://media.example.com/audio.webm?sig=abc",
        "http_headers": {"User-Agent": "Mozilla/5.0", "Accept": "*/*"},
        "formats": [
            {"format_id": "251", "ext": "webm", "acodec": "opus", "abr": 130.5, "filesize": 3437753},
            {"format_id": "140", "ext": "m4a", "acodec": "mp4a.40.2", "abr": 129.5}
        ]
    }"#;

    fn source() -> SourceReference {
        SourceReference::parse("dQw4w9WgXcQ").unwrap()
    }

    fn resolver_returning(
        result: Result<CommandOutput, RunError>,
    ) -> YtDlpResolver<MockCommandRunner> {
        let mut runner = MockCommandRunner::new();
        let mut result = Some(result);
        runner
            .expect_run()
            .withf(|invocation, _| {
                invocation.program == PathBuf::from("yt-dlp")
                    && invocation.args.last().map(|a| a.to_string_lossy().into_owned())
                        == Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string())
            })
            .times(1)
            .returning(move |_, _| result.take().expect("single call"));
        YtDlpResolver::new(Arc::new(runner), "yt-dlp", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_resolves_stream_and_metadata() {
        let resolver = resolver_returning(Ok(CommandOutput {
            exit_code: Some(0),
            stdout: DUMP.as_bytes().to_vec(),
            stderr: Vec::new(),
        }));

        let resolved = resolver.resolve(&source()).await.unwrap();
        assert_eq!(resolved.location.url, "https://media.example.com/audio.webm?sig=abc");
        assert!(resolved
            .location
            .headers
            .contains(&("User-Agent".to_string(), "Mozilla/5.0".to_string())));
        assert_eq!(resolved.metadata.title.as_deref(), Some("Never Gonna Give You Up"));
        assert_eq!(resolved.metadata.duration_secs, Some(212.0));
        assert_eq!(resolved.metadata.formats.len(), 2);
        assert_eq!(resolved.metadata.extractor.as_deref(), Some("Youtube"));
    }

    #[tokio::test]
    async fn test_removed_video_is_unresolvable() {
        let resolver = resolver_returning(Ok(CommandOutput {
            exit_code: Some(1),
            stdout: Vec::new(),
            stderr: b"ERROR: [youtube] dQw4w9WgXcQ: Video unavailable. This video has been removed by the uploader\n".to_vec(),
        }));

        let err = resolver.resolve(&source()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Unresolvable(ref msg) if msg.starts_with("ERROR:")));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let resolver = resolver_returning(Err(RunError::TimedOut {
            program: "yt-dlp".to_string(),
            timeout: Duration::from_secs(5),
        }));

        assert!(resolver.resolve(&source()).await.unwrap_err().is_transient());
    }

    #[test]
    fn test_classify_network_errors_as_transient() {
        assert!(classify_failure("ERROR: Unable to download webpage: <urlopen error timed out>")
            .is_transient());
        assert!(classify_failure("ERROR: unable to download video data: HTTP Error 503: Service Unavailable")
            .is_transient());
        assert!(!classify_failure("ERROR: HTTP Error 404: Not Found").is_transient());
        assert!(!classify_failure("something odd happened").is_transient());
        assert_eq!(
            classify_failure(""),
            ResolveError::Unresolvable("resolver exited without output".to_string())
        );
    }

    #[test]
    fn test_live_streams_are_rejected() {
        let err = parse_dump(br#"{"url": "https://x", "is_live": true}"#).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_falls_back_to_audio_requested_format() {
        let resolved = parse_dump(
            br#"{
                "title": "split",
                "requested_formats": [
                    {"url": "https://video", "acodec": "none"},
                    {"url": "https://audio", "acodec": "opus", "http_headers": {"Referer": "https://origin"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(resolved.location.url, "https://audio");
        assert_eq!(
            resolved.location.headers,
            vec![("Referer".to_string(), "https://origin".to_string())]
        );
    }

    #[test]
    fn test_garbage_output_is_unresolvable() {
        assert!(matches!(parse_dump(b"not json"), Err(ResolveError::Unresolvable(_))));
    }
}
