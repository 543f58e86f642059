use crate::domain::media::{matches_signature, SIGNATURE_LEN};
use crate::domain::{OutputFormat, Quality};
use crate::ports::command::{CommandRunner, Invocation, RunError};
use crate::ports::fetcher::FetchedPayload;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Bytes of codec stderr kept for diagnostics.
const DIAGNOSTICS_LIMIT: usize = 4096;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder did not finish within {0:?}")]
    Timeout(Duration),
    #[error("transcoder exited with status {exit_code:?}")]
    Failed {
        exit_code: Option<i32>,
        diagnostics: String,
    },
    #[error("transcoder output is unusable: {0}")]
    CorruptOutput(String),
    #[error("could not run transcoder: {0}")]
    Launch(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub format: OutputFormat,
    pub quality: Quality,
    /// Where the codec tool writes. Must not exist yet or is overwritten.
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodedOutput {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Drives the external codec tool for one conversion at a time.
pub struct Transcoder<C> {
    runner: Arc<C>,
    program: PathBuf,
    timeout: Duration,
}

impl<C: CommandRunner> Transcoder<C> {
    pub fn new(runner: Arc<C>, program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runner,
            program: program.into(),
            timeout,
        }
    }

    /// Convert `payload` and validate what comes out. The payload is consumed
    /// and deleted as soon as the subprocess has exited.
    pub async fn transcode(
        &self,
        payload: FetchedPayload,
        request: &TranscodeRequest,
    ) -> Result<TranscodedOutput, TranscodeError> {
        let invocation = self.invocation(payload.path(), request);
        info!(
            format = %request.format,
            quality = %request.quality,
            input_bytes = payload.size_bytes(),
            "transcoding"
        );

        let result = self.runner.run(&invocation, self.timeout).await;
        drop(payload);

        let output = match result {
            Ok(output) => output,
            Err(RunError::TimedOut { timeout, .. }) => {
                remove_output(&request.output).await;
                return Err(TranscodeError::Timeout(timeout));
            }
            Err(e) => return Err(TranscodeError::Launch(e.to_string())),
        };

        if !output.success() {
            remove_output(&request.output).await;
            let diagnostics = output.stderr_tail(DIAGNOSTICS_LIMIT);
            warn!(exit_code = ?output.exit_code, diagnostics = %diagnostics, "transcoder failed");
            return Err(TranscodeError::Failed {
                exit_code: output.exit_code,
                diagnostics,
            });
        }

        match validate_output(&request.output, request.format).await {
            Ok(size_bytes) => {
                debug!(size_bytes, path = %request.output.display(), "transcode output validated");
                Ok(TranscodedOutput {
                    path: request.output.clone(),
                    size_bytes,
                })
            }
            Err(e) => {
                remove_output(&request.output).await;
                Err(e)
            }
        }
    }

    /// Probe the codec tool once at startup and return its version line.
    pub async fn check_available(&self) -> Result<String, TranscodeError> {
        let output = self
            .runner
            .run(&Invocation::new(&self.program).arg("-version"), PROBE_TIMEOUT)
            .await
            .map_err(|e| TranscodeError::Launch(e.to_string()))?;
        if !output.success() {
            return Err(TranscodeError::Launch(format!(
                "{} -version exited with {:?}",
                self.program.display(),
                output.exit_code
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }

    fn invocation(&self, input: &Path, request: &TranscodeRequest) -> Invocation {
        Invocation::new(&self.program)
            .args(["-hide_banner", "-nostdin", "-loglevel", "error", "-y", "-i"])
            .arg(input)
            .args(["-vn", "-map", "0:a:0"])
            .args(codec_args(request.format, request.quality))
            .args(["-f", request.format.muxer()])
            .arg(&request.output)
    }
}

/// Encoder settings per format. Only enum values ever reach the command line.
pub(crate) fn codec_args(format: OutputFormat, quality: Quality) -> Vec<&'static str> {
    let pick = |low, medium, high| match quality.normalized_for(format) {
        Quality::Low => low,
        Quality::Medium => medium,
        Quality::High | Quality::Lossless => high,
    };
    match format {
        OutputFormat::Mp3 => vec!["-c:a", "libmp3lame", "-b:a", pick("96k", "192k", "320k")],
        OutputFormat::M4a => vec!["-c:a", "aac", "-b:a", pick("96k", "160k", "256k")],
        OutputFormat::Opus => vec!["-c:a", "libopus", "-b:a", pick("64k", "96k", "160k")],
        OutputFormat::Ogg => vec!["-c:a", "libvorbis", "-q:a", pick("3", "5", "8")],
        OutputFormat::Flac => vec!["-c:a", "flac", "-compression_level", "5"],
        OutputFormat::Wav => vec!["-c:a", "pcm_s16le"],
    }
}

async fn validate_output(path: &Path, format: OutputFormat) -> Result<u64, TranscodeError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TranscodeError::CorruptOutput(format!("missing output: {}", e)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| TranscodeError::CorruptOutput(e.to_string()))?
        .len();
    if size == 0 {
        return Err(TranscodeError::CorruptOutput("output is empty".to_string()));
    }

    let mut header = Vec::with_capacity(SIGNATURE_LEN);
    (&mut file)
        .take(SIGNATURE_LEN as u64)
        .read_to_end(&mut header)
        .await
        .map_err(|e| TranscodeError::CorruptOutput(e.to_string()))?;
    if !matches_signature(format, &header) {
        return Err(TranscodeError::CorruptOutput(format!(
            "output does not look like {}",
            format
        )));
    }
    Ok(size)
}

async fn remove_output(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove transcoder output");
        }
    }
}
