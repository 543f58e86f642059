use crate::ports::command::{CommandOutput, CommandRunner, Invocation, RunError};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::time::Instant;
use tracing::{debug, warn};

/// yt-dlp can print a few MiB of JSON for long playlists of formats.
const DEFAULT_STDOUT_LIMIT: usize = 16 * 1024 * 1024;
/// Only the end of stderr is useful for diagnostics.
const DEFAULT_STDERR_LIMIT: usize = 64 * 1024;

/// Runs tools with `tokio::process`, capturing bounded output.
///
/// Each child leads its own process group. The whole group is killed when the
/// tool exits, when it times out, and when the future returned by
/// [`CommandRunner::run`] is dropped (job cancelled), so helpers it forked do
/// not outlive it. Reading its output is bounded by the same deadline.
#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    stdout_limit: usize,
    stderr_limit: usize,
}

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self {
            stdout_limit: DEFAULT_STDOUT_LIMIT,
            stderr_limit: DEFAULT_STDERR_LIMIT,
        }
    }

    pub fn with_limits(stdout_limit: usize, stderr_limit: usize) -> Self {
        Self {
            stdout_limit,
            stderr_limit,
        }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput, RunError> {
        let program = invocation.program_name();
        debug!(program = %program, args = ?invocation.args, "spawning subprocess");

        let deadline = Instant::now() + timeout;

        let mut command = TokioCommand::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;
        // Declared after `child` so it is dropped first, while the leader is
        // still unreaped and the group id cannot be reused.
        let mut group = ProcessGroup::of(&child);

        // Drain both pipes concurrently so a chatty child never blocks on a full pipe.
        let mut stdout = tokio::spawn(drain(child.stdout.take(), self.stdout_limit, false));
        let mut stderr = tokio::spawn(drain(child.stderr.take(), self.stderr_limit, true));

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => return Err(RunError::Io { program, source }),
            Err(_) => {
                warn!(program = %program, ?timeout, "subprocess timed out, killing");
                group.kill();
                // kill() also reaps the leader.
                if let Err(e) = child.kill().await {
                    warn!(program = %program, error = %e, "failed to kill timed out subprocess");
                }
                stdout.abort();
                stderr.abort();
                return Err(RunError::TimedOut { program, timeout });
            }
        };

        // Anything the tool left running in its group goes with it.
        group.kill();

        let collected =
            tokio::time::timeout_at(deadline, async { tokio::join!(&mut stdout, &mut stderr) }).await;
        match collected {
            Ok((out, err)) => Ok(CommandOutput {
                exit_code: status.code(),
                stdout: out.unwrap_or_default(),
                stderr: err.unwrap_or_default(),
            }),
            Err(_) => {
                warn!(program = %program, ?timeout, "subprocess output still open at deadline");
                stdout.abort();
                stderr.abort();
                Err(RunError::TimedOut { program, timeout })
            }
        }
    }
}

/// The process group a child leads. Killed at most once, at the latest on drop.
struct ProcessGroup {
    id: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { id: child.id() }
    }

    fn kill(&mut self) {
        if let Some(id) = self.id.take() {
            kill_group(id);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(id: u32) {
    let Ok(pgid) = libc::pid_t::try_from(id) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            debug!(pgid, error = %e, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_id: u32) {}

/// Read a pipe to EOF, keeping at most `limit` bytes: the head, or the tail
/// when `keep_tail` is set.
async fn drain<R>(reader: Option<R>, limit: usize, keep_tail: bool) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Vec::new();
    };

    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if keep_tail {
            kept.extend_from_slice(&chunk[..n]);
            if kept.len() > limit {
                let excess = kept.len() - limit;
                kept.drain(..excess);
            }
        } else if kept.len() < limit {
            let room = limit - kept.len();
            kept.extend_from_slice(&chunk[..n.min(room)]);
        }
    }
    kept
}
