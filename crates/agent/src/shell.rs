//! The `shell` tool: pure execution inside the agent's container.
//!
//! No command validation, quoting transformation, or allow-listing happens
//! here; container isolation is the safety boundary. The subprocess runs in
//! its own process group so a timeout can kill every descendant.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ShellError;

/// Default wall-clock limit for one command.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured outcome of one shell invocation.
///
/// A non-zero exit code is a normal payload for the model, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ShellOutcome {
    /// Serialize for the tool-result message sent back to the model.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Executes commands via `sh -c` with a hard timeout.
#[derive(Debug, Clone)]
pub struct ShellTool {
    timeout: Duration,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SHELL_TIMEOUT,
        }
    }
}

impl ShellTool {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `command`, capturing output. `reasoning` is recorded by the
    /// caller's audit trail and deliberately not acted upon here.
    pub async fn run(&self, command: &str, reasoning: &str) -> Result<ShellOutcome, ShellError> {
        self.run_cancellable(command, reasoning, &CancellationToken::new())
            .await
    }

    /// Run `command`, aborting early (with the same kill semantics as a
    /// timeout) when `cancel` fires.
    pub async fn run_cancellable(
        &self,
        command: &str,
        reasoning: &str,
        cancel: &CancellationToken,
    ) -> Result<ShellOutcome, ShellError> {
        debug!(command, reasoning, "executing shell command");

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShellError::Spawn(e.to_string()))?;

        let pid = child.id();
        let stdout_task = drain(child.stdout.take());
        let stderr_task = drain(child.stderr.take());

        enum Waited {
            Exited(std::process::ExitStatus),
            ReapFailed(std::io::Error),
            Expired,
        }

        let waited = tokio::select! {
            status = tokio::time::timeout(self.timeout, child.wait()) => match status {
                Ok(Ok(status)) => Waited::Exited(status),
                Ok(Err(e)) => Waited::ReapFailed(e),
                Err(_) => Waited::Expired,
            },
            () = cancel.cancelled() => Waited::Expired,
        };

        match waited {
            Waited::Exited(status) => {
                let stdout = collect(stdout_task).await;
                let stderr = collect(stderr_task).await;
                Ok(ShellOutcome {
                    stdout,
                    stderr,
                    exit_code: status.code().unwrap_or(-1),
                    timed_out: false,
                })
            }
            Waited::ReapFailed(e) => Err(ShellError::Reap(e.to_string())),
            Waited::Expired => {
                // Kill the whole process group, then reap the direct child
                // so nothing is left as a zombie.
                kill_group(pid);
                child
                    .wait()
                    .await
                    .map_err(|e| ShellError::Reap(e.to_string()))?;
                let stdout = collect(stdout_task).await;
                let mut stderr = collect(stderr_task).await;
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(&format!(
                    "command timed out after {}s; process group killed",
                    self.timeout.as_secs()
                ));
                warn!(command, timeout = ?self.timeout, "shell command timed out");
                Ok(ShellOutcome {
                    stdout,
                    stderr,
                    exit_code: -1,
                    timed_out: true,
                })
            }
        }
    }
}

#[allow(clippy::cast_possible_wrap)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            warn!(pid, error = %e, "failed to kill process group");
        }
    }
}

fn drain<R>(reader: Option<R>) -> Option<tokio::task::JoinHandle<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    reader.map(|mut r| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf).await;
            buf
        })
    })
}

async fn collect(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(handle) => match handle.await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => String::new(),
        },
        None => String::new(),
    }
}
