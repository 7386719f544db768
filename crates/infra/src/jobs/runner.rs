//! Shell command execution.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use queuectl_core::ExecutionOutcome;

/// Runs job commands through `sh -c`.
///
/// Each command runs on its own spawned task, so a slow or hung command never
/// blocks the worker's runtime thread and the timeout teardown happens inside
/// that task. On unix the shell leads its own process group; a timeout kills
/// the whole group, including anything the shell forked.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: String,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different shell binary (must accept `-c <command>`).
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run `command` to completion, or until `timeout` elapses.
    ///
    /// Never fails: every way the run can end is an `ExecutionOutcome`.
    pub async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecutionOutcome {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command, error = %e, "failed to spawn command");
                return ExecutionOutcome::SpawnFailed {
                    error: e.to_string(),
                };
            }
        };

        let outcome = match tokio::spawn(supervise(child, timeout)).await {
            Ok(outcome) => outcome,
            Err(join_err) => ExecutionOutcome::SpawnFailed {
                error: format!("command task failed: {join_err}"),
            },
        };
        match &outcome {
            ExecutionOutcome::TimedOut { after, .. } => {
                debug!(command, timeout_secs = after.as_secs(), "command timed out")
            }
            ExecutionOutcome::Exited { code, .. } => debug!(command, code = ?code, "command failed"),
            _ => debug!(command, "command finished"),
        }
        outcome
    }
}

type Captured = Arc<Mutex<Vec<u8>>>;

/// Grace period for the pipe readers once the process group is dead.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Wait for the child and drain both pipes, bounded by `timeout`.
async fn supervise(mut child: Child, timeout: Option<Duration>) -> ExecutionOutcome {
    let stdout: Captured = Arc::default();
    let stderr: Captured = Arc::default();
    let mut stdout_task = tokio::spawn(read_pipe(child.stdout.take(), stdout.clone()));
    let mut stderr_task = tokio::spawn(read_pipe(child.stderr.take(), stderr.clone()));

    // Done means the shell exited and every holder of the pipes closed them.
    let finished = async {
        let status = child.wait().await;
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
        status
    };

    let status = match timeout {
        Some(limit) => tokio::time::timeout(limit, finished).await.ok(),
        None => Some(finished.await),
    };

    match status {
        Some(Ok(status)) => {
            let stdout = take(&stdout);
            let stderr = take(&stderr);
            if status.success() {
                ExecutionOutcome::Succeeded { stdout }
            } else {
                ExecutionOutcome::Exited {
                    code: status.code(),
                    stdout,
                    stderr,
                }
            }
        }
        Some(Err(e)) => {
            terminate(&mut child).await;
            ExecutionOutcome::SpawnFailed {
                error: format!("failed to wait for command: {e}"),
            }
        }
        None => {
            terminate(&mut child).await;
            // With the group gone the pipes reach EOF; keep what was printed.
            for task in [stdout_task, stderr_task] {
                if !task.is_finished() {
                    let abort = task.abort_handle();
                    if tokio::time::timeout(DRAIN_GRACE, task).await.is_err() {
                        abort.abort();
                    }
                }
            }
            ExecutionOutcome::TimedOut {
                after: timeout.unwrap_or_default(),
                stdout: take(&stdout),
            }
        }
    }
}

/// Kill the child's process group (unix) and the child itself, then reap it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, error = %e, "failed to kill process group");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to kill command");
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>, into: Captured) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buf) = into.lock() {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

fn take(captured: &Captured) -> String {
    captured
        .lock()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}
