//! ShellExecutor - ジョブのコマンドをシェル経由で実行
//!
//! - stdout は捨てる。stderr は先頭 `MAX_ERROR_LEN` バイトだけ失敗理由に使う
//! - unix ではジョブごとに専用のプロセスグループで起動する
//! - timeout 指定時は超過したらグループごと kill して Failure を返す

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::domain::outcome::MAX_ERROR_LEN;
use crate::domain::{ExecutionOutcome, JobRecord};
use crate::ports::CommandExecutor;

/// Environment variables exported to every job command.
pub const JOB_ID_ENV: &str = "QUEUECTL_JOB_ID";
pub const JOB_ATTEMPT_ENV: &str = "QUEUECTL_ATTEMPT";

/// stderr bytes kept per run. The rest is read and dropped.
const STDERR_CAPTURE_LIMIT: u64 = MAX_ERROR_LEN as u64;

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    flag: String,
}

impl ShellExecutor {
    pub fn new() -> Self {
        if cfg!(windows) {
            Self::with_shell("cmd", "/C")
        } else {
            Self::with_shell("sh", "-c")
        }
    }

    pub fn with_shell(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            flag: flag.into(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, job: &JobRecord, timeout: Option<Duration>) -> ExecutionOutcome {
        let mut cmd = Command::new(&self.shell);
        cmd.arg(&self.flag)
            .arg(job.command())
            .env(JOB_ID_ENV, job.id.to_string())
            .env(JOB_ATTEMPT_ENV, job.attempts.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return ExecutionOutcome::failure(format!("failed to start: {err}")),
        };

        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, collect(&mut child)).await {
                Ok(result) => result,
                Err(_) => {
                    kill_tree(&mut child).await;
                    return ExecutionOutcome::failure(format!(
                        "timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
            None => collect(&mut child).await,
        };

        let (status, stderr) = match waited {
            Ok(waited) => waited,
            Err(err) => return ExecutionOutcome::failure(format!("failed to wait: {err}")),
        };
        debug!(job_id = %job.id, status = %status, "command finished");

        if status.success() {
            return ExecutionOutcome::success();
        }
        match status.code() {
            Some(code) => ExecutionOutcome::exited(code, &String::from_utf8_lossy(&stderr)),
            None => ExecutionOutcome::failure(format!("terminated by signal ({status})")),
        }
    }
}

/// Read stderr to EOF keeping at most `STDERR_CAPTURE_LIMIT` bytes, then reap.
async fn collect(child: &mut Child) -> io::Result<(ExitStatus, Vec<u8>)> {
    let mut captured = Vec::new();
    if let Some(stderr) = child.stderr.take() {
        let mut head = stderr.take(STDERR_CAPTURE_LIMIT);
        head.read_to_end(&mut captured).await?;
        tokio::io::copy(&mut head.into_inner(), &mut tokio::io::sink()).await?;
    }
    let status = child.wait().await?;
    Ok((status, captured))
}

/// Kill the command and everything it started, then reap the shell.
async fn kill_tree(child: &mut Child) {
    kill_process_group(child);
    if let Err(err) = child.kill().await {
        debug!(error = %err, "shell already gone");
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        tracing::warn!(pgid, error = %err, "failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}
