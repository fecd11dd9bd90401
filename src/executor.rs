use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::bus::Publisher;
use crate::error::{Error, Result};
use crate::model::{LogEvent, RestartPolicy, Stream, TaskOutcome, TaskSpec};

/// Lines longer than this are split at the boundary rather than dropped or
/// buffered without limit (spec.md §3: ">= 64 KiB recommended").
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Grace period between the initial termination signal and forceful kill
/// (spec.md §4.1: "5 s recommended").
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Given a task's restart policy and the outcome of one run, decide whether
/// the task should be relaunched (independent of any watch-triggered pulse).
pub fn should_self_restart(policy: RestartPolicy, outcome: &TaskOutcome) -> bool {
    match (policy, outcome) {
        (RestartPolicy::Never, _) => false,
        (RestartPolicy::Always, TaskOutcome::Cancelled) => false,
        (RestartPolicy::Always, _) => true,
        (RestartPolicy::OnFailure, TaskOutcome::Failure { .. }) => true,
        (RestartPolicy::OnFailure, _) => false,
    }
}

/// Runs `task` to completion, relaunching it per its own `restart` policy
/// (not driven by any filesystem pulse — see `watch::run` for the combined
/// state machine used when the task is also watched).
pub async fn run_with_restart(
    task: &TaskSpec,
    default_cwd: &Path,
    cancel: CancellationToken,
    bus: Publisher,
) -> Result<TaskOutcome> {
    loop {
        let outcome = run(task, default_cwd, cancel.clone(), bus.clone()).await?;
        if cancel.is_cancelled() || !should_self_restart(task.restart, &outcome) {
            return Ok(outcome);
        }
        tracing::info!(task = %task.name, "restarted");
    }
}

/// Spawns `task` as a child process, streams its stdout/stderr onto `bus`
/// labelled with its name, and runs it to completion or cancellation.
///
/// Returns only after the child has been reaped and both its stdio pipes
/// have closed, per the executor's contract (spec.md §4.1, §8).
pub async fn run(
    task: &TaskSpec,
    default_cwd: &Path,
    cancel: CancellationToken,
    bus: Publisher,
) -> Result<TaskOutcome> {
    let cwd = task
        .working_directory
        .clone()
        .unwrap_or_else(|| default_cwd.to_path_buf());
    validate_cwd(&cwd)?;

    let mut cmd = build_command(task);
    cmd.current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for (k, v) in &task.environment {
        cmd.env(k, v);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    tracing::debug!(task = %task.name, cwd = %cwd.display(), "spawning task");

    let mut child = cmd.spawn().map_err(|source| Error::SpawnFailed {
        task: task.name.clone(),
        source,
    })?;

    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Other("failed to capture stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Other("failed to capture stderr".into()))?;

    let stdout_task = tokio::spawn(stream_pipe(stdout, task.name.clone(), Stream::Out, bus.clone()));
    let stderr_task = tokio::spawn(stream_pipe(stderr, task.name.clone(), Stream::Err, bus));

    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => terminate(pid, &mut child).await,
        res = child.wait() => res,
    };

    // Both splitters see EOF once the child's stdio closes (a consequence
    // of it exiting or being killed); wait for them before reaping further,
    // so no event is lost to a race with process exit.
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    let status = status.map_err(Error::Io)?;

    if cancel.is_cancelled() {
        tracing::debug!(task = %task.name, "cancelled");
        Ok(TaskOutcome::Cancelled)
    } else if status.success() {
        Ok(TaskOutcome::Success)
    } else {
        tracing::debug!(task = %task.name, code = ?status.code(), "exited non-zero");
        Ok(TaskOutcome::Failure {
            exit_code: status.code(),
            message: None,
        })
    }
}

fn build_command(task: &TaskSpec) -> Command {
    if task.use_shell {
        let mut cmd = Command::new(shell_program());
        cmd.arg(shell_flag()).arg(&task.command);
        cmd
    } else {
        let mut parts = task.command.split_whitespace();
        let program = parts.next().unwrap_or_default();
        let mut cmd = Command::new(program);
        cmd.args(parts);
        cmd
    }
}

#[cfg(unix)]
fn shell_program() -> &'static str {
    "/bin/sh"
}

#[cfg(unix)]
fn shell_flag() -> &'static str {
    "-c"
}

#[cfg(windows)]
fn shell_program() -> &'static str {
    "cmd"
}

#[cfg(windows)]
fn shell_flag() -> &'static str {
    "/C"
}

fn validate_cwd(cwd: &Path) -> Result<()> {
    if !cwd.exists() {
        return Err(Error::InvalidWorkDir(cwd.to_path_buf()));
    }
    Ok(())
}

/// Sends the platform's interrupt signal to the child's process group, then
/// escalates to a forceful kill if it hasn't exited by `GRACE_PERIOD`.
#[cfg(unix)]
async fn terminate(pid: Option<u32>, child: &mut Child) -> std::io::Result<ExitStatus> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        let pgid = Pid::from_raw(pid as i32);
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
        Ok(res) => res,
        Err(_elapsed) => {
            if let Some(pid) = pid {
                let pgid = Pid::from_raw(pid as i32);
                let _ = killpg(pgid, Signal::SIGKILL);
            }
            child.wait().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate(_pid: Option<u32>, child: &mut Child) -> std::io::Result<ExitStatus> {
    match tokio::time::timeout(GRACE_PERIOD, child.wait()).await {
        Ok(res) => res,
        Err(_elapsed) => {
            child.start_kill()?;
            child.wait().await
        }
    }
}

/// Drains an async byte stream into newline-terminated `LogEvent`s, capping
/// any unterminated accumulation at `MAX_LINE_BYTES` rather than buffering
/// without limit or dropping the overflow. On EOF a non-empty trailing
/// partial line (no terminator) is emitted as a final event.
async fn stream_pipe<R>(mut reader: R, task: String, stream: Stream, bus: Publisher)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(task = %task, error = %e, "pipe read error, treating as EOF");
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);
        flush_complete_lines(&mut buf, &task, stream, &bus).await;
    }

    if !buf.is_empty() {
        let _ = bus.send(LogEvent::new(task, buf, stream)).await;
    }
}

async fn flush_complete_lines(buf: &mut Vec<u8>, task: &str, stream: Stream, bus: &Publisher) {
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = buf.drain(..=pos).collect();
            line.pop(); // trailing '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if bus
                .send(LogEvent::new(task.to_string(), line, stream))
                .await
                .is_err()
            {
                // Consumer gone: keep draining so the child never blocks on
                // a full stdout pipe, per spec.md §7.
            }
        } else if buf.len() >= MAX_LINE_BYTES {
            let line: Vec<u8> = buf.drain(..MAX_LINE_BYTES).collect();
            let _ = bus.send(LogEvent::new(task.to_string(), line, stream)).await;
        } else {
            break;
        }
    }
}
