//! Executor abstraction for analysis-subprocess invocation.
//!
//! The [`Executor`] trait decouples run orchestration from the actual backend
//! (the analysis CLI). Tests use scripted executors that return predetermined
//! outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::RunnerError;
use crate::io::process::{CapturedOutput, ProcessExit, ProcessSpec, SubprocessHandle};
use crate::io::process_manager::ProcessManager;
use crate::watchdog::Watchdog;

/// Parameters for one subprocess attempt.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Process-manager id, unique per in-flight attempt.
    pub id: String,
    pub key: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Written to stdin, which is then closed.
    pub prompt: String,
    /// Watchdog deadline for this attempt.
    pub timeout: Duration,
    /// Delay between the watchdog's graceful stop and its kill.
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
    /// Where to write the attempt's stdout/stderr log, if anywhere.
    pub log_path: Option<PathBuf>,
}

/// What a successful attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Abstraction over analysis backends.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one attempt. Cancelling `token` must terminate the attempt and
    /// yield [`RunnerError::Timeout`].
    async fn exec(
        &self,
        request: &ExecRequest,
        token: &CancellationToken,
    ) -> Result<ExecOutput, RunnerError>;
}

/// Executor that spawns the analysis CLI through a [`ProcessManager`].
#[derive(Debug, Clone)]
pub struct CliExecutor {
    processes: Arc<ProcessManager>,
}

impl CliExecutor {
    pub fn new(processes: Arc<ProcessManager>) -> Self {
        Self { processes }
    }
}

#[async_trait]
impl Executor for CliExecutor {
    #[instrument(skip_all, fields(id = %request.id, attempt = request.attempt, timeout_secs = request.timeout.as_secs()))]
    async fn exec(
        &self,
        request: &ExecRequest,
        token: &CancellationToken,
    ) -> Result<ExecOutput, RunnerError> {
        let mut spec = ProcessSpec::new(&request.program, request.args.clone())
            .with_output_limit(request.output_limit_bytes);
        if let Some(workdir) = &request.workdir {
            spec = spec.with_workdir(workdir);
        }
        info!(program = %request.program, "starting analysis subprocess");
        let handle = self.processes.start(&request.id, spec)?;
        let result = drive(&handle, request, token).await;
        self.processes.remove(&request.id);
        result
    }
}

async fn drive(
    handle: &Arc<SubprocessHandle>,
    request: &ExecRequest,
    token: &CancellationToken,
) -> Result<ExecOutput, RunnerError> {
    let watchdog = Watchdog::new(request.timeout, request.kill_grace).arm(handle.clone());

    // A child that never reads stdin can block the write; cancellation and
    // the watchdog still end it, and `wait` reports why.
    tokio::select! {
        written = handle.write_prompt(&request.prompt) => {
            if let Err(err) = written {
                warn!(err = %err, "write prompt");
                handle.kill()?;
                handle.wait(&CancellationToken::new()).await?;
                return Err(err);
            }
        }
        _ = token.cancelled() => {}
    }

    let waited = handle.wait(token).await;
    let timed_out = watchdog.fired();
    drop(watchdog);

    let output = handle.output();
    if let Some(path) = &request.log_path {
        let exit = handle.exit();
        if let Err(err) =
            write_executor_log(path, &output, exit, timed_out, request.output_limit_bytes)
        {
            warn!(path = %path.display(), err = ?err, "write executor log");
        }
    }

    let exit = waited?;
    if timed_out {
        warn!(timeout_secs = request.timeout.as_secs(), "analysis subprocess timed out");
        return Err(RunnerError::Timeout {
            after: Some(request.timeout),
        });
    }
    if !exit.success() {
        warn!(exit_code = ?exit.code, "analysis subprocess failed");
        return Err(RunnerError::Subprocess {
            exit_code: exit.code,
            stderr: output.stderr,
            stdout: output.stdout,
        });
    }

    debug!(elapsed_ms = exit.elapsed.as_millis() as u64, "analysis subprocess completed");
    Ok(ExecOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: exit.code,
        duration: exit.elapsed,
    })
}

/// `run-<key>-attempt-<n>.log` under `dir`.
pub fn executor_log_path(dir: &Path, key: u64, attempt: u32) -> PathBuf {
    dir.join(format!("run-{key}-attempt-{attempt}.log"))
}

fn write_executor_log(
    path: &Path,
    output: &CapturedOutput,
    exit: Option<ProcessExit>,
    timed_out: bool,
    output_limit: usize,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create executor log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout);
    buf.push_str(&output.stdout_truncated_notice("executor"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr);
    buf.push_str(&output.stderr_truncated_notice("executor"));
    if let Some(exit) = exit {
        buf.push_str(&format!(
            "\n=== exit ===\ncode: {:?}\nkilled: {}\nelapsed_ms: {}\n",
            exit.code,
            exit.killed,
            exit.elapsed.as_millis()
        ));
    }
    if timed_out {
        buf.push_str("\n[executor timed out]\n");
    }

    if buf.len() > output_limit {
        let mut cut = output_limit;
        while !buf.is_char_boundary(cut) {
            cut -= 1;
        }
        let truncated = format!("{}\n[truncated {} bytes]\n", &buf[..cut], buf.len() - cut);
        fs::write(path, truncated)
            .with_context(|| format!("write executor log {}", path.display()))?;
        return Ok(());
    }

    fs::write(path, buf).with_context(|| format!("write executor log {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(script: &str, timeout: Duration) -> ExecRequest {
        ExecRequest {
            id: "run-1-attempt-1".to_string(),
            key: 1,
            attempt: 1,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: None,
            prompt: "review this".to_string(),
            timeout,
            kill_grace: Duration::from_millis(200),
            output_limit_bytes: 64 * 1024,
            log_path: None,
        }
    }

    fn executor() -> (CliExecutor, Arc<ProcessManager>) {
        let processes = Arc::new(ProcessManager::new());
        (CliExecutor::new(processes.clone()), processes)
    }

    #[tokio::test]
    async fn successful_attempt_returns_stdout() {
        let (executor, processes) = executor();
        let output = executor
            .exec(
                &request("printf 'reviewed: '; cat", Duration::from_secs(5)),
                &CancellationToken::new(),
            )
            .await
            .expect("exec");
        assert_eq!(output.stdout, "reviewed: review this");
        assert_eq!(output.exit_code, Some(0));
        assert!(processes.is_empty());
    }

    #[tokio::test]
    async fn failing_attempt_embeds_stderr() {
        let (executor, _) = executor();
        let err = executor
            .exec(
                &request(
                    "cat >/dev/null; echo 'rate limit exceeded (429)' >&2; exit 1",
                    Duration::from_secs(5),
                ),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        match err {
            RunnerError::Subprocess {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, Some(1));
                assert!(stderr.contains("429"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn watchdog_turns_hang_into_timeout() {
        let (executor, processes) = executor();
        let err = executor
            .exec(
                &request("cat >/dev/null; exec sleep 30", Duration::from_millis(150)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }), "{err}");
        assert!(processes.is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_times_out() {
        let (executor, _) = executor();
        let token = CancellationToken::new();
        token.cancel();
        let err = executor
            .exec(&request("sleep 30", Duration::from_secs(30)), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn log_is_written_per_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (executor, _) = executor();
        let mut req = request("cat; echo warn >&2", Duration::from_secs(5));
        req.log_path = Some(executor_log_path(temp.path(), 9, 2));
        executor
            .exec(&req, &CancellationToken::new())
            .await
            .expect("exec");

        let log = fs::read_to_string(temp.path().join("run-9-attempt-2.log")).expect("log");
        assert!(log.contains("=== stdout ===\nreview this"));
        assert!(log.contains("=== stderr ===\nwarn"));
        assert!(log.contains("code: Some(0)"));
    }
}
