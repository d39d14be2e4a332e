//! One-shot pre-flight probe of the analysis binary.
//!
//! Runs `<binary> <args>` (typically `--version`) before the first real
//! invocation so a missing or hung binary shows up at the start of a job
//! instead of deep inside the retry loop.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::error::RunnerError;

/// Outcome of a successful probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarmupReport {
    /// First non-empty stdout line, usually the version string.
    pub version: String,
    pub latency: Duration,
}

/// Probes the binary at most once per instance; failed probes are retried
/// on the next call.
#[derive(Debug)]
pub struct WarmupProbe {
    binary: String,
    args: Vec<String>,
    timeout: Duration,
    report: OnceCell<WarmupReport>,
}

impl WarmupProbe {
    pub fn new(binary: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            args,
            timeout,
            report: OnceCell::new(),
        }
    }

    pub fn report(&self) -> Option<&WarmupReport> {
        self.report.get()
    }

    /// Probe the binary unless an earlier probe already succeeded.
    pub async fn ensure_warm(&self) -> Result<&WarmupReport, RunnerError> {
        self.report
            .get_or_try_init(|| async {
                let binary = self.binary.clone();
                let args = self.args.clone();
                let timeout = self.timeout;
                tokio::task::spawn_blocking(move || probe(&binary, &args, timeout))
                    .await
                    .map_err(|e| RunnerError::TaskPanicked(e.to_string()))?
            })
            .await
    }
}

#[instrument(skip_all, fields(binary = %binary, timeout_secs = timeout.as_secs()))]
fn probe(binary: &str, args: &[String], timeout: Duration) -> Result<WarmupReport, RunnerError> {
    let start = Instant::now();
    let mut cmd = Command::new(binary);
    cmd.args(args);
    let output = match run_command_with_timeout(cmd, timeout, 64 * 1024) {
        Ok(output) => output,
        Err(ProbeError::NotFound) => {
            return Err(RunnerError::BinaryNotFound {
                binary: binary.to_string(),
            });
        }
        Err(ProbeError::Other(e)) => {
            return Err(RunnerError::Io(std::io::Error::other(format!("{e:#}"))));
        }
    };
    let latency = start.elapsed();

    if output.timed_out {
        warn!(latency_ms = latency.as_millis() as u64, "warm-up probe timed out");
        return Err(RunnerError::Timeout {
            after: Some(timeout),
        });
    }
    if !output.status.success() {
        return Err(RunnerError::Subprocess {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        });
    }

    let version = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string();
    info!(version = %version, latency_ms = latency.as_millis() as u64, "analysis binary is responsive");
    Ok(WarmupReport { version, latency })
}

enum ProbeError {
    NotFound,
    Other(anyhow::Error),
}

struct CommandOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    timed_out: bool,
}

/// Run a command with a timeout, capturing bounded stdout/stderr without risking pipe deadlocks.
fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput, ProbeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning probe");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ProbeError::NotFound),
        Err(e) => {
            return Err(ProbeError::Other(
                anyhow::Error::new(e).context("spawn probe"),
            ));
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProbeError::Other(anyhow!("stdout was not piped")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProbeError::Other(anyhow!("stderr was not piped")))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let waited = child
        .wait_timeout(timeout)
        .context("wait for probe")
        .map_err(ProbeError::Other)?;
    let status = match waited {
        Some(status) => status,
        None => {
            timed_out = true;
            child
                .kill()
                .context("kill probe")
                .map_err(ProbeError::Other)?;
            child
                .wait()
                .context("wait probe after kill")
                .map_err(ProbeError::Other)?
        }
    };

    let stdout = join_output(stdout_handle).map_err(ProbeError::Other)?;
    let stderr = join_output(stderr_handle).map_err(ProbeError::Other)?;
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<anyhow::Result<Vec<u8>>>) -> anyhow::Result<Vec<u8>> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
    }
    Ok(buf)
}
