//! Owning handle for one spawned analysis subprocess.
//!
//! `start` spawns the child with three pipes and immediately launches two
//! reader tasks (stdout, stderr) plus a supervisor task that owns the child
//! and reaps it. Output is therefore captured even if nobody is waiting yet.
//! The supervisor joins both readers before publishing the exit, so a
//! reported exit always comes with final buffers.
//!
//! On unix the child leads its own process group; `stop`/`kill` signal the
//! whole group so helpers spawned by the binary go down with it.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

use crate::error::RunnerError;

/// Upper bound for draining pipes after the child is gone. Grandchildren that
/// inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to spawn.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Bytes kept per stream; the rest is drained and counted.
    pub output_limit_bytes: usize,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            workdir: None,
            output_limit_bytes: 1024 * 1024,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }
}

/// Exit report published once the child has been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process died from a signal.
    pub code: Option<i32>,
    /// Whether the runner forced the termination.
    pub killed: bool,
    pub elapsed: Duration,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Snapshot of captured output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

impl CapturedOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct OutputBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    stdout_truncated: usize,
    stderr_truncated: usize,
}

impl OutputBuffers {
    fn append(&mut self, stream: Stream, chunk: &[u8], limit: usize) {
        let (buf, truncated) = match stream {
            Stream::Stdout => (&mut self.stdout, &mut self.stdout_truncated),
            Stream::Stderr => (&mut self.stderr, &mut self.stderr_truncated),
        };
        let remaining = limit.saturating_sub(buf.len());
        let keep = chunk.len().min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        *truncated += chunk.len() - keep;
    }
}

#[derive(Debug)]
struct State {
    started: bool,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    exit_tx: Option<watch::Sender<Option<ProcessExit>>>,
}

/// One external process and its captured I/O.
#[derive(Debug)]
pub struct SubprocessHandle {
    spec: ProcessSpec,
    state: Mutex<State>,
    output: Arc<Mutex<OutputBuffers>>,
    kill_token: CancellationToken,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl SubprocessHandle {
    pub fn new(spec: ProcessSpec) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        Self {
            spec,
            state: Mutex::new(State {
                started: false,
                pid: None,
                stdin: None,
                exit_tx: Some(exit_tx),
            }),
            output: Arc::new(Mutex::new(OutputBuffers::default())),
            kill_token: CancellationToken::new(),
            exit_rx,
        }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Exit report, once the child has been reaped.
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Spawn the process. Must be called from within a tokio runtime.
    #[instrument(skip_all, fields(program = %self.spec.program))]
    pub fn start(&self) -> Result<(), RunnerError> {
        let mut state = self.state.lock();
        if state.started {
            return Err(RunnerError::AlreadyStarted);
        }
        let exit_tx = state.exit_tx.take().ok_or(RunnerError::AlreadyStarted)?;

        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(args = ?self.spec.args, "spawning subprocess");
        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::BinaryNotFound {
                    binary: self.spec.program.clone(),
                }
            } else {
                error!(err = %e, "failed to spawn subprocess");
                RunnerError::Io(e)
            }
        })?;

        state.started = true;
        state.pid = child.id();
        state.stdin = child.stdin.take();

        let limit = self.spec.output_limit_bytes;
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain(
                stdout,
                self.output.clone(),
                Stream::Stdout,
                limit,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain(
                stderr,
                self.output.clone(),
                Stream::Stderr,
                limit,
            )));
        }

        tokio::spawn(supervise(
            child,
            readers,
            self.kill_token.clone(),
            exit_tx,
            Instant::now(),
        ));
        debug!(pid = ?state.pid, "subprocess started");
        Ok(())
    }

    /// Write the prompt to stdin and close it, signalling end-of-input.
    ///
    /// A child that exits before consuming its input is not an error here;
    /// its exit status is reported by [`SubprocessHandle::wait`].
    pub async fn write_prompt(&self, prompt: &str) -> Result<(), RunnerError> {
        let stdin = {
            let mut state = self.state.lock();
            if !state.started {
                return Err(RunnerError::NotStarted);
            }
            state.stdin.take()
        };
        let Some(mut stdin) = stdin else {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            )));
        };

        let written = match stdin.write_all(prompt.as_bytes()).await {
            Ok(()) => stdin.shutdown().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                warn!("subprocess closed stdin before reading the whole prompt");
                Ok(())
            }
            Err(e) => Err(RunnerError::Io(e)),
        }
    }

    /// Block until the process exits or `token` is cancelled.
    ///
    /// Cancellation (including a token that is already cancelled) force-kills
    /// the process and yields [`RunnerError::Timeout`].
    pub async fn wait(&self, token: &CancellationToken) -> Result<ProcessExit, RunnerError> {
        if !self.is_started() {
            return Err(RunnerError::NotStarted);
        }
        let mut rx = self.exit_rx.clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                warn!(pid = ?self.pid(), "wait cancelled; killing subprocess");
                self.kill()?;
                let exit = wait_exit(&mut rx).await?;
                Err(RunnerError::Timeout { after: Some(exit.elapsed) })
            }
            exit = wait_exit(&mut rx) => exit,
        }
    }

    /// Wait at most `grace` for the process to exit on its own.
    pub async fn wait_for_exit(&self, grace: Duration) -> bool {
        if !self.is_started() {
            return true;
        }
        let mut rx = self.exit_rx.clone();
        matches!(
            tokio::time::timeout(grace, wait_exit(&mut rx)).await,
            Ok(Ok(_))
        )
    }

    /// Ask the process to terminate (SIGTERM). No-op once exited.
    pub fn stop(&self) -> Result<(), RunnerError> {
        let Some(pid) = self.live_pid() else {
            return Ok(());
        };
        debug!(pid, "sending graceful termination");
        #[cfg(unix)]
        {
            signal_group(pid, nix::sys::signal::Signal::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            self.kill_token.cancel();
            Ok(())
        }
    }

    /// Force the process down (SIGKILL). No-op once exited.
    pub fn kill(&self) -> Result<(), RunnerError> {
        let Some(pid) = self.live_pid() else {
            return Ok(());
        };
        debug!(pid, "force-killing subprocess");
        self.kill_token.cancel();
        #[cfg(unix)]
        {
            signal_group(pid, nix::sys::signal::Signal::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            Ok(())
        }
    }

    /// Copy of the output captured so far.
    pub fn output(&self) -> CapturedOutput {
        let buffers = self.output.lock();
        CapturedOutput {
            stdout: String::from_utf8_lossy(&buffers.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&buffers.stderr).into_owned(),
            stdout_truncated: buffers.stdout_truncated,
            stderr_truncated: buffers.stderr_truncated,
        }
    }

    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().stdout).into_owned()
    }

    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.output.lock().stderr).into_owned()
    }

    fn live_pid(&self) -> Option<u32> {
        if self.is_exited() {
            return None;
        }
        self.pid()
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<(), RunnerError> {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Ok(());
    };
    match nix::sys::signal::killpg(Pid::from_raw(raw), signal) {
        // Already reaped between the exit check and the signal.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(RunnerError::Io(std::io::Error::from(errno))),
    }
}

async fn wait_exit(
    rx: &mut watch::Receiver<Option<ProcessExit>>,
) -> Result<ProcessExit, RunnerError> {
    let exit = rx.wait_for(|exit| exit.is_some()).await.map_err(|_| {
        RunnerError::TaskPanicked("subprocess supervisor stopped without an exit report".into())
    })?;
    (*exit).ok_or(RunnerError::NotStarted)
}

async fn drain<R: AsyncRead + Unpin>(
    mut reader: R,
    output: Arc<Mutex<OutputBuffers>>,
    stream: Stream,
    limit: usize,
) {
    let mut chunk = [0u8; 8192];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(err = %e, ?stream, "read subprocess output");
                break;
            }
        };
        output.lock().append(stream, &chunk[..n], limit);
    }
}

async fn supervise(
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    kill_token: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    started: Instant,
) {
    let mut killed = false;
    let status = tokio::select! {
        biased;
        _ = kill_token.cancelled() => {
            killed = true;
            if let Err(e) = child.start_kill() {
                warn!(err = %e, "kill subprocess");
            }
            child.wait().await
        }
        status = child.wait() => status,
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            warn!("output pipe still open after exit; abandoning reader");
            reader.abort();
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!(err = %e, "wait for subprocess");
            None
        }
    };
    let exit = ProcessExit {
        code,
        killed,
        elapsed: started.elapsed(),
    };
    debug!(exit_code = ?exit.code, killed, elapsed_ms = exit.elapsed.as_millis() as u64, "subprocess exited");
    exit_tx.send_replace(Some(exit));
}
