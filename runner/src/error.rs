//! Error taxonomy for the review runner.
//!
//! Every failure the orchestrator can observe is a [`RunnerError`]. Retry and
//! fallback decisions are never made here: see [`crate::core::classifier`].

use std::time::Duration;

use thiserror::Error;

use crate::core::lifecycle::LifecycleState;

/// Errors produced by the runner and its subprocess plumbing.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RunnerError {
    /// `Run` was called while the runner was not bootstrapped (or already shut down).
    #[error("runner not initialized (state: {state})")]
    NotInitialized { state: LifecycleState },

    /// A one-shot operation (process start, bootstrap) was invoked twice.
    #[error("already started")]
    AlreadyStarted,

    /// The analysis binary could not be located on `PATH`.
    #[error("binary not found: {binary}")]
    BinaryNotFound { binary: String },

    /// A deadline elapsed and the work was forcibly terminated.
    #[error("timeout after {after:?}: process was killed")]
    Timeout { after: Option<Duration> },

    /// The ambient cancellation token fired while waiting (e.g. during backoff).
    #[error("operation cancelled")]
    Cancelled,

    /// All attempts failed; carries the last underlying error.
    #[error("max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<RunnerError>,
    },

    /// The subprocess exited unsuccessfully.
    #[error("subprocess exited with {}: {}", display_code(*exit_code), stderr.trim())]
    Subprocess {
        exit_code: Option<i32>,
        stderr: String,
        stdout: String,
    },

    #[error("process {id} is already running")]
    DuplicateProcess { id: String },

    #[error("process {id} not found")]
    ProcessNotFound { id: String },

    #[error("process has not been started")]
    NotStarted,

    /// New work was refused because shutdown is in progress.
    #[error("runner is shutting down")]
    ShuttingDown,

    /// A configured resource budget would be exceeded.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("capability error: {0}")]
    Capability(String),

    /// The caller-supplied parser rejected the subprocess output.
    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

fn display_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

impl RunnerError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RunnerError::NotInitialized { .. } => "not_initialized",
            RunnerError::AlreadyStarted => "already_started",
            RunnerError::BinaryNotFound { .. } => "binary_not_found",
            RunnerError::Timeout { .. } => "timeout",
            RunnerError::Cancelled => "cancelled",
            RunnerError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            RunnerError::Subprocess { .. } => "subprocess_failed",
            RunnerError::DuplicateProcess { .. } => "duplicate_process",
            RunnerError::ProcessNotFound { .. } => "process_not_found",
            RunnerError::NotStarted => "not_started",
            RunnerError::ShuttingDown => "shutting_down",
            RunnerError::ResourceLimit(_) => "resource_limit",
            RunnerError::Capability(_) => "capability",
            RunnerError::InvalidOutput(_) => "invalid_output",
            RunnerError::Config(_) => "config",
            RunnerError::Workspace(_) => "workspace",
            RunnerError::Cache(_) => "cache",
            RunnerError::Io(_) => "io",
            RunnerError::TaskPanicked(_) => "task_panicked",
        }
    }

    /// Unwraps retry exhaustion to the error that actually ended the last attempt.
    pub fn root(&self) -> &RunnerError {
        match self {
            RunnerError::MaxRetriesExceeded { source, .. } => source.root(),
            other => other,
        }
    }

    /// Output the subprocess managed to produce before failing, if any.
    pub fn partial_output(&self) -> Option<&str> {
        match self.root() {
            RunnerError::Subprocess { stdout, .. } if !stdout.trim().is_empty() => Some(stdout),
            _ => None,
        }
    }
}
