//! Test-only helpers: scripted executors, in-memory capabilities and fake CLIs.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::core::types::CapabilityOptions;
use crate::error::RunnerError;
use crate::io::capability::{Capability, CapabilityProvider};
use crate::io::config::RunnerConfig;
use crate::io::executor::{ExecOutput, ExecRequest, Executor};

/// One scripted attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scripted {
    /// Exit 0 with this stdout.
    Stdout(String),
    /// Non-zero exit with the given streams.
    Fail {
        exit_code: i32,
        stderr: String,
        stdout: String,
    },
    /// Block until cancelled, then report a timeout.
    Hang,
}

/// Executor that replays [`Scripted`] outcomes in order; the last one repeats.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Scripted>>,
    last: Mutex<Option<Scripted>>,
    calls: Mutex<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ExecRequest> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn next(&self) -> Option<Scripted> {
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn exec(
        &self,
        request: &ExecRequest,
        token: &CancellationToken,
    ) -> Result<ExecOutput, RunnerError> {
        self.calls.lock().push(request.clone());
        let scripted = self
            .next()
            .ok_or_else(|| RunnerError::Workspace("scripted executor has no outcomes".into()))?;
        match scripted {
            Scripted::Stdout(stdout) => Ok(ExecOutput {
                stdout,
                stderr: String::new(),
                exit_code: Some(0),
                duration: Duration::from_millis(1),
            }),
            Scripted::Fail {
                exit_code,
                stderr,
                stdout,
            } => Err(RunnerError::Subprocess {
                exit_code: Some(exit_code),
                stderr,
                stdout,
            }),
            Scripted::Hang => {
                token.cancelled().await;
                Err(RunnerError::Timeout { after: None })
            }
        }
    }
}

/// In-memory [`CapabilityProvider`].
#[derive(Debug, Default, Clone)]
pub struct StaticCapabilities {
    capabilities: BTreeMap<String, Capability>,
}

impl StaticCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// A single `review` capability that quotes the payload.
    pub fn review() -> Self {
        Self::new().with(
            Capability::new(
                "review",
                "Review PR #{{ key }} and list concrete problems.\n\n{{ payload }}\n",
            )
            .with_options(CapabilityOptions {
                allowed_tools: vec!["Read".to_string(), "Grep".to_string()],
                max_turns: Some(4),
                ..CapabilityOptions::default()
            }),
        )
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.capabilities
            .insert(capability.name.clone(), capability);
        self
    }
}

impl CapabilityProvider for StaticCapabilities {
    fn load(&self, name: &str) -> Result<Capability> {
        self.capabilities
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown capability {name}"))
    }

    fn discover(&self) -> Result<Vec<String>> {
        Ok(self.capabilities.keys().cloned().collect())
    }
}

/// Config suited to tests rooted at `root`: no warm-up, millisecond backoff,
/// cache under `root/.review/cache`.
pub fn test_config(root: &Path) -> RunnerConfig {
    let mut config = RunnerConfig {
        workspace_dir: root.to_path_buf(),
        capabilities_dir: root.join(".review/capabilities"),
        attempt_timeout_secs: 10,
        run_timeout_secs: 30,
        shutdown_grace_secs: 1,
        kill_grace_secs: 1,
        ..RunnerConfig::default()
    };
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.cache.dir = root.join(".review/cache");
    config.warmup.enabled = false;
    config
}

/// Temporary workspace with capability files and fake analysis binaries.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp workspace")?;
        fs::create_dir_all(dir.path().join(".review/capabilities"))
            .context("create capabilities dir")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// [`test_config`] pointed at `binary`.
    pub fn config(&self, binary: &Path) -> RunnerConfig {
        let mut config = test_config(self.path());
        config.binary = binary.display().to_string();
        config.base_args = Vec::new();
        config
    }

    pub fn write_capability(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self
            .path()
            .join(".review/capabilities")
            .join(format!("{name}.md"));
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Write an executable `sh` script standing in for the analysis CLI.
    pub fn write_fake_cli(&self, name: &str, body: &str) -> Result<PathBuf> {
        let bin_dir = self.path().join("bin");
        fs::create_dir_all(&bin_dir).context("create bin dir")?;
        let path = bin_dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n"))
            .with_context(|| format!("write {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("chmod {}", path.display()))?;
        }
        Ok(path)
    }
}
