//! Runner configuration stored as TOML (default `review-runner.toml`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry_policy::RetryPolicy;

/// Runner configuration (TOML).
///
/// Missing fields default to values suitable for a CI job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Analysis binary, resolved through `PATH` unless absolute.
    pub binary: String,

    /// Arguments passed before capability-specific ones.
    pub base_args: Vec<String>,

    /// Directory the subprocess runs in; must exist at bootstrap.
    pub workspace_dir: PathBuf,

    /// Directory holding `<name>.md` capability definitions.
    pub capabilities_dir: PathBuf,

    /// Watchdog deadline for a single subprocess attempt, in seconds.
    pub attempt_timeout_secs: u64,

    /// Wall-clock budget for a whole `Run`, retries included, in seconds.
    pub run_timeout_secs: u64,

    /// Keep at most this many bytes of stdout/stderr per attempt.
    pub output_limit_bytes: usize,

    /// Refuse prompts larger than this many bytes.
    pub max_prompt_bytes: usize,

    /// How long shutdown waits for subprocesses before killing them.
    pub shutdown_grace_secs: u64,

    /// How long the watchdog waits between a graceful stop and a kill.
    pub kill_grace_secs: u64,

    /// When set, each attempt writes its stdout/stderr log here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_log_dir: Option<PathBuf>,

    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub warmup: WarmupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WarmupConfig {
    pub enabled: bool,
    /// Arguments for the responsiveness probe (e.g. `["--version"]`).
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            base_args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "text".to_string(),
            ],
            workspace_dir: PathBuf::from("."),
            capabilities_dir: PathBuf::from(".review/capabilities"),
            attempt_timeout_secs: 10 * 60,
            run_timeout_secs: 30 * 60,
            output_limit_bytes: 1024 * 1024,
            max_prompt_bytes: 400_000,
            shutdown_grace_secs: 5,
            kill_grace_secs: 2,
            executor_log_dir: None,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            warmup: WarmupConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from(".review/cache"),
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            args: vec!["--version".to_string()],
            timeout_secs: 30,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.binary.trim().is_empty() {
            return Err(anyhow!("binary must be non-empty"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(anyhow!("attempt_timeout_secs must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_prompt_bytes == 0 {
            return Err(anyhow!("max_prompt_bytes must be > 0"));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(anyhow!("retry.multiplier must be >= 1.0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow!("retry.initial_delay_ms must be <= retry.max_delay_ms"));
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            return Err(anyhow!("cache.ttl_secs must be > 0 when the cache is enabled"));
        }
        if self.warmup.enabled && self.warmup.timeout_secs == 0 {
            return Err(anyhow!("warmup.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: self.retry.multiplier,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunnerConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("review-runner.toml");
        let mut cfg = RunnerConfig::default();
        cfg.executor_log_dir = Some(PathBuf::from("logs"));
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("review-runner.toml");
        fs::write(&path, "binary = \"/opt/claude\"\n[retry]\nmax_retries = 1\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.binary, "/opt/claude");
        assert_eq!(cfg.retry.max_retries, 1);
        assert_eq!(cfg.retry.initial_delay_ms, 1000);
        assert_eq!(cfg.cache.ttl_secs, 86_400);
    }

    #[test]
    fn default_retry_policy_matches_documented_backoff() {
        let policy = RunnerConfig::default().retry_policy();
        assert_eq!(policy.calculate_delay(4), Duration::from_secs(8));
        assert_eq!(policy.calculate_delay(5), Duration::from_secs(10));
    }

    #[test]
    fn rejects_shrinking_multiplier() {
        let mut cfg = RunnerConfig::default();
        cfg.retry.multiplier = 0.5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("multiplier"));
    }
}
