//! Shared deterministic types for runner core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// One unit of work: analyse `payload` for request `key` with a named capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    /// Caller-supplied identifier (e.g. a pull request number); also the cache key.
    pub key: u64,
    /// Capability name resolved through the capability provider.
    pub capability: String,
    /// Unit-of-work payload (typically a diff) made available to the prompt template.
    pub payload: String,
}

impl RunRequest {
    pub fn new(key: u64, capability: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key,
            capability: capability.into(),
            payload: payload.into(),
        }
    }
}

/// Tool permissions and budgets declared by a capability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityOptions {
    /// Human-readable summary, shown by `discover`.
    pub description: Option<String>,
    /// Tool names passed to the analysis binary as an allow-list.
    pub allowed_tools: Vec<String>,
    /// Maximum agent turns, if the capability bounds them.
    pub max_turns: Option<u32>,
    /// Per-attempt deadline overriding the configured default.
    pub timeout_secs: Option<u64>,
}

/// Result returned to the caller of `Run`.
///
/// Degraded results are still successes; `skipped`/`partial` plus `reason`
/// let reporting tell "found nothing" apart from "did not run".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub key: u64,
    pub output: String,
    pub skipped: bool,
    pub cached: bool,
    pub partial: bool,
    pub reason: Option<String>,
    /// Subprocess attempts made by this call (0 when served from cache).
    pub attempts: u32,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn completed(key: u64, output: String, attempts: u32, duration_ms: u64) -> Self {
        Self {
            key,
            output,
            skipped: false,
            cached: false,
            partial: false,
            reason: None,
            attempts,
            duration_ms,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.skipped || self.partial
    }
}
