//! Degradation of terminal failures into non-blocking results.
//!
//! The handler turns a [`ClassifiedError`] into a [`FallbackResult`] for the
//! `Skip`, `Cache` and `Partial` actions and returns `None` for `Retry` and
//! `Fail`, meaning the original error must propagate. Every call is counted.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::core::classifier::{ClassifiedError, FallbackAction};
use crate::io::cache::ReviewCache;

/// A degraded but successful outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackResult {
    pub skipped: bool,
    pub cached: bool,
    pub partial: bool,
    pub output: String,
    pub reason: String,
}

/// What the handler knows about the failed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackRequest<'a> {
    pub key: u64,
    /// Output the subprocess produced before failing.
    pub partial_output: Option<&'a str>,
}

/// Snapshot of fallback counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FallbackMetrics {
    pub total: u64,
    pub by_action: BTreeMap<String, u64>,
    pub by_code: BTreeMap<String, u64>,
}

impl FallbackMetrics {
    pub fn action_count(&self, action: FallbackAction) -> u64 {
        self.by_action.get(action.as_str()).copied().unwrap_or(0)
    }

    pub fn code_count(&self, code: &str) -> u64 {
        self.by_code.get(code).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct FallbackHandler {
    cache: Option<Arc<ReviewCache>>,
    metrics: RwLock<FallbackMetrics>,
}

impl FallbackHandler {
    pub fn new(cache: Option<Arc<ReviewCache>>) -> Self {
        Self {
            cache,
            metrics: RwLock::new(FallbackMetrics::default()),
        }
    }

    /// Degrade `error`, or return `None` when it must propagate.
    pub fn handle(
        &self,
        error: &ClassifiedError,
        request: &FallbackRequest<'_>,
    ) -> Option<FallbackResult> {
        let action = error.fallback_action();
        self.record(error, action);

        match action {
            FallbackAction::Skip => {
                info!(key = request.key, code = %error.code(), "skipping review");
                Some(skipped(error.message()))
            }
            FallbackAction::Cache => Some(self.from_cache(error, request.key)),
            FallbackAction::Partial => {
                info!(key = request.key, code = %error.code(), "returning partial review");
                let output = request
                    .partial_output
                    .map(str::trim)
                    .filter(|output| !output.is_empty())
                    .map_or_else(
                        || "_The analysis produced no output before it stopped._".to_string(),
                        str::to_string,
                    );
                Some(FallbackResult {
                    skipped: false,
                    cached: false,
                    partial: true,
                    output,
                    reason: format!("partial result: {}", error.message()),
                })
            }
            FallbackAction::Retry | FallbackAction::Fail => {
                warn!(key = request.key, code = %error.code(), action = %action, "failure propagates");
                None
            }
        }
    }

    /// Copy of the counters; the live map is never exposed.
    pub fn metrics(&self) -> FallbackMetrics {
        self.metrics.read().clone()
    }

    fn record(&self, error: &ClassifiedError, action: FallbackAction) {
        let mut metrics = self.metrics.write();
        metrics.total += 1;
        *metrics
            .by_action
            .entry(action.as_str().to_string())
            .or_default() += 1;
        *metrics
            .by_code
            .entry(error.code().as_str().to_string())
            .or_default() += 1;
    }

    fn from_cache(&self, error: &ClassifiedError, key: u64) -> FallbackResult {
        let entry = self.cache.as_ref().and_then(|cache| cache.get_review(key));
        match entry {
            Some(entry) => {
                info!(key, code = %error.code(), "serving cached review");
                FallbackResult {
                    skipped: false,
                    cached: true,
                    partial: entry.partial,
                    output: entry.payload,
                    reason: format!("served from cache: {}", error.message()),
                }
            }
            None => {
                info!(key, code = %error.code(), "no cached review to fall back on");
                skipped(&format!("no cached result available: {}", error.message()))
            }
        }
    }
}

fn skipped(reason: &str) -> FallbackResult {
    FallbackResult {
        skipped: true,
        cached: false,
        partial: false,
        output: format!(
            "> **Automated review skipped.** {reason}\n>\n> This did not block the CI run.\n"
        ),
        reason: reason.to_string(),
    }
}
