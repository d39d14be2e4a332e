//! Diagnostic tracing for the runner.
//!
//! Logs go to stderr so stdout carries nothing but the review result (or the
//! JSON report). Per-attempt subprocess logs are a separate product artifact
//! written by the executor when `executor_log_dir` is configured.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; without it the level is `warn`, or `info` when
/// `verbose` is set. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=review_runner=debug review-runner run --key 42 --capability review
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (e.g. from tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
