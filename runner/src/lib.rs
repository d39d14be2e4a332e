//! Fault-tolerant orchestration of an external code-analysis CLI.
//!
//! A [`lifecycle::Runner`] spawns the analysis binary per unit of work, feeds
//! it a rendered capability prompt, captures its output under a deadline and
//! turns failures into pre-classified degradation actions (skip, cached,
//! partial) instead of CI failures. The crate is split like this:
//!
//! - **[`core`]**: pure, deterministic logic (error classification, retry
//!   policy, lifecycle transitions, argument building, output parsing).
//! - **[`io`]**: side-effecting pieces (subprocesses, cache files, config,
//!   capability files, OS signals), isolated so tests can substitute them.
//!
//! Orchestration modules ([`retry`], [`watchdog`], [`fallback`],
//! [`parallel`], [`lifecycle`]) compose the two.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod fallback;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod parallel;
pub mod retry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watchdog;

pub use error::RunnerError;
