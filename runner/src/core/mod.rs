//! Deterministic, pure logic shared by the runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod args;
pub mod classifier;
pub mod lifecycle;
pub mod output;
pub mod retry_policy;
pub mod types;
