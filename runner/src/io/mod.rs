//! Side-effecting pieces: filesystem, subprocesses and OS signals.

pub mod cache;
pub mod capability;
pub mod config;
pub mod executor;
pub mod os_signals;
pub mod process;
pub mod process_manager;
pub mod warmup;
