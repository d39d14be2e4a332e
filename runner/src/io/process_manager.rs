//! Named registry of live subprocess handles.
//!
//! The registry lock is never held while a handle's own lock is taken:
//! entries are inserted or drained under the lock, then operated on after it
//! is released.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::RunnerError;
use crate::io::process::{ProcessSpec, SubprocessHandle};

#[derive(Debug, Default)]
pub struct ProcessManager {
    processes: RwLock<HashMap<String, Arc<SubprocessHandle>>>,
    closed: AtomicBool,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `spec` under `id`.
    ///
    /// Fails with [`RunnerError::DuplicateProcess`] while an entry with the same
    /// id is still running, and with [`RunnerError::ShuttingDown`] once the
    /// manager has been closed.
    #[instrument(skip(self, spec), fields(program = %spec.program))]
    pub fn start(&self, id: &str, spec: ProcessSpec) -> Result<Arc<SubprocessHandle>, RunnerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RunnerError::ShuttingDown);
        }
        let handle = Arc::new(SubprocessHandle::new(spec));
        {
            let mut processes = self.processes.write();
            if let Some(existing) = processes.get(id)
                && !existing.is_exited()
            {
                return Err(RunnerError::DuplicateProcess { id: id.to_string() });
            }
            processes.insert(id.to_string(), handle.clone());
        }

        if let Err(err) = handle.start() {
            let mut processes = self.processes.write();
            if processes
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, &handle))
            {
                processes.remove(id);
            }
            return Err(err);
        }
        debug!(pid = ?handle.pid(), "registered subprocess");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SubprocessHandle>> {
        self.processes.read().get(id).cloned()
    }

    /// Forget `id` without signalling it (used once its wait has completed).
    pub fn remove(&self, id: &str) -> Option<Arc<SubprocessHandle>> {
        self.processes.write().remove(id)
    }

    /// Remove `id` and ask it to terminate.
    pub fn stop(&self, id: &str) -> Result<(), RunnerError> {
        let handle = self
            .remove(id)
            .ok_or_else(|| RunnerError::ProcessNotFound { id: id.to_string() })?;
        handle.stop()
    }

    /// Stop every tracked handle.
    ///
    /// Every handle is signalled even if an earlier one fails; the first error
    /// is returned.
    pub fn stop_all(&self) -> Result<(), RunnerError> {
        let handles = self.drain();
        let mut first_err = None;
        for (id, handle) in handles {
            if let Err(err) = handle.stop() {
                warn!(id = %id, err = %err, "stop subprocess");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Refuse new starts from now on.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the manager, stop everything, wait up to `grace`, then kill stragglers.
    ///
    /// Returns the ids that had to be force-killed.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        self.close();
        let handles = self.drain();
        if handles.is_empty() {
            return Vec::new();
        }
        info!(count = handles.len(), "stopping subprocesses");
        for (id, handle) in &handles {
            if let Err(err) = handle.stop() {
                warn!(id = %id, err = %err, "stop subprocess");
            }
        }

        let deadline = Instant::now() + grace;
        let mut stuck = Vec::new();
        for (id, handle) in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if handle.wait_for_exit(remaining).await {
                continue;
            }
            warn!(id = %id, "subprocess ignored graceful stop; killing");
            if let Err(err) = handle.kill() {
                warn!(id = %id, err = %err, "kill subprocess");
            }
            stuck.push(id);
        }
        stuck.sort_unstable();
        stuck
    }

    /// Sorted ids of tracked handles.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.read().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.read().is_empty()
    }

    fn drain(&self) -> Vec<(String, Arc<SubprocessHandle>)> {
        self.processes.write().drain().collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn duplicate_live_id_is_rejected() {
        let manager = ProcessManager::new();
        let first = manager.start("review-1", sh("sleep 30")).expect("start");
        let err = manager.start("review-1", sh("true")).unwrap_err();
        assert!(matches!(err, RunnerError::DuplicateProcess { .. }), "{err}");
        first.kill().expect("kill");
    }

    #[tokio::test]
    async fn exited_entry_can_be_replaced() {
        let manager = ProcessManager::new();
        let first = manager.start("review-1", sh("true")).expect("start");
        first.wait(&CancellationToken::new()).await.expect("wait");
        let second = manager.start("review-1", sh("true")).expect("restart");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn failed_start_leaves_no_entry() {
        let manager = ProcessManager::new();
        let err = manager
            .start("missing", ProcessSpec::new("no-such-binary-9c1e", vec![]))
            .unwrap_err();
        assert!(matches!(err, RunnerError::BinaryNotFound { .. }));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_id_errors() {
        let manager = ProcessManager::new();
        assert!(matches!(
            manager.stop("ghost"),
            Err(RunnerError::ProcessNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stop_all_leaves_nothing_running() {
        let manager = ProcessManager::new();
        let a = manager.start("a", sh("sleep 30")).expect("a");
        let b = manager.start("b", sh("sleep 30")).expect("b");
        manager.stop_all().expect("stop all");
        assert!(manager.is_empty());
        assert!(a.wait_for_exit(Duration::from_secs(5)).await);
        assert!(b.wait_for_exit(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn shutdown_kills_processes_ignoring_sigterm() {
        let manager = ProcessManager::new();
        let stubborn = manager
            .start("stubborn", sh("trap '' TERM; sleep 30"))
            .expect("start");
        let polite = manager.start("polite", sh("sleep 30")).expect("start");
        // Give the shell a moment to install its trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stuck = manager.shutdown(Duration::from_millis(300)).await;
        assert_eq!(stuck, vec!["stubborn".to_string()]);
        assert!(stubborn.wait_for_exit(Duration::from_secs(5)).await);
        assert!(polite.is_exited());
        assert!(matches!(
            manager.start("late", sh("true")),
            Err(RunnerError::ShuttingDown)
        ));
    }
}
