//! Wall-clock deadline for a running subprocess.
//!
//! An armed watchdog sleeps for its timeout; if the guard is still alive it
//! asks the process to stop, gives it `kill_grace` to exit, then kills it.
//! Dropping the guard disarms the watchdog.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::io::process::SubprocessHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watchdog {
    timeout: Duration,
    kill_grace: Duration,
}

impl Watchdog {
    pub fn new(timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            timeout,
            kill_grace,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start monitoring `handle`. Must be called from within a tokio runtime.
    pub fn arm(&self, handle: Arc<SubprocessHandle>) -> WatchdogGuard {
        let fired = Arc::new(AtomicBool::new(false));
        let disarm = CancellationToken::new();
        let task = tokio::spawn(escalate(
            handle,
            *self,
            fired.clone(),
            disarm.clone(),
        ));
        WatchdogGuard {
            fired,
            disarm,
            task,
        }
    }
}

async fn escalate(
    handle: Arc<SubprocessHandle>,
    watchdog: Watchdog,
    fired: Arc<AtomicBool>,
    disarm: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = disarm.cancelled() => return,
        _ = tokio::time::sleep(watchdog.timeout) => {}
    }
    if handle.is_exited() {
        return;
    }

    fired.store(true, Ordering::SeqCst);
    warn!(
        pid = ?handle.pid(),
        timeout_secs = watchdog.timeout.as_secs_f64(),
        "deadline exceeded; stopping subprocess"
    );
    if let Err(err) = handle.stop() {
        warn!(err = %err, "graceful stop failed");
    }
    if handle.wait_for_exit(watchdog.kill_grace).await {
        debug!("subprocess exited after graceful stop");
        return;
    }
    warn!(pid = ?handle.pid(), "subprocess ignored stop; killing");
    if let Err(err) = handle.kill() {
        warn!(err = %err, "kill failed");
    }
}

/// Keeps a watchdog armed while alive.
#[derive(Debug)]
pub struct WatchdogGuard {
    fired: Arc<AtomicBool>,
    disarm: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchdogGuard {
    /// Whether the deadline elapsed and termination was initiated.
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Whether the watchdog has nothing left to do.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchdogGuard {
    fn drop(&mut self) {
        self.disarm.cancel();
    }
}
