//! Fan-out of independent tasks with first-error cancellation.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::RunnerError;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), RunnerError>> + Send>>;

/// A task receives the shared token and should stop early once it fires.
pub type ParallelTask = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send>;

/// Box a closure as a [`ParallelTask`].
pub fn task<F, Fut>(f: F) -> ParallelTask
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), RunnerError>> + Send + 'static,
{
    Box::new(move |token| Box::pin(f(token)))
}

/// Run every task concurrently under a child of `parent`.
///
/// The first failure cancels the shared token. All tasks are still joined
/// before returning, then the first error received is returned. A panicking
/// task counts as a failure.
pub async fn run_parallel(
    parent: &CancellationToken,
    tasks: Vec<ParallelTask>,
) -> Result<(), RunnerError> {
    if tasks.is_empty() {
        return Ok(());
    }
    let token = parent.child_token();
    // One slot per task so no sender ever waits on the receiver.
    let (err_tx, mut err_rx) = mpsc::channel(tasks.len());

    let mut handles = Vec::with_capacity(tasks.len());
    for (index, task) in tasks.into_iter().enumerate() {
        let token = token.clone();
        let err_tx = err_tx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = task(token.clone()).await {
                debug!(index, err = %err, "parallel task failed; cancelling siblings");
                token.cancel();
                let _ = err_tx.try_send(err);
            }
        }));
    }
    drop(err_tx);

    let mut panicked = None;
    for handle in handles {
        if let Err(join_err) = handle.await {
            warn!(err = %join_err, "parallel task panicked");
            token.cancel();
            panicked.get_or_insert(RunnerError::TaskPanicked(join_err.to_string()));
        }
    }

    match err_rx.try_recv() {
        Ok(err) => Err(err),
        Err(_) => panicked.map_or(Ok(()), Err),
    }
}
