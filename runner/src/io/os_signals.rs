//! Process-wide termination signals.
//!
//! [`ShutdownSignals::install`] registers handlers immediately, so a signal
//! delivered any time after it returns is observed by [`ShutdownSignals::recv`].
//! Unix listens for SIGINT, SIGTERM and SIGQUIT; other targets for Ctrl-C.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
const WATCHED: [(&str, fn() -> tokio::signal::unix::SignalKind); 3] = [
    ("SIGINT", tokio::signal::unix::SignalKind::interrupt),
    ("SIGTERM", tokio::signal::unix::SignalKind::terminate),
    ("SIGQUIT", tokio::signal::unix::SignalKind::quit),
];

/// Registered termination-signal listeners.
pub struct ShutdownSignals {
    #[cfg(unix)]
    streams: Vec<(&'static str, tokio::signal::unix::Signal)>,
}

impl ShutdownSignals {
    /// Register the handlers. Must be called inside a tokio runtime.
    #[cfg(unix)]
    pub fn install() -> std::io::Result<Self> {
        let mut streams = Vec::with_capacity(WATCHED.len());
        for (name, kind) in WATCHED {
            streams.push((name, tokio::signal::unix::signal(kind())?));
        }
        Ok(Self { streams })
    }

    #[cfg(not(unix))]
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next termination signal and return its name.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        std::future::poll_fn(|cx| {
            for (name, stream) in &mut self.streams {
                if stream.poll_recv(cx).is_ready() {
                    return std::task::Poll::Ready(*name);
                }
            }
            std::task::Poll::Pending
        })
        .await
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(err = %err, "listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        "CTRL_C"
    }
}

/// Cancel `token` when a termination signal arrives.
///
/// Handlers are in place when this returns. The listener stops quietly if
/// `token` is cancelled for another reason. `None` when the handlers could
/// not be installed; the caller then runs without signal-driven shutdown.
pub fn cancel_on_signal(token: CancellationToken) -> Option<JoinHandle<()>> {
    let mut signals = match ShutdownSignals::install() {
        Ok(signals) => signals,
        Err(err) => {
            warn!(err = %err, "install signal handlers");
            return None;
        }
    };
    Some(tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            signal = signals.recv() => {
                info!(signal, "termination signal received; shutting down");
                token.cancel();
            }
        }
    }))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    use nix::sys::signal::{Signal, raise};

    #[tokio::test]
    async fn raised_sigterm_cancels_token() {
        let token = CancellationToken::new();
        let listener = cancel_on_signal(token.clone()).expect("handlers installed");

        raise(Signal::SIGTERM).expect("raise");
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .expect("token cancelled by signal");
        listener.await.expect("listener exits");
    }

    #[tokio::test]
    async fn listener_stops_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let listener = cancel_on_signal(token.clone()).expect("handlers installed");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .expect("listener stops")
            .expect("join");
    }
}
