//! Process-wide shutdown signal
//!
//! A single latched signal raised by the OS signal handler or by a fatal error.
//! Every long-running task selects on it; raising it more than once is a no-op.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default time given to in-flight work after shutdown is raised
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Broadcast, write-once shutdown signal
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl Shutdown {
    /// Create a new, not yet raised signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Only the first reason is kept.
    pub fn raise(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.reason.set(reason.clone()).is_ok() {
            info!(reason = %reason, "Shutdown signal raised");
        }
        self.token.cancel();
    }

    /// Whether the signal has been raised
    pub fn is_raised(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason recorded by the first `raise`
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }

    /// Wait until the signal is raised
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// A child token that is cancelled with this signal but can also be
    /// cancelled on its own (used for a single leadership term)
    pub fn child(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// Install SIGINT/SIGTERM handlers that raise `shutdown`.
///
/// A second signal terminates the process immediately with exit code 1.
pub fn listen_for_os_signals(shutdown: Shutdown) -> std::io::Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    tokio::spawn(async move {
        for attempt in 0..2 {
            #[cfg(unix)]
            let received = tokio::select! {
                res = signal::ctrl_c() => res.map(|_| "SIGINT"),
                _ = terminate.recv() => Ok("SIGTERM"),
            };

            #[cfg(not(unix))]
            let received = signal::ctrl_c().await.map(|_| "CTRL+C");

            let name = match received {
                Ok(name) => name,
                Err(e) => {
                    error!(error = %e, "Failed to listen for shutdown signal");
                    return;
                }
            };

            if attempt == 0 {
                info!(signal = name, "Received shutdown signal");
                shutdown.raise(format!("received {name}"));
            } else {
                error!(signal = name, "Received second shutdown signal, exiting immediately");
                std::process::exit(1);
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raise_is_latched_and_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_raised());

        shutdown.raise("first");
        shutdown.raise("second");

        assert!(shutdown.is_raised());
        assert_eq!(shutdown.reason(), Some("first"));
        shutdown.cancelled().await;
    }

    #[tokio::test]
    async fn clones_and_children_observe_the_signal() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();
        let term = shutdown.child();

        shutdown.raise("stop");

        assert!(observer.is_raised());
        assert!(term.is_cancelled());
    }

    #[test]
    fn waiters_wake_only_when_raised() {
        let shutdown = Shutdown::new();
        let mut waiter = tokio_test::task::spawn(shutdown.cancelled());

        tokio_test::assert_pending!(waiter.poll());

        shutdown.raise("stop");

        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn cancelling_a_child_does_not_raise_the_parent() {
        let shutdown = Shutdown::new();
        let term = shutdown.child();

        term.cancel();

        assert!(!shutdown.is_raised());
        assert_eq!(shutdown.reason(), None);
    }
}
