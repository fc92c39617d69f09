//! Leader election
//!
//! Only the replica holding the lease runs controllers. The coordinator
//! drives the state machine
//!
//! ```text
//! Unheld ──► Acquiring ──► Leading ──► Lost
//! ```
//!
//! on top of an abstract [`DistributedLock`]. `Lost` is terminal: the process
//! stops reconciling and relies on its supervisor to restart it and stand for
//! election again.
//!
//! When leader election is disabled the coordinator runs in bypass mode and
//! reports `Leading` for the lifetime of the process without touching a lock.

mod lease;
mod memory;

pub use lease::LeaseLock;
pub use memory::{InMemoryLease, InMemoryLock};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::options::LeaderElectionPolicy;
use crate::shutdown::Shutdown;

/// Leadership state of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipState {
    Unheld,
    Acquiring,
    Leading,
    Lost,
}

/// Lock provider errors
#[derive(Debug, Error)]
pub enum LockError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Provider could not be reached or answered inconsistently
    #[error("lock provider unavailable: {0}")]
    Unavailable(String),

    /// The lock changed between read and write; worth another attempt
    #[error("lock changed concurrently: {0}")]
    Conflict(String),
}

/// A distributed, time-bounded mutual exclusion lock
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Identity recorded as holder when this candidate owns the lock
    fn identity(&self) -> &str;

    /// Take the lock if it is free, expired, or already ours
    async fn try_acquire(&self) -> Result<bool, LockError>;

    /// Extend our hold on the lock. `Ok(false)` means someone else holds it.
    async fn renew(&self) -> Result<bool, LockError>;

    /// Give the lock up so another candidate can take it without waiting
    async fn release(&self) -> Result<(), LockError>;
}

enum Mode {
    Bypass,
    Elected {
        lock: Arc<dyn DistributedLock>,
        policy: LeaderElectionPolicy,
    },
}

/// Owns the leadership state machine of this process
pub struct LeadershipCoordinator {
    mode: Mode,
    state: Arc<watch::Sender<LeadershipState>>,
}

impl LeadershipCoordinator {
    /// Coordinator that competes for `lock` using `policy`
    pub fn elected(lock: Arc<dyn DistributedLock>, policy: LeaderElectionPolicy) -> Self {
        let (state, _) = watch::channel(LeadershipState::Unheld);
        Self {
            mode: Mode::Elected { lock, policy },
            state: Arc::new(state),
        }
    }

    /// Coordinator for a single-replica deployment: permanently leading
    pub fn bypass() -> Self {
        let (state, _) = watch::channel(LeadershipState::Leading);
        Self {
            mode: Mode::Bypass,
            state: Arc::new(state),
        }
    }

    /// Whether this coordinator takes part in an election
    pub fn is_elected(&self) -> bool {
        matches!(self.mode, Mode::Elected { .. })
    }

    /// Current state
    pub fn state(&self) -> LeadershipState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state.subscribe()
    }

    /// Block until leadership is held.
    ///
    /// Returns `None` if `shutdown` is raised first. Lock errors while
    /// acquiring are logged and retried every retry period.
    pub async fn acquire(&self, shutdown: &Shutdown) -> Option<LeaderGuard> {
        let (lock, policy) = match &self.mode {
            Mode::Bypass => {
                info!("Leader election disabled, running as sole leader");
                metrics::IS_LEADER.set(1.0);
                return Some(LeaderGuard::permanent(shutdown.child()));
            }
            Mode::Elected { lock, policy } => (lock, policy),
        };

        self.state.send_replace(LeadershipState::Acquiring);
        info!(
            identity = %lock.identity(),
            namespace = %policy.namespace,
            lease = %policy.election_id,
            "Attempting to acquire leadership"
        );

        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown raised before leadership was acquired");
                    self.state.send_replace(LeadershipState::Unheld);
                    return None;
                }
                attempt = lock.try_acquire() => attempt,
            };

            match attempt {
                Ok(true) => break,
                Ok(false) => debug!(
                    retry_secs = policy.retry_period.as_secs(),
                    "Lease held by another candidate, waiting"
                ),
                Err(e) => warn!(
                    error = %e,
                    retry_secs = policy.retry_period.as_secs(),
                    "Failed to acquire lease, retrying"
                ),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.state.send_replace(LeadershipState::Unheld);
                    return None;
                }
                _ = sleep(policy.retry_period) => {}
            }
        }

        info!(identity = %lock.identity(), "Leadership acquired");
        self.state.send_replace(LeadershipState::Leading);
        metrics::IS_LEADER.set(1.0);
        metrics::LEADER_TRANSITIONS.inc();

        let term = shutdown.child();
        let (lost_tx, lost_rx) = oneshot::channel();
        let renewal = tokio::spawn(renew_loop(
            Arc::clone(lock),
            policy.clone(),
            term.clone(),
            Arc::clone(&self.state),
            lost_tx,
        ));

        Some(LeaderGuard {
            term,
            lost: Some(lost_rx),
            renewal: Some(renewal),
            lock: Some(Arc::clone(lock)),
            state: Some(Arc::clone(&self.state)),
        })
    }
}

/// Keeps the lease renewed while leading.
///
/// Renewal is attempted every retry period. Each attempt must complete before
/// `last successful renewal + renew deadline`; missing that deadline, or
/// finding the lease held by someone else, ends the term.
async fn renew_loop(
    lock: Arc<dyn DistributedLock>,
    policy: LeaderElectionPolicy,
    term: CancellationToken,
    state: Arc<watch::Sender<LeadershipState>>,
    lost: oneshot::Sender<String>,
) {
    let mut last_renewal = Instant::now();

    loop {
        tokio::select! {
            _ = term.cancelled() => return,
            _ = sleep(policy.retry_period) => {}
        }

        let deadline = last_renewal + policy.renew_deadline;
        let failure = loop {
            let attempt = tokio::select! {
                _ = term.cancelled() => return,
                attempt = timeout_at(deadline, lock.renew()) => attempt,
            };

            match attempt {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    tracing::trace!("Lease renewed");
                    break None;
                }
                Ok(Ok(false)) => break Some("lease acquired by another candidate".to_string()),
                Ok(Err(e)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break Some(format!("failed to renew lease before deadline: {}", e));
                    }
                    warn!(
                        error = %e,
                        remaining_ms = (deadline - now).as_millis() as u64,
                        "Transient lease renewal failure, will retry"
                    );
                    let next = std::cmp::min(now + policy.retry_period, deadline);
                    tokio::select! {
                        _ = term.cancelled() => return,
                        _ = sleep_until(next) => {}
                    }
                }
                Err(_) => {
                    break Some(format!(
                        "lease not renewed within renew deadline {:?}",
                        policy.renew_deadline
                    ))
                }
            }
        };

        if let Some(reason) = failure {
            // Stop dequeuing before anyone can observe the new state
            term.cancel();
            state.send_replace(LeadershipState::Lost);
            metrics::IS_LEADER.set(0.0);
            error!(identity = %lock.identity(), reason = %reason, "Leadership lost");
            let _ = lost.send(reason);
            return;
        }
    }
}

/// Proof of leadership for one term.
///
/// The term token is cancelled when leadership is lost, released, or the
/// guard is dropped.
pub struct LeaderGuard {
    term: CancellationToken,
    lost: Option<oneshot::Receiver<String>>,
    renewal: Option<JoinHandle<()>>,
    lock: Option<Arc<dyn DistributedLock>>,
    state: Option<Arc<watch::Sender<LeadershipState>>>,
}

impl LeaderGuard {
    fn permanent(term: CancellationToken) -> Self {
        Self {
            term,
            lost: None,
            renewal: None,
            lock: None,
            state: None,
        }
    }

    /// Token cancelled when this leadership term ends
    pub fn term(&self) -> CancellationToken {
        self.term.clone()
    }

    /// Wait until leadership is lost, returning the reason.
    ///
    /// Never resolves in bypass mode.
    pub async fn lost(&mut self) -> String {
        match self.lost.as_mut() {
            Some(rx) => {
                let reason = rx
                    .await
                    .unwrap_or_else(|_| "lease renewal task stopped".to_string());
                self.lost = None;
                reason
            }
            None => std::future::pending().await,
        }
    }

    /// End the term and hand the lock back so a follower can take over quickly
    pub async fn release(mut self) {
        self.term.cancel();
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
        if let Some(lock) = self.lock.take() {
            match lock.release().await {
                Ok(()) => info!(identity = %lock.identity(), "Lease released"),
                Err(e) => warn!(error = %e, "Failed to release lease"),
            }
        }
        if let Some(state) = self.state.take() {
            state.send_replace(LeadershipState::Lost);
        }
        metrics::IS_LEADER.set(0.0);
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.term.cancel();
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

/// Holder identity for this process: pod or host name plus a random suffix
pub fn holder_identity() -> String {
    let name = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "devops-controller-manager".to_string());

    format!("{}_{}", name, uuid::Uuid::new_v4())
}
