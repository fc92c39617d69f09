//! In-process lock
//!
//! Shares a lease table between candidates in the same process, so several
//! coordinators can compete without a cluster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DistributedLock, LockError};

#[derive(Debug)]
struct Table {
    holder: Option<String>,
    renewed_at: Instant,
    reachable: bool,
    hanging: bool,
}

/// A lease shared by every [`InMemoryLock`] created from it
#[derive(Debug, Clone)]
pub struct InMemoryLease {
    table: Arc<Mutex<Table>>,
    lease_duration: Duration,
    attempts: Arc<AtomicU64>,
}

impl InMemoryLease {
    pub fn new(lease_duration: Duration) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                holder: None,
                renewed_at: Instant::now(),
                reachable: true,
                hanging: false,
            })),
            lease_duration,
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Candidate handle competing for this lease as `identity`
    pub fn lock(&self, identity: impl Into<String>) -> InMemoryLock {
        InMemoryLock {
            lease: self.clone(),
            identity: identity.into(),
        }
    }

    /// Current holder, if the lease is held and not expired
    pub fn holder(&self) -> Option<String> {
        let table = self.table();
        if self.expired(&table) {
            None
        } else {
            table.holder.clone()
        }
    }

    /// Hand the lease to `identity` as if it had just renewed
    pub fn force_holder(&self, identity: &str) {
        let mut table = self.table();
        table.holder = Some(identity.to_string());
        table.renewed_at = Instant::now();
    }

    /// Make every call block forever
    pub fn set_hanging(&self, hanging: bool) {
        self.table().hanging = hanging;
    }

    /// Make every call fail with [`LockError::Unavailable`]
    pub fn set_reachable(&self, reachable: bool) {
        self.table().reachable = reachable;
    }

    /// Number of acquire and renew calls made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, table: &Table) -> bool {
        Instant::now() >= table.renewed_at + self.lease_duration
    }

    async fn claim(&self, identity: &str) -> Result<bool, LockError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let hanging = {
            let table = self.table();
            if !table.reachable {
                return Err(LockError::Unavailable("in-memory lease unreachable".to_string()));
            }
            table.hanging
        };
        if hanging {
            std::future::pending::<()>().await;
        }

        let mut table = self.table();
        let free = match table.holder.as_deref() {
            None => true,
            Some(holder) if holder == identity => true,
            Some(_) => self.expired(&table),
        };
        if free {
            table.holder = Some(identity.to_string());
            table.renewed_at = Instant::now();
        }
        Ok(free)
    }
}

/// One candidate's view of an [`InMemoryLease`]
#[derive(Debug, Clone)]
pub struct InMemoryLock {
    lease: InMemoryLease,
    identity: String,
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn try_acquire(&self) -> Result<bool, LockError> {
        self.lease.claim(&self.identity).await
    }

    async fn renew(&self) -> Result<bool, LockError> {
        self.lease.claim(&self.identity).await
    }

    async fn release(&self) -> Result<(), LockError> {
        let mut table = self.lease.table();
        if table.holder.as_deref() == Some(self.identity.as_str()) {
            table.holder = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_second_candidate_waits_for_expiry() {
        let lease = InMemoryLease::new(Duration::from_secs(10));
        let a = lease.lock("a");
        let b = lease.lock("b");

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(b.try_acquire().await.unwrap());
        assert!(!a.renew().await.unwrap());
        assert_eq!(lease.holder().as_deref(), Some("b"));
        assert_eq!(lease.attempts(), 4);
    }

    #[tokio::test]
    async fn test_unreachable_lease_errors() {
        let lease = InMemoryLease::new(Duration::from_secs(10));
        lease.set_reachable(false);

        assert!(matches!(
            lease.lock("a").try_acquire().await,
            Err(LockError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_noop() {
        let lease = InMemoryLease::new(Duration::from_secs(10));
        assert!(lease.lock("a").try_acquire().await.unwrap());

        lease.lock("b").release().await.unwrap();

        assert_eq!(lease.holder().as_deref(), Some("a"));
    }
}
