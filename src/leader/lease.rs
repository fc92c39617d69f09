//! Kubernetes Lease backed lock
//!
//! Uses `coordination.k8s.io/v1` Leases. Every write carries the
//! resourceVersion that was read, so two candidates racing for an expired
//! lease cannot both win: the loser gets 409 Conflict and reports "not held".
//! A conflict while renewing our own lease is retried until the renew
//! deadline instead.
//!
//! Expiry is judged by the local clock: a record expires once it has stayed
//! unchanged for its lease duration since this replica first saw it, so clock
//! skew between replicas does not matter.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{DistributedLock, LockError};
use crate::options::LeaderElectionPolicy;

/// Lock stored in a Kubernetes Lease object
pub struct LeaseLock {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    /// Last seen resourceVersion and when it was first seen
    observed: Mutex<Option<(String, Instant)>>,
}

impl LeaseLock {
    /// Lock on the lease named by `policy`, held as `identity`
    pub fn new(client: Client, policy: &LeaderElectionPolicy, identity: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, &policy.namespace),
            lease_name: policy.election_id.clone(),
            identity: identity.into(),
            lease_duration: policy.lease_duration,
            observed: Mutex::new(None),
        }
    }

    /// Local time at which the current version of `lease` was first seen
    fn observe(&self, lease: &Lease) -> Instant {
        let version = lease.metadata.resource_version.clone().unwrap_or_default();
        let now = Instant::now();
        let mut observed = self.observed.lock().unwrap_or_else(|p| p.into_inner());
        match observed.as_ref() {
            Some((seen, at)) if *seen == version => *at,
            _ => {
                *observed = Some((version, now));
                now
            }
        }
    }

    /// Acquire or renew in one compare-and-swap round trip
    async fn try_acquire_or_renew(&self) -> Result<bool, LockError> {
        let now = Utc::now();

        let existing = match self.api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return self.create(now).await,
            Err(e) => return Err(e.into()),
        };

        let observed_at = self.observe(&existing);
        let spec = existing.spec.as_ref();
        let holder = spec.and_then(|s| s.holder_identity.as_deref());

        if holder == Some(self.identity.as_str()) {
            let mut renewed = existing.clone();
            if let Some(spec) = renewed.spec.as_mut() {
                spec.renew_time = Some(MicroTime(now));
            }
            return match self.replace(&renewed).await? {
                true => Ok(true),
                false => Err(LockError::Conflict(
                    "lease changed while renewing".to_string(),
                )),
            };
        }

        if holder.is_some() && !is_expired(spec, observed_at, Instant::now()) {
            return Ok(false);
        }

        let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
        let mut taken = existing.clone();
        taken.spec = Some(self.spec(now, transitions + 1));
        let acquired = self.replace(&taken).await?;
        if acquired {
            info!(
                identity = %self.identity,
                previous = holder.unwrap_or("none"),
                transitions = transitions + 1,
                "Took over lease"
            );
        }
        Ok(acquired)
    }

    fn spec(&self, now: chrono::DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create(&self, now: chrono::DateTime<Utc>) -> Result<bool, LockError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(self.spec(now, 0)),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, lease = %self.lease_name, "Created lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease created concurrently by another candidate");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, LockError> {
        if lease.metadata.resource_version.is_none() {
            return Err(LockError::Unavailable(
                "lease is missing resourceVersion".to_string(),
            ));
        }

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease changed since read");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// A lease without renew time or duration counts as expired
fn is_expired(spec: Option<&LeaseSpec>, observed_at: Instant, now: Instant) -> bool {
    match (
        spec.and_then(|s| s.renew_time.as_ref()),
        spec.and_then(|s| s.lease_duration_seconds),
    ) {
        (Some(_), Some(seconds)) if seconds > 0 => {
            now > observed_at + Duration::from_secs(seconds as u64)
        }
        _ => true,
    }
}

#[async_trait]
impl DistributedLock for LeaseLock {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn try_acquire(&self) -> Result<bool, LockError> {
        self.try_acquire_or_renew().await
    }

    async fn renew(&self) -> Result<bool, LockError> {
        self.try_acquire_or_renew().await
    }

    async fn release(&self) -> Result<(), LockError> {
        let lease = match self.api.get(&self.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Clear the holder and expire the lease so a follower takes over at once
        let mut released = lease.clone();
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
            spec.lease_duration_seconds = Some(1);
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }
        self.replace(&released).await?;
        Ok(())
    }
}
