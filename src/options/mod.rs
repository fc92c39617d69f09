//! Controller manager options
//!
//! Options are built once at startup by [`merge`] from three layers:
//! built-in [`Defaults`], the on-disk [`DiskConfig`] and [`CliOverrides`].
//! The resulting [`Options`] value is never mutated afterwards.

mod disk;

pub use disk::*;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Namespace holding the leader election lease
pub const DEFAULT_LEADER_ELECTION_NAMESPACE: &str = "kubesphere-devops-system";

/// Name of the leader election lease
pub const DEFAULT_LEADER_ELECTION_ID: &str = "ks-devops-controller-manager-leader-election";

/// Webhook port; 8443 instead of 443 so the process does not need root to bind it
pub const WEBHOOK_PORT: u16 = 8443;

/// Metrics and health endpoint port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default webhook certificate directory
pub const DEFAULT_WEBHOOK_CERT_DIR: &str = "/tmp/k8s-webhook-server/serving-certs";

/// Cluster API access settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesOptions {
    /// Path to a kubeconfig file; in-cluster configuration is used when absent
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    /// Kubeconfig context to use
    #[serde(default)]
    pub context: Option<String>,
    /// Overrides the API server address from the kubeconfig
    #[serde(default)]
    pub master: Option<String>,
}

/// CI execution service (Jenkins) settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiOptions {
    /// Service base URL. Empty means the service is not configured.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub username: String,
    /// Password or API token
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_connections() -> usize {
    100
}

/// S3-compatible object store settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreOptions {
    /// Service endpoint. Empty means the service is not configured.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default, rename = "accessKeyID")]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: String,
    #[serde(default, rename = "disableSSL")]
    pub disable_ssl: bool,
    #[serde(default)]
    pub force_path_style: bool,
}

/// Lease timing and identity of the leader election lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderElectionPolicy {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the leader keeps retrying renewal before giving up
    pub renew_deadline: Duration,
    /// Interval between acquisition and renewal attempts
    pub retry_period: Duration,
    pub namespace: String,
    pub election_id: String,
}

impl Default for LeaderElectionPolicy {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_deadline: Duration::from_secs(15),
            retry_period: Duration::from_secs(5),
            namespace: DEFAULT_LEADER_ELECTION_NAMESPACE.to_string(),
            election_id: DEFAULT_LEADER_ELECTION_ID.to_string(),
        }
    }
}

impl LeaderElectionPolicy {
    /// Check timing and naming rules, returning every violation
    pub fn violations(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.retry_period.is_zero() {
            errors.push("leader election retry period must be greater than zero".to_string());
        }
        if self.renew_deadline >= self.lease_duration {
            errors.push(format!(
                "leader election renew deadline ({:?}) must be less than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            ));
        }
        if self.retry_period >= self.renew_deadline {
            errors.push(format!(
                "leader election retry period ({:?}) must be less than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            ));
        }
        if self.namespace.is_empty() {
            errors.push("leader election namespace cannot be empty".to_string());
        }
        if self.election_id.is_empty() {
            errors.push("leader election id cannot be empty".to_string());
        }

        errors
    }
}

/// Whether this process takes part in leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderElection {
    /// Single replica, permanent leader
    Disabled,
    /// Elected through the lease described by the policy
    Enabled(LeaderElectionPolicy),
}

impl LeaderElection {
    /// Whether leader election is enabled
    pub fn enabled(&self) -> bool {
        matches!(self, LeaderElection::Enabled(_))
    }

    /// The lease policy, only available when enabled
    pub fn policy(&self) -> Option<&LeaderElectionPolicy> {
        match self {
            LeaderElection::Enabled(policy) => Some(policy),
            LeaderElection::Disabled => None,
        }
    }
}

/// Built-in defaults, the lowest configuration layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Defaults {
    pub kubernetes: KubernetesOptions,
    pub ci: Option<CiOptions>,
    pub object_store: Option<ObjectStoreOptions>,
}

/// Settings that only ever come from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOverrides {
    pub leader_elect: bool,
    pub leader_election: LeaderElectionPolicy,
    pub webhook_cert_dir: PathBuf,
    pub metrics_port: u16,
    pub graceful_shutdown_timeout: Duration,
}

impl Default for CliOverrides {
    fn default() -> Self {
        Self {
            leader_elect: false,
            leader_election: LeaderElectionPolicy::default(),
            webhook_cert_dir: PathBuf::from(DEFAULT_WEBHOOK_CERT_DIR),
            metrics_port: DEFAULT_METRICS_PORT,
            graceful_shutdown_timeout: crate::shutdown::DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Immutable configuration snapshot used by every component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Options {
    pub kubernetes: KubernetesOptions,
    pub ci: Option<CiOptions>,
    pub object_store: Option<ObjectStoreOptions>,
    pub leader_election: LeaderElection,
    pub webhook_cert_dir: PathBuf,
    pub webhook_port: u16,
    pub metrics_port: u16,
    pub graceful_shutdown_timeout: Duration,
}

impl Options {
    /// Validate the snapshot, collecting every violation into one error
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Some(policy) = self.leader_election.policy() {
            errors.extend(policy.violations());
        }
        if self.webhook_port == self.metrics_port {
            errors.push(format!(
                "metrics port {} collides with the webhook port",
                self.metrics_port
            ));
        }
        if self.graceful_shutdown_timeout.is_zero() {
            errors.push("graceful shutdown timeout must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::config(errors.join("; ")))
        }
    }
}

/// Merge the three configuration layers into one validated snapshot.
///
/// Sections present on disk replace the defaults. Leader election and the
/// webhook certificate directory always come from `cli`, whatever the disk
/// document says. The merge reads no environment, so identical inputs always
/// produce identical options.
pub fn merge(defaults: &Defaults, disk: &DiskConfig, cli: &CliOverrides) -> Result<Options> {
    let kubernetes = disk
        .kubernetes
        .clone()
        .unwrap_or_else(|| defaults.kubernetes.clone());

    let ci = match &disk.ci {
        Some(ci) => Some(ci.clone()),
        None => defaults.ci.clone(),
    }
    .filter(|ci| !ci.host.trim().is_empty());

    let object_store = match &disk.object_store {
        Some(store) => Some(store.clone()),
        None => defaults.object_store.clone(),
    }
    .filter(|store| !store.endpoint.trim().is_empty());

    let leader_election = if cli.leader_elect {
        LeaderElection::Enabled(cli.leader_election.clone())
    } else {
        LeaderElection::Disabled
    };

    let options = Options {
        kubernetes,
        ci,
        object_store,
        leader_election,
        webhook_cert_dir: cli.webhook_cert_dir.clone(),
        webhook_port: WEBHOOK_PORT,
        metrics_port: cli.metrics_port,
        graceful_shutdown_timeout: cli.graceful_shutdown_timeout,
    };

    options.validate()?;
    Ok(options)
}
