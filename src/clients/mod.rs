//! Clients shared by every controller
//!
//! The cluster client is mandatory. The CI and object store clients exist
//! only when their endpoint is configured; a configured endpoint that cannot
//! be reached aborts startup.

pub mod ci;
pub mod cluster;
pub mod object_store;
mod sigv4;

use std::fmt;
use std::sync::Arc;

use kube::Client;
use tracing::info;

use crate::error::Result;
use crate::options::Options;

pub use ci::{CiClient, Credential, CredentialKind, JenkinsClient};
pub use object_store::{ObjectStoreClient, S3Client};

/// The set of clients built once at startup and shared read-only afterwards
#[derive(Clone)]
pub struct ClientSet {
    kubernetes: Client,
    ci: Option<Arc<dyn CiClient>>,
    object_store: Option<Arc<dyn ObjectStoreClient>>,
}

impl ClientSet {
    /// Assemble a client set from already built clients
    pub fn new(
        kubernetes: Client,
        ci: Option<Arc<dyn CiClient>>,
        object_store: Option<Arc<dyn ObjectStoreClient>>,
    ) -> Self {
        Self {
            kubernetes,
            ci,
            object_store,
        }
    }

    /// Build every client from the options.
    ///
    /// Returns either a complete set or the first construction error.
    pub async fn build(options: &Options) -> Result<Self> {
        let kubernetes = cluster::build(&options.kubernetes).await?;
        let ci = ci::build(options.ci.as_ref()).await?;
        let object_store = object_store::build(options.object_store.as_ref()).await?;

        info!(
            ci = ci.is_some(),
            object_store = object_store.is_some(),
            "Client set ready"
        );

        Ok(Self::new(kubernetes, ci, object_store))
    }

    /// Kubernetes API client
    pub fn kubernetes(&self) -> &Client {
        &self.kubernetes
    }

    /// CI service client, if configured
    pub fn ci(&self) -> Option<&Arc<dyn CiClient>> {
        self.ci.as_ref()
    }

    /// Object store client, if configured
    pub fn object_store(&self) -> Option<&Arc<dyn ObjectStoreClient>> {
        self.object_store.as_ref()
    }
}

impl fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSet")
            .field("ci", &self.ci.as_ref().map(|c| c.host().to_string()))
            .field(
                "object_store",
                &self.object_store.as_ref().map(|s| s.bucket().to_string()),
            )
            .finish_non_exhaustive()
    }
}
