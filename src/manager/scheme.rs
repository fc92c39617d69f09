//! Type registry shared by every controller
//!
//! Maps `apiVersion/kind` to the API resource used to reach it. Registering
//! the same kind twice is allowed as long as both registrations agree.

use std::collections::BTreeMap;

use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Resource;
use tracing::debug;

use crate::error::{Error, Result};

/// API group of the DevOps custom resources
pub const DEVOPS_GROUP: &str = "devops.kubesphere.io";

/// Served version of the DevOps custom resources
pub const DEVOPS_VERSION: &str = "v1alpha3";

/// Known resource types
#[derive(Debug, Default, Clone)]
pub struct Scheme {
    types: BTreeMap<String, ApiResource>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically typed resource
    pub fn add<K>(&mut self) -> Result<()>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        self.add_api_resource(ApiResource::erase::<K>(&Default::default()))
    }

    /// Register a resource known only by group, version, kind and plural
    pub fn add_api_resource(&mut self, resource: ApiResource) -> Result<()> {
        let key = format!("{}/{}", resource.api_version, resource.kind);
        match self.types.get(&key) {
            Some(existing) if *existing == resource => Ok(()),
            Some(existing) => Err(Error::registration(format!(
                "kind {} already registered as {} with a different resource ({})",
                key, existing.plural, resource.plural
            ))),
            None => {
                debug!(kind = %key, plural = %resource.plural, "Registered type");
                self.types.insert(key, resource);
                Ok(())
            }
        }
    }

    /// Resource registered for `api_version` and `kind`
    pub fn resource(&self, api_version: &str, kind: &str) -> Option<&ApiResource> {
        self.types.get(&format!("{}/{}", api_version, kind))
    }

    /// Resource registered for `K`. Controllers may only watch known kinds.
    pub fn require<K>(&self) -> Result<&ApiResource>
    where
        K: Resource,
        K::DynamicType: Default,
    {
        let dt = Default::default();
        let (api_version, kind) = (K::api_version(&dt), K::kind(&dt));
        self.resource(&api_version, &kind).ok_or_else(|| {
            Error::registration(format!(
                "kind {}/{} is not registered in the scheme",
                api_version, kind
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Adds a set of types to a [`Scheme`]
pub trait SchemeRegistrar: Send + Sync {
    fn add_to_scheme(&self, scheme: &mut Scheme) -> Result<()>;
}

/// Core types used by the bundled controllers plus the DevOps API group
#[derive(Debug, Default, Clone, Copy)]
pub struct DevOpsApis;

const DEVOPS_KINDS: &[(&str, &str)] = &[
    ("DevOpsProject", "devopsprojects"),
    ("Pipeline", "pipelines"),
    ("S2iBinary", "s2ibinaries"),
    ("S2iBuilder", "s2ibuilders"),
    ("S2iRun", "s2iruns"),
];

impl SchemeRegistrar for DevOpsApis {
    fn add_to_scheme(&self, scheme: &mut Scheme) -> Result<()> {
        scheme.add::<Secret>()?;
        scheme.add::<ConfigMap>()?;
        scheme.add::<Namespace>()?;
        scheme.add::<Lease>()?;

        for (kind, plural) in DEVOPS_KINDS {
            let gvk = GroupVersionKind::gvk(DEVOPS_GROUP, DEVOPS_VERSION, kind);
            scheme.add_api_resource(ApiResource::from_gvk_with_plural(&gvk, plural))?;
        }
        Ok(())
    }
}
