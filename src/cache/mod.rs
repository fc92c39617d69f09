//! Shared informer caches
//!
//! Controllers obtain informers during registration and attach event
//! handlers to them. The cache is started once, after every controller has
//! registered, so no handler misses the initial listing.

mod informer;

pub use informer::{CacheEvent, EventHandler, KubeInformer};

use std::any::{Any, TypeId};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::runtime::watcher;
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics;
use crate::shutdown::Shutdown;

/// A watch-populated cache of one resource type
#[async_trait]
pub trait Informer: Send + Sync {
    /// `apiVersion/kind` of the cached objects
    fn kind(&self) -> &str;

    /// Refuse further handler registration; called right before `run`
    fn seal(&self);

    /// Run the watch loop until `shutdown` is raised
    async fn run(self: Arc<Self>, shutdown: Shutdown);

    /// Whether the initial listing has completed
    fn has_synced(&self) -> bool;

    /// Resolve once the initial listing has completed
    async fn wait_synced(&self);
}

struct Registered {
    type_id: Option<TypeId>,
    typed: Option<Arc<dyn Any + Send + Sync>>,
    informer: Arc<dyn Informer>,
}

/// Owns every informer and starts them together
#[derive(Default)]
pub struct CacheCoordinator {
    informers: Mutex<Vec<Registered>>,
    started: AtomicBool,
}

impl CacheCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an informer. Fails once the cache has been started.
    pub fn register(&self, informer: Arc<dyn Informer>) -> Result<()> {
        self.insert(Registered {
            type_id: None,
            typed: None,
            informer,
        })
    }

    /// Shared informer for `K`, created on first use.
    ///
    /// Later calls for the same type return the first informer regardless
    /// of `api`.
    pub fn informer<K>(&self, api: Api<K>) -> Result<Arc<KubeInformer<K>>>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Eq + Hash + Clone + Default,
    {
        let type_id = TypeId::of::<K>();
        {
            let informers = self.lock();
            let existing = informers
                .iter()
                .filter(|r| r.type_id == Some(type_id))
                .find_map(|r| r.typed.clone());
            if let Some(existing) = existing {
                return existing.downcast::<KubeInformer<K>>().map_err(|_| {
                    Error::registration("informer registered under a mismatched type")
                });
            }
        }

        let informer = Arc::new(KubeInformer::new(api, watcher::Config::default()));
        self.insert(Registered {
            type_id: Some(type_id),
            typed: Some(informer.clone() as Arc<dyn Any + Send + Sync>),
            informer: informer.clone(),
        })?;
        Ok(informer)
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Kinds of every registered informer, in registration order
    pub fn kinds(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|r| r.informer.kind().to_string())
            .collect()
    }

    /// Spawn one watch loop per informer. May only be called once.
    pub fn start(&self, shutdown: &Shutdown) -> Result<()> {
        let informers = self.lock();
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::registration("cache already started"));
        }

        info!(informers = informers.len(), "Starting informer caches");
        for registered in informers.iter() {
            let informer = registered.informer.clone();
            informer.seal();
            debug!(kind = %informer.kind(), "Starting informer");
            tokio::spawn(informer.run(shutdown.clone()));
        }
        Ok(())
    }

    /// Wait until every informer has completed its initial listing.
    ///
    /// Returns `false` if `shutdown` is raised first.
    pub async fn wait_for_sync(&self, shutdown: &Shutdown) -> bool {
        let informers: Vec<Arc<dyn Informer>> =
            self.lock().iter().map(|r| r.informer.clone()).collect();

        let all_synced = futures::future::join_all(informers.iter().map(|i| i.wait_synced()));
        tokio::select! {
            _ = shutdown.cancelled() => {
                let pending: Vec<&str> = informers
                    .iter()
                    .filter(|i| !i.has_synced())
                    .map(|i| i.kind())
                    .collect();
                info!(pending = ?pending, "Shutdown raised before caches synced");
                false
            }
            _ = all_synced => {
                metrics::CACHE_SYNCED.set(1.0);
                info!(informers = informers.len(), "Caches synced");
                true
            }
        }
    }

    fn insert(&self, registered: Registered) -> Result<()> {
        let mut informers = self.lock();
        if self.is_started() {
            return Err(Error::registration(format!(
                "cannot register the {} informer after the cache started",
                registered.informer.kind()
            )));
        }
        informers.push(registered);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registered>> {
        self.informers.lock().unwrap_or_else(|p| p.into_inner())
    }
}
