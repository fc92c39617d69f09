//! Watch-backed informer for one resource type

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::Informer;
use crate::error::{Error, Result};
use crate::shutdown::Shutdown;

/// A change observed by an informer
#[derive(Debug, Clone)]
pub enum CacheEvent<K> {
    /// Object created, updated, or seen during the initial listing
    Applied(Arc<K>),
    /// Object deleted
    Deleted(Arc<K>),
}

impl<K> CacheEvent<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            CacheEvent::Applied(obj) | CacheEvent::Deleted(obj) => obj,
        }
    }
}

/// Callback invoked for every cache event, on the watch task
pub type EventHandler<K> = Arc<dyn Fn(&CacheEvent<K>) + Send + Sync>;

/// Shared informer: a reflector-backed [`Store`] plus event handlers
pub struct KubeInformer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    kind: String,
    api: Api<K>,
    config: watcher::Config,
    store: Store<K>,
    writer: Mutex<Option<Writer<K>>>,
    handlers: Mutex<Vec<EventHandler<K>>>,
    sealed: AtomicBool,
    synced: tokio::sync::watch::Sender<bool>,
}

impl<K> KubeInformer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(api: Api<K>, config: watcher::Config) -> Self {
        let dt = K::DynamicType::default();
        let (store, writer) = reflector::store();
        let (synced, _) = tokio::sync::watch::channel(false);

        Self {
            kind: format!("{}/{}", K::api_version(&dt), K::kind(&dt)),
            api,
            config,
            store,
            writer: Mutex::new(Some(writer)),
            handlers: Mutex::new(Vec::new()),
            sealed: AtomicBool::new(false),
            synced,
        }
    }

    /// Read-only view of the cached objects
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    /// Add a handler. Fails once the cache has been started.
    pub fn add_event_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&CacheEvent<K>) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        if self.sealed.load(Ordering::SeqCst) {
            return Err(Error::registration(format!(
                "cannot add an event handler to the {} informer after the cache started",
                self.kind
            )));
        }
        handlers.push(Arc::new(handler));
        Ok(())
    }

    fn handlers(&self) -> Vec<EventHandler<K>> {
        self.handlers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn dispatch(&self, event: watcher::Event<K>) {
        let event = match event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                CacheEvent::Applied(Arc::new(obj))
            }
            watcher::Event::Delete(obj) => CacheEvent::Deleted(Arc::new(obj)),
            watcher::Event::Init => {
                debug!(kind = %self.kind, "Initial listing started");
                return;
            }
            watcher::Event::InitDone => {
                if !self.synced.send_replace(true) {
                    info!(kind = %self.kind, objects = self.store.state().len(), "Informer synced");
                }
                return;
            }
        };

        debug!(kind = %self.kind, name = %event.object().name_any(), "Cache event");
        for handler in self.handlers() {
            handler(&event);
        }
    }
}

#[async_trait]
impl<K> Informer for KubeInformer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn seal(&self) {
        let _handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        self.sealed.store(true, Ordering::SeqCst);
    }

    async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let writer = self.writer.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(writer) = writer else {
            warn!(kind = %self.kind, "Informer already running");
            return;
        };

        let stream = reflector::reflector(writer, watcher(self.api.clone(), self.config.clone()))
            .default_backoff();
        futures::pin_mut!(stream);

        debug!(kind = %self.kind, "Watch started");
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.next() => event,
            };

            match event {
                Some(Ok(event)) => self.dispatch(event),
                Some(Err(e)) => warn!(kind = %self.kind, error = %e, "Watch failed, backing off"),
                None => break,
            }
        }
        debug!(kind = %self.kind, "Watch stopped");
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        if rx.wait_for(|synced| *synced).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
