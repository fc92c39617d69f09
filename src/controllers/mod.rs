//! Cache-driven reconcile controllers
//!
//! [`QueueController`] turns a [`Reconciler`] into a managed controller: it
//! subscribes to the shared informer for `K`, streams the reference of every
//! changed object into `kube::runtime`'s applier, and reconciles them from the
//! cache while this replica leads. References whose object is no longer cached
//! are handed to [`Reconciler::cleanup`].

pub mod credential;

pub use credential::CredentialSync;

use std::convert::Infallible;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use kube::core::DynamicObject;
use kube::runtime::controller::{self, applier, Action};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::manager::{Controller, Registration, Runnable};
use crate::metrics;

/// Requeue delay applied by the default error policy
pub const DEFAULT_ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Reconcile logic for one resource type
#[async_trait]
pub trait Reconciler<K>: Send + Sync
where
    K: Resource + Send + Sync,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    /// Drive the object toward its desired state
    async fn reconcile(&self, obj: Arc<K>) -> Result<Action>;

    /// The object is gone from the cache
    async fn cleanup(&self, _key: &ObjectRef<K>) -> Result<()> {
        Ok(())
    }

    /// Action taken when `reconcile` fails
    fn error_policy(&self, _obj: Arc<K>, _err: &Error) -> Action {
        Action::requeue(DEFAULT_ERROR_REQUEUE)
    }
}

type Filter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// A [`Controller`] driven by the shared cache
pub struct QueueController<K, R>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    name: String,
    api: Api<K>,
    reconciler: Arc<R>,
    concurrency: u16,
    filter: Option<Filter<K>>,
}

impl<K, R> QueueController<K, R>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Debug + Default + Unpin + Send + Sync,
    R: Reconciler<K> + 'static,
{
    pub fn new(name: impl Into<String>, api: Api<K>, reconciler: R) -> Self {
        Self {
            name: name.into(),
            api,
            reconciler: Arc::new(reconciler),
            concurrency: 1,
            filter: None,
        }
    }

    /// Maximum number of objects reconciled at once
    pub fn with_workers(mut self, workers: u16) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    /// Only reconcile objects for which `filter` returns true
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&K) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl<K, R> Controller for QueueController<K, R>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Debug + Default + Unpin + Send + Sync,
    R: Reconciler<K> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, registration: &mut Registration<'_>) -> Result<()> {
        registration.scheme().require::<K>()?;

        let informer = registration.cache().informer::<K>(self.api.clone())?;
        let (requests, queue) = mpsc::unbounded();

        let filter = self.filter.clone();
        informer.add_event_handler(move |event| {
            let obj = event.object();
            if filter.as_ref().map_or(true, |f| f(obj)) {
                // Fails only once the workers are gone
                let _ = requests.unbounded_send(ObjectRef::from_obj(obj.as_ref()));
            }
        })?;

        registration.add_runnable(Arc::new(Workers::new(
            self.name.clone(),
            queue,
            informer.store(),
            self.reconciler.clone(),
            self.concurrency,
        )));
        Ok(())
    }
}

/// Applier loop of one [`QueueController`]
pub struct Workers<K, R>
where
    K: Resource + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    name: String,
    queue: Mutex<Option<mpsc::UnboundedReceiver<ObjectRef<K>>>>,
    store: Store<K>,
    reconciler: Arc<R>,
    concurrency: u16,
}

impl<K, R> Workers<K, R>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Debug + Default + Unpin + Send + Sync,
    R: Reconciler<K> + 'static,
{
    pub fn new(
        name: impl Into<String>,
        queue: mpsc::UnboundedReceiver<ObjectRef<K>>,
        store: Store<K>,
        reconciler: Arc<R>,
        concurrency: u16,
    ) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(Some(queue)),
            store,
            reconciler,
            concurrency: concurrency.max(1),
        }
    }

    #[instrument(skip_all, fields(controller = %self.name, object = %obj.name_any()))]
    async fn reconcile(self: Arc<Self>, obj: Arc<K>) -> Result<Action> {
        let _timer = metrics::RECONCILE_DURATION
            .with_label_values(&[self.name.as_str()])
            .start_timer();
        metrics::RECONCILIATIONS
            .with_label_values(&[self.name.as_str()])
            .inc();

        self.reconciler.reconcile(obj).await
    }

    fn error_policy(&self, obj: Arc<K>, err: &Error) -> Action {
        warn!(
            controller = %self.name,
            object = %obj.name_any(),
            error = %err,
            "Reconciliation error"
        );
        metrics::RECONCILIATION_ERRORS
            .with_label_values(&[self.name.as_str()])
            .inc();
        self.reconciler.error_policy(obj, err)
    }

    /// Hand a reference whose object left the cache to the reconciler
    async fn cleanup(&self, gone: ObjectRef<DynamicObject>) {
        let mut key = ObjectRef::<K>::new(&gone.name);
        key.namespace = gone.namespace;

        match self.reconciler.cleanup(&key).await {
            Ok(()) => debug!(controller = %self.name, key = %key, "Cleaned up"),
            Err(e) => {
                warn!(controller = %self.name, key = %key, error = %e, "Cleanup failed");
                metrics::RECONCILIATION_ERRORS
                    .with_label_values(&[self.name.as_str()])
                    .inc();
            }
        }
    }
}

#[async_trait]
impl<K, R> Runnable for Workers<K, R>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Debug + Default + Unpin + Send + Sync,
    R: Reconciler<K> + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(self: Arc<Self>, term: CancellationToken) -> Result<()> {
        let queue = self
            .queue
            .lock()
            .map_err(|_| Error::Runnable {
                name: self.name.clone(),
                reason: "queue lock poisoned".to_string(),
            })?
            .take()
            .ok_or_else(|| Error::Runnable {
                name: self.name.clone(),
                reason: "already started".to_string(),
            })?;

        info!(controller = %self.name, concurrency = self.concurrency, "Starting controller");

        let stop = term.clone();
        let results = applier(
            |obj, workers: Arc<Self>| -> BoxFuture<'static, Result<Action>> {
                workers.reconcile(obj).boxed()
            },
            |obj, err: &Error, workers: Arc<Self>| workers.error_policy(obj, err),
            self.clone(),
            self.store.clone(),
            queue.map(Ok::<_, Infallible>),
            controller::Config::default().concurrency(self.concurrency),
        )
        .take_until(async move { stop.cancelled().await });
        futures::pin_mut!(results);

        while let Some(result) = results.next().await {
            match result {
                Ok((obj, action)) => {
                    debug!(controller = %self.name, object = %obj, action = ?action, "Reconciled");
                }
                Err(controller::Error::ObjectNotFound(gone)) => self.cleanup(gone).await,
                // Already reported by the error policy
                Err(controller::Error::ReconcilerFailed(..)) => {}
                Err(e) => warn!(controller = %self.name, error = %e, "Controller error"),
            }
        }

        info!(controller = %self.name, "Controller stopped");
        Ok(())
    }
}
