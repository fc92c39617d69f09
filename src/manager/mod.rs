//! Controller manager
//!
//! Collects controllers, runnables and admission webhooks during
//! registration, then runs them for the duration of one leadership term:
//!
//! 1. wait for every informer cache to finish its initial listing
//! 2. acquire leadership (or bypass it when election is disabled)
//! 3. bind the webhook listener, if any webhook was registered
//! 4. start every runnable with the term token
//! 5. block until shutdown, leadership loss, or a runnable failure
//! 6. give runnables the grace period to stop, then release the lease

pub mod scheme;
pub mod webhook;

pub use scheme::{DevOpsApis, Scheme, SchemeRegistrar};
pub use webhook::{AdmissionHandler, Handlers, WebhookServer};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CacheCoordinator;
use crate::clients::ClientSet;
use crate::error::{Error, Result};
use crate::leader::LeadershipCoordinator;
use crate::options::Options;
use crate::shutdown::Shutdown;

/// Settings the manager takes from [`Options`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    pub webhook_port: u16,
    pub webhook_cert_dir: PathBuf,
    pub graceful_shutdown_timeout: Duration,
}

impl From<&Options> for ManagerOptions {
    fn from(options: &Options) -> Self {
        Self {
            webhook_port: options.webhook_port,
            webhook_cert_dir: options.webhook_cert_dir.clone(),
            graceful_shutdown_timeout: options.graceful_shutdown_timeout,
        }
    }
}

/// A long-running task started once leadership is held.
///
/// Implementations must return promptly after `term` is cancelled.
#[async_trait]
pub trait Runnable: Send + Sync {
    fn name(&self) -> &str;

    async fn start(self: Arc<Self>, term: CancellationToken) -> Result<()>;
}

/// A reconcile plugin. Registration wires it into the cache and the manager.
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    fn register(&self, registration: &mut Registration<'_>) -> Result<()>;
}

/// What a controller may touch while registering
pub struct Registration<'a> {
    controller: &'a str,
    clients: &'a Arc<ClientSet>,
    cache: &'a CacheCoordinator,
    scheme: &'a Scheme,
    runnables: &'a mut Vec<Arc<dyn Runnable>>,
    webhooks: &'a mut Handlers,
}

impl<'a> Registration<'a> {
    pub fn clients(&self) -> &Arc<ClientSet> {
        self.clients
    }

    pub fn cache(&self) -> &CacheCoordinator {
        self.cache
    }

    pub fn scheme(&self) -> &Scheme {
        self.scheme
    }

    /// Run `runnable` while this replica leads
    pub fn add_runnable(&mut self, runnable: Arc<dyn Runnable>) {
        debug!(controller = self.controller, runnable = runnable.name(), "Added runnable");
        self.runnables.push(runnable);
    }

    /// Serve `handler` on `path` of the webhook listener
    pub fn add_webhook(
        &mut self,
        path: impl Into<String>,
        handler: Arc<dyn AdmissionHandler>,
    ) -> Result<()> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(Error::registration(format!(
                "webhook path '{}' must start with '/'",
                path
            )));
        }
        if self.webhooks.contains_key(&path) {
            return Err(Error::registration(format!(
                "webhook path '{}' registered twice",
                path
            )));
        }
        debug!(controller = self.controller, path = %path, "Added webhook");
        self.webhooks.insert(path, handler);
        Ok(())
    }
}

/// Owns registration and the leader-gated run loop
pub struct ControllerManager {
    options: ManagerOptions,
    clients: Arc<ClientSet>,
    cache: Arc<CacheCoordinator>,
    leadership: LeadershipCoordinator,
    scheme: Scheme,
    controllers: Vec<String>,
    runnables: Vec<Arc<dyn Runnable>>,
    webhooks: Handlers,
}

impl ControllerManager {
    pub fn new(
        options: ManagerOptions,
        clients: Arc<ClientSet>,
        cache: Arc<CacheCoordinator>,
        leadership: LeadershipCoordinator,
    ) -> Self {
        Self {
            options,
            clients,
            cache,
            leadership,
            scheme: Scheme::new(),
            controllers: Vec::new(),
            runnables: Vec::new(),
            webhooks: Handlers::new(),
        }
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn leadership(&self) -> &LeadershipCoordinator {
        &self.leadership
    }

    /// Names of registered controllers, in registration order
    pub fn controllers(&self) -> &[String] {
        &self.controllers
    }

    /// Number of registered runnables
    pub fn runnable_count(&self) -> usize {
        self.runnables.len()
    }

    pub fn add_to_scheme(&mut self, registrar: &dyn SchemeRegistrar) -> Result<()> {
        registrar.add_to_scheme(&mut self.scheme)
    }

    /// Register a controller. Must happen before the cache starts.
    pub fn register(&mut self, controller: &dyn Controller) -> Result<()> {
        let name = controller.name();
        if self.cache.is_started() {
            return Err(Error::registration(format!(
                "controller '{}' registered after the cache started",
                name
            )));
        }
        if self.controllers.iter().any(|c| c == name) {
            return Err(Error::registration(format!(
                "controller '{}' registered twice",
                name
            )));
        }

        let mut registration = Registration {
            controller: name,
            clients: &self.clients,
            cache: &self.cache,
            scheme: &self.scheme,
            runnables: &mut self.runnables,
            webhooks: &mut self.webhooks,
        };
        controller.register(&mut registration).map_err(|e| match e {
            Error::Registration(reason) => {
                Error::registration(format!("controller '{}': {}", name, reason))
            }
            other => other,
        })?;

        info!(controller = name, "Registered controller");
        self.controllers.push(name.to_string());
        Ok(())
    }

    /// Run until shutdown or a fatal condition.
    ///
    /// Returns `Ok(())` when stopped by `shutdown`, `Error::LeadershipLost`
    /// when the lease is lost, or the first runnable failure. Fatal outcomes
    /// raise `shutdown` so the rest of the process stops too.
    pub async fn run(self, shutdown: &Shutdown) -> Result<()> {
        if !self.cache.is_started() {
            return Err(Error::registration(
                "cache must be started before the manager runs",
            ));
        }

        info!("Waiting for informer caches to sync");
        if !self.cache.wait_for_sync(shutdown).await {
            return Ok(());
        }

        let Some(mut guard) = self.leadership.acquire(shutdown).await else {
            return Ok(());
        };
        let term = guard.term();

        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        if !self.webhooks.is_empty() {
            let server = match WebhookServer::bind(
                self.options.webhook_port,
                &self.options.webhook_cert_dir,
                self.webhooks,
            )
            .await
            {
                Ok(server) => server,
                Err(e) => {
                    guard.release().await;
                    shutdown.raise(e.to_string());
                    return Err(e);
                }
            };
            let term = term.clone();
            tasks.spawn(async move {
                server.serve(term).await;
                ("webhook".to_string(), Ok(()))
            });
        }

        for runnable in self.runnables {
            let name = runnable.name().to_string();
            let term = term.clone();
            tasks.spawn(async move {
                let result = runnable.start(term).await;
                (name, result)
            });
        }
        info!(
            controllers = self.controllers.len(),
            tasks = tasks.len(),
            "Controllers started"
        );

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                reason = guard.lost() => break Err(Error::LeadershipLost(reason)),
                Some(joined) = tasks.join_next() => match joined {
                    Ok((name, Ok(()))) => debug!(runnable = %name, "Runnable finished"),
                    Ok((name, Err(e))) => {
                        break Err(Error::Runnable { name, reason: e.to_string() })
                    }
                    Err(e) => {
                        break Err(Error::Runnable {
                            name: "unknown".to_string(),
                            reason: e.to_string(),
                        })
                    }
                },
            }
        };

        term.cancel();
        if let Err(e) = &outcome {
            error!(error = %e, stage = e.stage(), "Controller manager stopping");
            shutdown.raise(e.to_string());
        }

        let grace = self.options.graceful_shutdown_timeout;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((name, Err(e))) => warn!(runnable = %name, error = %e, "Runnable failed while stopping"),
                    Ok((name, Ok(()))) => debug!(runnable = %name, "Runnable stopped"),
                    Err(e) => warn!(error = %e, "Runnable panicked while stopping"),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace_secs = grace.as_secs(),
                "Grace period elapsed, aborting runnables"
            );
            tasks.abort_all();
        }

        match outcome {
            Err(Error::LeadershipLost(reason)) => {
                drop(guard);
                Err(Error::LeadershipLost(reason))
            }
            outcome => {
                guard.release().await;
                info!("Controller manager stopped");
                outcome
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::StubInformer;
    use crate::leader::InMemoryLease;
    use crate::options::LeaderElectionPolicy;
    use kube::{Client, Config};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn clients() -> Arc<ClientSet> {
        let client = Client::try_from(Config::new("http://127.0.0.1:9".parse().unwrap())).unwrap();
        Arc::new(ClientSet::new(client, None, None))
    }

    fn options() -> ManagerOptions {
        ManagerOptions {
            webhook_port: 0,
            webhook_cert_dir: PathBuf::from("/nonexistent"),
            graceful_shutdown_timeout: Duration::from_secs(5),
        }
    }

    fn manager(leadership: LeadershipCoordinator) -> (ControllerManager, Arc<CacheCoordinator>) {
        let cache = Arc::new(CacheCoordinator::new());
        (
            ControllerManager::new(options(), clients(), cache.clone(), leadership),
            cache,
        )
    }

    /// Runs until its term is cancelled
    struct Worker {
        running: Arc<AtomicUsize>,
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Runnable for Worker {
        fn name(&self) -> &str {
            "worker"
        }

        async fn start(self: Arc<Self>, term: CancellationToken) -> Result<()> {
            self.running.fetch_add(1, Ordering::SeqCst);
            term.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Runnable for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn start(self: Arc<Self>, _term: CancellationToken) -> Result<()> {
            Err(Error::config("boom"))
        }
    }

    struct Plugin {
        name: &'static str,
        runnable: Arc<dyn Runnable>,
        webhook: bool,
    }

    impl Controller for Plugin {
        fn name(&self) -> &str {
            self.name
        }

        fn register(&self, registration: &mut Registration<'_>) -> Result<()> {
            registration
                .cache()
                .register(StubInformer::new(self.name, false))?;
            registration.add_runnable(self.runnable.clone());
            if self.webhook {
                struct Allow;
                #[async_trait]
                impl AdmissionHandler for Allow {
                    async fn handle(
                        &self,
                        request: &kube::core::admission::AdmissionRequest<kube::core::DynamicObject>,
                    ) -> kube::core::admission::AdmissionResponse {
                        kube::core::admission::AdmissionResponse::from(request)
                    }
                }
                registration.add_webhook("/validate", Arc::new(Allow))?;
            }
            Ok(())
        }
    }

    fn worker() -> (Arc<Worker>, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let running = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Worker {
                running: running.clone(),
                stopped: stopped.clone(),
            }),
            running,
            stopped,
        )
    }

    #[tokio::test]
    async fn test_duplicate_controller_is_rejected() {
        let (mut manager, _) = manager(LeadershipCoordinator::bypass());
        let (w, _, _) = worker();
        let plugin = Plugin { name: "dup", runnable: w, webhook: false };

        manager.register(&plugin).unwrap();
        let err = manager.register(&plugin).unwrap_err();

        assert!(matches!(err, Error::Registration(_)));
        assert_eq!(manager.controllers(), ["dup"]);
    }

    #[tokio::test]
    async fn test_registration_after_cache_start_is_rejected() {
        let (mut manager, cache) = manager(LeadershipCoordinator::bypass());
        let shutdown = Shutdown::new();
        cache.start(&shutdown).unwrap();
        let (w, _, _) = worker();

        let err = manager
            .register(&Plugin { name: "late", runnable: w, webhook: false })
            .unwrap_err();

        assert_eq!(err.exit_code(), 5);
        shutdown.raise("test");
    }

    #[tokio::test]
    async fn test_run_requires_started_cache() {
        let (manager, _) = manager(LeadershipCoordinator::bypass());
        let err = manager.run(&Shutdown::new()).await.unwrap_err();
        assert!(matches!(err, Error::Registration(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_runnables_and_returns_ok() {
        let (mut manager, cache) = manager(LeadershipCoordinator::bypass());
        let (w, running, stopped) = worker();
        manager
            .register(&Plugin { name: "a", runnable: w, webhook: false })
            .unwrap();
        let shutdown = Shutdown::new();
        cache.start(&shutdown).unwrap();

        let raiser = shutdown.clone();
        let watcher = running.clone();
        tokio::spawn(async move {
            while watcher.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            raiser.raise("SIGTERM");
        });

        manager.run(&shutdown).await.unwrap();

        assert_eq!(running.load(Ordering::SeqCst), 1);
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_runnable_failure_raises_shutdown() {
        let (mut manager, cache) = manager(LeadershipCoordinator::bypass());
        manager
            .register(&Plugin { name: "bad", runnable: Arc::new(Failing), webhook: false })
            .unwrap();
        let shutdown = Shutdown::new();
        cache.start(&shutdown).unwrap();

        let err = manager.run(&shutdown).await.unwrap_err();

        assert!(matches!(err, Error::Runnable { ref name, .. } if name == "failing"));
        assert!(shutdown.is_raised());
    }

    #[tokio::test]
    async fn test_webhook_bind_failure_is_fatal() {
        let (mut manager, cache) = manager(LeadershipCoordinator::bypass());
        let (w, running, _) = worker();
        manager
            .register(&Plugin { name: "hooked", runnable: w, webhook: true })
            .unwrap();
        let shutdown = Shutdown::new();
        cache.start(&shutdown).unwrap();

        let err = manager.run(&shutdown).await.unwrap_err();

        assert!(matches!(err, Error::Webhook(_)));
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leadership_loss_stops_runnables() {
        let policy = LeaderElectionPolicy::default();
        let lease = InMemoryLease::new(policy.lease_duration);
        let leadership = LeadershipCoordinator::elected(Arc::new(lease.lock("a")), policy);
        let (mut manager, cache) = manager(leadership);
        let (w, running, stopped) = worker();
        manager
            .register(&Plugin { name: "a", runnable: w, webhook: false })
            .unwrap();
        let shutdown = Shutdown::new();
        cache.start(&shutdown).unwrap();

        let thief = lease.clone();
        let watcher = running.clone();
        tokio::spawn(async move {
            while watcher.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
            thief.force_holder("b");
        });

        let err = manager.run(&shutdown).await.unwrap_err();

        assert!(matches!(err, Error::LeadershipLost(_)));
        assert_eq!(err.exit_code(), 7);
        assert!(stopped.load(Ordering::SeqCst));
        assert!(shutdown.is_raised());
        assert_eq!(lease.holder().as_deref(), Some("b"));
    }
}
