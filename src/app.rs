//! Startup sequencing
//!
//! Order matters and is fixed:
//!
//! 1. build the client set (cluster client, then optional clients)
//! 2. create the leadership coordinator and the (unstarted) cache
//! 3. register types into the scheme
//! 4. register every controller
//! 5. start the cache
//! 6. run the manager until shutdown
//!
//! The cache is started only after the last controller registered, so
//! every event handler sees the initial listing.

use std::sync::Arc;

use tracing::{error, info};

use crate::cache::CacheCoordinator;
use crate::clients::ClientSet;
use crate::controllers::CredentialSync;
use crate::error::{Error, Result};
use crate::leader::{self, LeadershipCoordinator, LeaseLock};
use crate::manager::{Controller, ControllerManager, DevOpsApis, ManagerOptions, SchemeRegistrar};
use crate::metrics;
use crate::options::Options;
use crate::shutdown::Shutdown;

/// Controllers bundled with the controller manager
pub fn default_controllers() -> Vec<Box<dyn Controller>> {
    vec![Box::new(CredentialSync)]
}

/// Leadership coordinator for the configured election mode
pub fn leadership(options: &Options, clients: &ClientSet) -> LeadershipCoordinator {
    match options.leader_election.policy() {
        Some(policy) => {
            let identity = leader::holder_identity();
            let lock = LeaseLock::new(clients.kubernetes().clone(), policy, identity);
            LeadershipCoordinator::elected(Arc::new(lock), policy.clone())
        }
        None => LeadershipCoordinator::bypass(),
    }
}

/// A fully wired controller manager process, ready to run
pub struct App {
    options: Options,
    clients: Arc<ClientSet>,
    leadership: LeadershipCoordinator,
    cache: Arc<CacheCoordinator>,
    registrars: Vec<Box<dyn SchemeRegistrar>>,
    controllers: Vec<Box<dyn Controller>>,
}

impl App {
    /// Build every client from `options` and wire the bundled controllers
    pub async fn build(options: Options) -> Result<Self> {
        let clients = ClientSet::build(&options).await?;
        let leadership = leadership(&options, &clients);
        Ok(Self::new(options, Arc::new(clients), leadership))
    }

    /// Wire already built pieces with the bundled scheme and controllers
    pub fn new(options: Options, clients: Arc<ClientSet>, leadership: LeadershipCoordinator) -> Self {
        Self {
            options,
            clients,
            leadership,
            cache: Arc::new(CacheCoordinator::new()),
            registrars: vec![Box::new(DevOpsApis)],
            controllers: default_controllers(),
        }
    }

    /// Replace the cache coordinator
    pub fn with_cache(mut self, cache: Arc<CacheCoordinator>) -> Self {
        self.cache = cache;
        self
    }

    /// Replace the registered controllers
    pub fn with_controllers(mut self, controllers: Vec<Box<dyn Controller>>) -> Self {
        self.controllers = controllers;
        self
    }

    /// Add a scheme registrar
    pub fn with_registrar(mut self, registrar: Box<dyn SchemeRegistrar>) -> Self {
        self.registrars.push(registrar);
        self
    }

    /// Register, start the cache, and run until `shutdown` or a fatal error.
    ///
    /// `shutdown` is raised before returning, so every task spawned on its
    /// behalf stops.
    pub async fn run(self, shutdown: &Shutdown) -> Result<()> {
        let result = self.run_inner(shutdown).await;
        shutdown.raise(match &result {
            Ok(()) => "controller manager stopped".to_string(),
            Err(e) => e.to_string(),
        });
        result
    }

    async fn run_inner(self, shutdown: &Shutdown) -> Result<()> {
        let mut manager = ControllerManager::new(
            ManagerOptions::from(&self.options),
            self.clients.clone(),
            self.cache.clone(),
            self.leadership,
        );

        for registrar in &self.registrars {
            manager.add_to_scheme(registrar.as_ref())?;
        }
        info!(types = manager.scheme().len(), "Scheme ready");

        for controller in &self.controllers {
            manager.register(controller.as_ref())?;
        }
        info!(controllers = ?manager.controllers(), "Controllers registered");

        info!("Starting cache resource from apiserver");
        self.cache.start(shutdown)?;

        // A metrics server that cannot serve stops the whole process
        let metrics_task = (self.options.metrics_port != 0).then(|| {
            let port = self.options.metrics_port;
            let metrics_shutdown = shutdown.clone();
            tokio::spawn(async move {
                let result = metrics::serve(port, metrics_shutdown.clone()).await;
                if let Err(e) = &result {
                    error!(error = %e, "Metrics server failed");
                    metrics_shutdown.raise(format!("metrics server failed: {}", e));
                }
                result
            })
        });

        info!("Starting the controllers");
        let result = manager.run(shutdown).await;

        let Some(metrics_task) = metrics_task else {
            return result;
        };
        shutdown.raise("controller manager stopped");
        match metrics_task.await {
            Ok(Err(e)) => result.and(Err(Error::Runnable {
                name: "metrics".to_string(),
                reason: e.to_string(),
            })),
            _ => result,
        }
    }
}
