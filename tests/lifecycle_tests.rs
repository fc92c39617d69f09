//! Integration tests for startup ordering, leadership and shutdown
//!
//! These tests run the controller manager against an unreachable API server:
//! informers, locks and runnables are replaced with in-process versions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::{Client, Config};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use devops_controller_manager::app::{self, App};
use devops_controller_manager::cache::{CacheCoordinator, Informer};
use devops_controller_manager::clients::ClientSet;
use devops_controller_manager::controllers::CredentialSync;
use devops_controller_manager::leader::{InMemoryLease, LeadershipCoordinator, LeadershipState};
use devops_controller_manager::manager::{
    Controller, ControllerManager, ManagerOptions, Registration, Runnable,
};
use devops_controller_manager::options::{
    self, CliOverrides, Defaults, DiskConfig, LeaderElectionPolicy, Options,
};
use devops_controller_manager::shutdown::Shutdown;
use devops_controller_manager::Result;

// ============================================================================
// Test Helpers
// ============================================================================

type Journal = Arc<Mutex<Vec<String>>>;

fn record(journal: &Journal, entry: impl Into<String>) {
    journal.lock().unwrap().push(entry.into());
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

fn clients() -> Arc<ClientSet> {
    let config = Config::new("http://127.0.0.1:9".parse().unwrap());
    Arc::new(ClientSet::new(Client::try_from(config).unwrap(), None, None))
}

fn options(leader_elect: bool) -> Options {
    let cli = CliOverrides {
        leader_elect,
        metrics_port: 0,
        graceful_shutdown_timeout: Duration::from_secs(3),
        ..Default::default()
    };
    options::merge(&Defaults::default(), &DiskConfig::default(), &cli).unwrap()
}

/// Informer that journals when the cache starts it and syncs at once
struct JournalInformer {
    kind: String,
    journal: Journal,
    synced: watch::Sender<bool>,
}

impl JournalInformer {
    fn new(kind: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.to_string(),
            journal: journal.clone(),
            synced: watch::channel(false).0,
        })
    }
}

#[async_trait]
impl Informer for JournalInformer {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn seal(&self) {
        record(&self.journal, format!("cache-start:{}", self.kind));
    }

    async fn run(self: Arc<Self>, shutdown: Shutdown) {
        self.synced.send_replace(true);
        shutdown.cancelled().await;
    }

    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    async fn wait_synced(&self) {
        let _ = self.synced.subscribe().wait_for(|synced| *synced).await;
    }
}

/// Runnable that journals start and stop and waits for its term
struct JournalRunnable {
    name: String,
    journal: Journal,
    started: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Runnable for JournalRunnable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(self: Arc<Self>, term: CancellationToken) -> Result<()> {
        record(&self.journal, format!("run:{}", self.name));
        let _ = self.started.send(self.name.clone());
        term.cancelled().await;
        record(&self.journal, format!("stop:{}", self.name));
        Ok(())
    }
}

/// Runnable that never looks at its term
struct Stubborn {
    finished: Arc<AtomicBool>,
}

#[async_trait]
impl Runnable for Stubborn {
    fn name(&self) -> &str {
        "stubborn"
    }

    async fn start(self: Arc<Self>, _term: CancellationToken) -> Result<()> {
        sleep(Duration::from_secs(3600)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct JournalController {
    name: &'static str,
    journal: Journal,
    started: mpsc::UnboundedSender<String>,
}

impl Controller for JournalController {
    fn name(&self) -> &str {
        self.name
    }

    fn register(&self, registration: &mut Registration<'_>) -> Result<()> {
        assert!(!registration.cache().is_started());
        record(&self.journal, format!("register:{}", self.name));
        registration
            .cache()
            .register(JournalInformer::new(self.name, &self.journal))?;
        registration.add_runnable(Arc::new(JournalRunnable {
            name: self.name.to_string(),
            journal: self.journal.clone(),
            started: self.started.clone(),
        }));
        Ok(())
    }
}

// ============================================================================
// Startup Ordering Tests
// ============================================================================

#[tokio::test]
async fn test_cache_starts_after_last_registration_and_controllers_after_sync() {
    let journal: Journal = Arc::default();
    let (started, mut running) = mpsc::unbounded_channel();
    let controllers: Vec<Box<dyn Controller>> = ["pipeline", "s2ibinary"]
        .into_iter()
        .map(|name| {
            Box::new(JournalController {
                name,
                journal: journal.clone(),
                started: started.clone(),
            }) as Box<dyn Controller>
        })
        .collect();

    let app = App::new(options(false), clients(), LeadershipCoordinator::bypass())
        .with_controllers(controllers);
    let shutdown = Shutdown::new();
    let raiser = shutdown.clone();
    tokio::spawn(async move {
        running.recv().await;
        running.recv().await;
        raiser.raise("test complete");
    });

    app.run(&shutdown).await.unwrap();

    let log = entries(&journal);
    let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
    let last_register = position("register:s2ibinary");
    assert!(position("register:pipeline") < last_register);
    assert!(last_register < position("cache-start:pipeline"));
    assert!(last_register < position("cache-start:s2ibinary"));
    assert!(position("cache-start:s2ibinary") < position("run:pipeline"));
    assert!(position("cache-start:s2ibinary") < position("run:s2ibinary"));
    assert!(log.contains(&"stop:pipeline".to_string()));
    assert!(log.contains(&"stop:s2ibinary".to_string()));
}

#[tokio::test]
async fn test_credential_sync_registers_nothing_without_ci() {
    let cache = Arc::new(CacheCoordinator::new());
    let mut manager = ControllerManager::new(
        ManagerOptions::from(&options(false)),
        clients(),
        cache.clone(),
        LeadershipCoordinator::bypass(),
    );

    manager.register(&CredentialSync).unwrap();

    assert_eq!(manager.runnable_count(), 0);
    assert!(cache.kinds().is_empty());
}

#[tokio::test]
async fn test_registration_failure_stops_startup_before_cache() {
    struct Broken;
    impl Controller for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn register(&self, _registration: &mut Registration<'_>) -> Result<()> {
            Err(devops_controller_manager::Error::registration("missing CRD"))
        }
    }

    let cache = Arc::new(CacheCoordinator::new());
    let app = App::new(options(false), clients(), LeadershipCoordinator::bypass())
        .with_cache(cache.clone())
        .with_controllers(vec![Box::new(Broken)]);
    let shutdown = Shutdown::new();

    let err = app.run(&shutdown).await.unwrap_err();

    assert_eq!(err.exit_code(), 5);
    assert!(err.to_string().contains("broken"));
    assert!(!cache.is_started());
    assert!(shutdown.is_raised());
}

// ============================================================================
// Shutdown Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_raised_twice_stops_once() {
    let journal: Journal = Arc::default();
    let (started, mut running) = mpsc::unbounded_channel();
    let app = App::new(options(false), clients(), LeadershipCoordinator::bypass())
        .with_controllers(vec![Box::new(JournalController {
            name: "pipeline",
            journal: journal.clone(),
            started,
        })]);
    let shutdown = Shutdown::new();
    let raiser = shutdown.clone();
    tokio::spawn(async move {
        running.recv().await;
        raiser.raise("SIGTERM");
        raiser.raise("SIGINT");
    });

    app.run(&shutdown).await.unwrap();

    assert_eq!(shutdown.reason(), Some("SIGTERM"));
    let stops = entries(&journal)
        .into_iter()
        .filter(|e| e.starts_with("stop:"))
        .count();
    assert_eq!(stops, 1);
}

#[tokio::test]
async fn test_metrics_bind_failure_stops_the_manager() {
    let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let cli = CliOverrides {
        metrics_port: taken.local_addr().unwrap().port(),
        graceful_shutdown_timeout: Duration::from_secs(3),
        ..Default::default()
    };
    let options = options::merge(&Defaults::default(), &DiskConfig::default(), &cli).unwrap();
    let journal: Journal = Arc::default();
    let (started, _running) = mpsc::unbounded_channel();
    let app = App::new(options, clients(), LeadershipCoordinator::bypass()).with_controllers(
        vec![Box::new(JournalController {
            name: "pipeline",
            journal: journal.clone(),
            started,
        })],
    );
    let shutdown = Shutdown::new();

    let err = tokio::time::timeout(Duration::from_secs(10), app.run(&shutdown))
        .await
        .expect("manager kept running without metrics")
        .unwrap_err();

    assert_eq!(err.stage(), "run");
    assert!(err.to_string().contains("metrics"));
    assert!(shutdown.reason().unwrap().starts_with("metrics server failed"));
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_bounds_shutdown() {
    struct WithStubborn(Arc<AtomicBool>);
    impl Controller for WithStubborn {
        fn name(&self) -> &str {
            "stubborn"
        }
        fn register(&self, registration: &mut Registration<'_>) -> Result<()> {
            registration.add_runnable(Arc::new(Stubborn {
                finished: self.0.clone(),
            }));
            Ok(())
        }
    }

    let finished = Arc::new(AtomicBool::new(false));
    let options = options(false);
    let grace = options.graceful_shutdown_timeout;
    let app = App::new(options, clients(), LeadershipCoordinator::bypass())
        .with_controllers(vec![Box::new(WithStubborn(finished.clone()))]);
    let shutdown = Shutdown::new();
    let raiser = shutdown.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(1)).await;
        raiser.raise("SIGTERM");
    });

    let begin = Instant::now();
    app.run(&shutdown).await.unwrap();
    let elapsed = begin.elapsed();

    assert!(elapsed >= Duration::from_secs(1) + grace);
    assert!(elapsed < Duration::from_secs(2) + grace);
    assert!(!finished.load(Ordering::SeqCst));
}

// ============================================================================
// Leadership Tests
// ============================================================================

#[tokio::test]
async fn test_disabled_election_bypasses_the_lock() {
    let clients = clients();

    let coordinator = app::leadership(&options(false), &clients);

    assert!(!coordinator.is_elected());
    assert_eq!(coordinator.state(), LeadershipState::Leading);

    let elected = app::leadership(&options(true), &clients);
    assert!(elected.is_elected());
    assert_eq!(elected.state(), LeadershipState::Unheld);
}

#[tokio::test(start_paused = true)]
async fn test_two_replicas_never_lead_at_once() {
    let policy = LeaderElectionPolicy::default();
    let lease = InMemoryLease::new(policy.lease_duration);
    let a = LeadershipCoordinator::elected(Arc::new(lease.lock("a")), policy.clone());
    let b = LeadershipCoordinator::elected(Arc::new(lease.lock("b")), policy.clone());
    let b_state = b.subscribe();
    let shutdown = Shutdown::new();

    let guard_a = a.acquire(&shutdown).await.unwrap();
    let follower_shutdown = shutdown.clone();
    let follower = tokio::spawn(async move {
        let guard = b.acquire(&follower_shutdown).await;
        (b, guard)
    });

    for _ in 0..24 {
        sleep(policy.retry_period).await;
        let both = a.state() == LeadershipState::Leading
            && *b_state.borrow() == LeadershipState::Leading;
        assert!(!both, "two replicas leading at once");
        assert_eq!(lease.holder().as_deref(), Some("a"));
    }
    assert_eq!(*b_state.borrow(), LeadershipState::Acquiring);

    guard_a.release().await;
    let (b, guard_b) = follower.await.unwrap();

    assert!(guard_b.is_some());
    assert_eq!(a.state(), LeadershipState::Lost);
    assert_eq!(b.state(), LeadershipState::Leading);
    assert_eq!(lease.holder().as_deref(), Some("b"));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_lock_loses_leadership_within_renew_deadline() {
    let policy = LeaderElectionPolicy::default();
    let lease = InMemoryLease::new(policy.lease_duration);
    let coordinator = LeadershipCoordinator::elected(Arc::new(lease.lock("a")), policy.clone());
    let mut guard = coordinator.acquire(&Shutdown::new()).await.unwrap();
    let term = guard.term();

    lease.set_reachable(false);
    let failed_at = Instant::now();
    let reason = guard.lost().await;

    assert!(Instant::now() - failed_at <= policy.renew_deadline);
    assert!(reason.contains("deadline"));
    assert!(term.is_cancelled());
    assert_eq!(coordinator.state(), LeadershipState::Lost);
}
