//! DevOps controller manager
//!
//! Main entry point. Merges configuration, builds clients, registers the
//! controllers, and runs them under leader election until shutdown.

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use devops_controller_manager::{
    app::App,
    cli::{self, Cli, Command, RunArgs},
    options::{self, Defaults, DiskConfig},
    shutdown::{self, Shutdown},
    Error,
};

#[tokio::main]
async fn main() {
    match Cli::parse().into_command() {
        Command::Version => println!("{}", cli::version()),
        Command::Run(args) => {
            init_tracing();

            let code = match run(args).await {
                Ok(()) => {
                    info!("DevOps controller manager stopped");
                    0
                }
                Err(e) => {
                    let known = e.downcast_ref::<Error>();
                    error!(
                        error = %format!("{:#}", e),
                        stage = known.map_or("startup", Error::stage),
                        "DevOps controller manager failed"
                    );
                    known.map_or(1, Error::exit_code)
                }
            };
            std::process::exit(code);
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting DevOps controller manager"
    );

    let (path, disk) = DiskConfig::discover(args.config.as_deref())?;
    let options = options::merge(&Defaults::default(), &disk, &args.overrides())?;
    info!(
        config = %path.display(),
        leader_elect = options.leader_election.enabled(),
        ci = options.ci.is_some(),
        object_store = options.object_store.is_some(),
        "Configuration loaded"
    );

    let shutdown = Shutdown::new();
    shutdown::listen_for_os_signals(shutdown.clone())
        .context("failed to install signal handlers")?;

    let app = App::build(options).await?;
    app.run(&shutdown).await?;
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}
