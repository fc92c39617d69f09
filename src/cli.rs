//! Command line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::options::{
    CliOverrides, LeaderElectionPolicy, DEFAULT_LEADER_ELECTION_ID,
    DEFAULT_LEADER_ELECTION_NAMESPACE, DEFAULT_METRICS_PORT, DEFAULT_WEBHOOK_CERT_DIR,
};

#[derive(Debug, Parser)]
#[command(name = "devops-controller-manager")]
#[command(about = "DevOps controller manager for KubeSphere")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Flags for running without a subcommand
    #[command(flatten)]
    pub run: RunArgs,
}

impl Cli {
    /// The command to execute. Running the manager is the default.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Run(self.run))
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the controller manager
    Run(RunArgs),

    /// Print version information and exit
    Version,
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Configuration file; defaults to ./kubesphere.yaml or /etc/kubesphere/kubesphere.yaml
    #[arg(long, env = "KUBESPHERE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Compete for a lease before running controllers. Required with more than one replica.
    #[arg(long, default_value_t = false)]
    pub leader_elect: bool,

    /// Seconds a follower waits after the last renewal before taking over
    #[arg(long, default_value_t = 30)]
    pub leader_elect_lease_duration: u64,

    /// Seconds the leader keeps retrying a renewal before giving up
    #[arg(long, default_value_t = 15)]
    pub leader_elect_renew_deadline: u64,

    /// Seconds between acquire and renew attempts
    #[arg(long, default_value_t = 5)]
    pub leader_elect_retry_period: u64,

    /// Namespace of the leader election lease
    #[arg(long, default_value = DEFAULT_LEADER_ELECTION_NAMESPACE)]
    pub leader_elect_namespace: String,

    /// Name of the leader election lease
    #[arg(long, default_value = DEFAULT_LEADER_ELECTION_ID)]
    pub leader_elect_id: String,

    /// Directory holding the webhook serving certificate (tls.crt, tls.key)
    #[arg(long, default_value = DEFAULT_WEBHOOK_CERT_DIR)]
    pub webhook_cert_dir: PathBuf,

    /// Port of the metrics and health endpoint; 0 disables it
    #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,

    /// Seconds running controllers get to stop after shutdown starts
    #[arg(long, default_value_t = 30)]
    pub graceful_shutdown_timeout: u64,
}

impl RunArgs {
    /// The configuration layer contributed by the command line
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            leader_elect: self.leader_elect,
            leader_election: LeaderElectionPolicy {
                lease_duration: Duration::from_secs(self.leader_elect_lease_duration),
                renew_deadline: Duration::from_secs(self.leader_elect_renew_deadline),
                retry_period: Duration::from_secs(self.leader_elect_retry_period),
                namespace: self.leader_elect_namespace.clone(),
                election_id: self.leader_elect_id.clone(),
            },
            webhook_cert_dir: self.webhook_cert_dir.clone(),
            metrics_port: self.metrics_port,
            graceful_shutdown_timeout: Duration::from_secs(self.graceful_shutdown_timeout),
        }
    }
}

/// Text printed by the `version` command
pub fn version() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let argv = ["devops-controller-manager"].iter().chain(args);
        match Cli::try_parse_from(argv).unwrap().into_command() {
            Command::Run(args) => args,
            Command::Version => panic!("expected run"),
        }
    }

    #[test]
    fn test_defaults_match_cli_overrides_default() {
        assert_eq!(run_args(&[]).overrides(), CliOverrides::default());
    }

    #[test]
    fn test_leader_election_flags() {
        let overrides = run_args(&[
            "--leader-elect",
            "--leader-elect-lease-duration",
            "60",
            "--leader-elect-namespace",
            "ops",
        ])
        .overrides();

        assert!(overrides.leader_elect);
        assert_eq!(overrides.leader_election.lease_duration, Duration::from_secs(60));
        assert_eq!(overrides.leader_election.namespace, "ops");
        assert_eq!(overrides.leader_election.election_id, DEFAULT_LEADER_ELECTION_ID);
    }

    #[test]
    fn test_run_subcommand_takes_the_same_flags() {
        let explicit = run_args(&["run", "--leader-elect", "--metrics-port", "0"]);
        let implicit = run_args(&["--leader-elect", "--metrics-port", "0"]);

        assert_eq!(explicit.overrides(), implicit.overrides());
        assert!(implicit.leader_elect);
        assert_eq!(implicit.metrics_port, 0);
    }

    #[test]
    fn test_version_command() {
        let cli = Cli::try_parse_from(["devops-controller-manager", "version"]).unwrap();
        assert!(matches!(cli.into_command(), Command::Version));
        assert!(version().starts_with("devops-controller-manager "));
    }

    #[test]
    fn test_flags_do_not_mix_with_subcommands() {
        assert!(Cli::try_parse_from(["devops-controller-manager", "--leader-elect", "version"]).is_err());
    }
}
