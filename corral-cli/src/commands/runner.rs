//! Runner command handlers
//!
//! Handles `start`, `status` and `stop` by building a fleet controller and
//! printing what it reports.

use anyhow::Result;
use clap::Args;
use colored::*;
use corral_core::domain::worker::WorkerInstance;
use corral_fleet::{
    Command, FleetController, HostEnv, OciOptions, RunOutcome, RunnerConfig, ShutdownHooks,
    StatusReport, StopReport,
};
use std::path::PathBuf;

use super::ImageArgs;
use crate::config::Config;

/// Arguments of `corral start`
#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    /// Base name for the runner containers (default: host name)
    #[arg(long)]
    pub name: Option<String>,

    /// Runner group, optionally `group@organization`
    #[arg(long)]
    pub group: Option<String>,

    /// Comma separated organizations to take jobs from
    #[arg(long)]
    pub orgs: Option<String>,

    /// Comma separated `org/app` names to take jobs from
    #[arg(long)]
    pub apps: Option<String>,

    /// Comma separated `org/app/workflow` names to take jobs from
    #[arg(long)]
    pub workflows: Option<String>,

    /// Take any job the token owner can see
    #[arg(long)]
    pub all: bool,

    /// Runner bearer token
    #[arg(long, env = "WERCKER_RUNNER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Number of runners to start
    #[arg(long, default_value_t = 1)]
    pub runners: usize,

    /// Seconds between job polls inside each runner
    #[arg(long, default_value_t = 5)]
    pub poll_frequency: u64,

    /// Local directory for pipeline output
    #[arg(long, env = "WERCKER_RUNNER_STOREPATH")]
    pub storepath: Option<PathBuf>,

    /// Directory for per-runner log files (default: console)
    #[arg(long)]
    pub logpath: Option<PathBuf>,

    /// Return after starting the runners
    #[arg(long)]
    pub nowait: bool,

    /// Operator download endpoint handed to the runners
    #[arg(long)]
    pub operator_url: Option<String>,

    #[command(flatten)]
    pub oci: OciArgs,

    #[command(flatten)]
    pub image: ImageArgs,
}

/// OCI object store options
#[derive(Args, Debug, Clone, Default)]
pub struct OciArgs {
    #[arg(long)]
    pub oci_tenancy: Option<String>,

    #[arg(long)]
    pub oci_user: Option<String>,

    #[arg(long)]
    pub oci_region: Option<String>,

    #[arg(long)]
    pub oci_private_key_path: Option<String>,

    #[arg(long, hide_env_values = true, env = "WERCKER_OCI_PRIVATE_KEY_PASSPHRASE")]
    pub oci_private_key_passphrase: Option<String>,

    #[arg(long)]
    pub oci_fingerprint: Option<String>,

    #[arg(long)]
    pub oci_namespace: Option<String>,

    #[arg(long)]
    pub oci_bucket: Option<String>,
}

impl OciArgs {
    /// Object store options, if any credential was given
    pub fn into_options(self) -> Option<OciOptions> {
        let any = [
            &self.oci_tenancy,
            &self.oci_user,
            &self.oci_region,
            &self.oci_private_key_path,
            &self.oci_fingerprint,
        ]
        .iter()
        .any(|v| v.is_some());
        if !any {
            return None;
        }

        Some(OciOptions {
            tenancy_ocid: self.oci_tenancy.unwrap_or_default(),
            user_ocid: self.oci_user.unwrap_or_default(),
            region: self.oci_region.unwrap_or_default(),
            private_key_path: self.oci_private_key_path.unwrap_or_default(),
            private_key_passphrase: self.oci_private_key_passphrase,
            fingerprint: self.oci_fingerprint.unwrap_or_default(),
            namespace: self.oci_namespace,
            bucket: self.oci_bucket,
        })
    }
}

impl StartArgs {
    pub fn into_runner_config(self, config: &Config) -> RunnerConfig {
        RunnerConfig {
            instance_name: self.name,
            group: self.group,
            orgs: self.orgs,
            apps: self.apps,
            workflows: self.workflows,
            all: self.all,
            bearer_token: self.token,
            runner_count: self.runners,
            image_override: self.image.image_name,
            production: !self.image.dev,
            poll_frequency: self.poll_frequency,
            store_path: self.storepath,
            log_path: self.logpath,
            no_wait: self.nowait,
            debug: config.debug,
            oci: self.oci.into_options(),
            operator_url: self.operator_url,
            image_repository: self.image.image_repository,
            image_marker: self.image.image_marker,
            ..RunnerConfig::default()
        }
    }
}

/// Arguments of `corral status` and `corral stop`
#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Base name of the fleet (default: host name)
    #[arg(long)]
    pub name: Option<String>,
}

impl TargetArgs {
    pub fn into_runner_config(self) -> RunnerConfig {
        RunnerConfig {
            instance_name: self.name,
            ..RunnerConfig::default()
        }
    }
}

async fn controller(
    runner_config: RunnerConfig,
    config: &Config,
    hooks: ShutdownHooks,
) -> Result<FleetController> {
    let runtime = config.container_runtime().await?;
    let registry = config.registry(&runner_config.image_repository)?;
    Ok(FleetController::new(
        runner_config,
        runtime,
        registry,
        hooks,
        HostEnv::from_process(),
    ))
}

/// Start a fleet and, unless `--nowait`, stay until it has stopped
pub async fn start(args: StartArgs, config: &Config) -> Result<()> {
    let hooks = ShutdownHooks::new();
    hooks.listen()?;

    let controller = controller(args.into_runner_config(config), config, hooks).await?;
    match controller.run(Command::Start).await? {
        RunOutcome::Started {
            workers,
            detached: true,
        } => {
            println!(
                "{}",
                format!("✓ Started {} runner(s)", workers.len()).green().bold()
            );
            print_workers(&workers);
            println!(
                "Use {} with the same name to terminate them.",
                "corral stop".cyan()
            );
        }
        RunOutcome::Started { workers, .. } => {
            println!(
                "{}",
                format!("All {} runner(s) have stopped.", workers.len()).bold()
            );
        }
        other => print_outcome(&other),
    }
    Ok(())
}

pub async fn status(args: TargetArgs, config: &Config) -> Result<()> {
    let controller = controller(args.into_runner_config(), config, ShutdownHooks::new()).await?;
    let outcome = controller.run(Command::Status).await?;
    print_outcome(&outcome);
    Ok(())
}

pub async fn stop(args: TargetArgs, config: &Config) -> Result<()> {
    let controller = controller(args.into_runner_config(), config, ShutdownHooks::new()).await?;
    let outcome = controller.run(Command::Stop).await?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Status(report) => print_status(report),
        RunOutcome::Stopped(report) => print_stop(report),
        RunOutcome::Started { workers, .. } => print_workers(workers),
    }
}

fn print_workers(workers: &[WorkerInstance]) {
    for worker in workers {
        println!(
            "  {} {} {}",
            "▸".cyan(),
            worker.name.bold(),
            worker.status.to_string().dimmed()
        );
    }
}

fn print_status(report: &StatusReport) {
    if report.active.is_empty() {
        println!("{}", "No runners active.".yellow());
    } else {
        println!(
            "{}",
            format!("Found {} active runner(s):", report.active.len()).bold()
        );
        print_workers(&report.active);
    }
    for name in &report.removed {
        println!("  {} {} {}", "✗".red(), name, "(inactive, removed)".dimmed());
    }
    for name in &report.failed {
        println!("  {} {} {}", "✗".red(), name, "inactive, could not be removed".red());
    }
}

fn print_stop(report: &StopReport) {
    if report.is_empty() {
        println!("{}", "There are no runners to terminate.".yellow());
        return;
    }
    for name in &report.terminated {
        println!("  {} {} terminated", "✓".green(), name);
    }
    for name in &report.removed {
        println!("  {} {} {}", "✓".green(), name, "(inactive, removed)".dimmed());
    }
    for name in &report.failed {
        println!("  {} {} {}", "✗".red(), name, "could not be stopped".red());
    }
}
