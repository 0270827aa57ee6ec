//! Fleet controller
//!
//! Entry point for the `start`, `status` and `stop` commands. Starting
//! validates the configuration, picks the runner image, launches the
//! requested number of worker containers and, unless told not to wait,
//! streams their logs and polls them until every one has exited.

use corral_core::domain::worker::WorkerInstance;
use corral_registry::RegistryApi;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{HostEnv, RunnerConfig, TOKEN_ENV_VAR};
use crate::error::{FleetError, Result};
use crate::fleet::Fleet;
use crate::image::ImageResolver;
use crate::logs::{LogMultiplexer, LogTarget};
use crate::runtime::{ContainerDetails, ContainerRuntime, ContainerSpec};
use crate::shutdown::{Hook, ShutdownHooks};

/// Label carrying the fleet identity of a worker
pub const FLEET_LABEL: &str = "runner";

/// Label carrying the runner group
pub const GROUP_LABEL: &str = "runnergroup";

/// Id of the shutdown hook installed while waiting on a fleet
pub const CLEANUP_HOOK_ID: &str = "runner-cleanup";

/// Script inside the runner image that starts the worker
pub const ENTRY_SCRIPT: &str = "/externalRunner.sh";

/// Proxy variables forwarded from the host to every worker
pub const PROXY_VARS: [&str; 6] = [
    "http_proxy",
    "HTTP_PROXY",
    "https_proxy",
    "HTTPS_PROXY",
    "no_proxy",
    "NO_PROXY",
];

/// Proxy values this short carry no real setting and are not forwarded
const PROXY_MIN_LEN: usize = 4;

/// How long finished log readers get to flush after the fleet drains
const LOG_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Command handled by [`FleetController::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Status,
    Stop,
}

/// Containers seen by the `status` command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    /// Running workers
    pub active: Vec<WorkerInstance>,
    /// Names of inactive workers that were removed
    pub removed: Vec<String>,
    /// Names of inactive workers that could not be removed
    pub failed: Vec<String>,
}

/// What the `stop` command did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Workers killed and removed
    pub terminated: Vec<String>,
    /// Inactive workers removed without a kill
    pub removed: Vec<String>,
    /// Workers that could not be killed, removed or did not exit in time
    pub failed: Vec<String>,
}

impl StopReport {
    pub fn is_empty(&self) -> bool {
        self.terminated.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

/// Result of one controller command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Workers were started; `detached` when they were left running
    Started {
        workers: Vec<WorkerInstance>,
        detached: bool,
    },
    Status(StatusReport),
    Stopped(StopReport),
}

/// Label value identifying the workers of one base name
pub fn fleet_label(base_name: &str) -> String {
    format!("/corral-external-runner-{}", base_name)
}

/// Proxy settings from the host that are worth forwarding
pub fn proxy_passthrough(env: &HostEnv) -> Vec<String> {
    env.iter()
        .filter(|(key, value)| PROXY_VARS.contains(key) && value.len() > PROXY_MIN_LEN)
        .map(|(key, value)| format!("{}={}", key, value))
        .collect()
}

/// Drives the worker containers of one base name
pub struct FleetController {
    config: RunnerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: ImageResolver,
    hooks: ShutdownHooks,
    env: HostEnv,
    fleet: Fleet,
}

impl FleetController {
    pub fn new(
        config: RunnerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryApi>,
        hooks: ShutdownHooks,
        env: HostEnv,
    ) -> Self {
        Self {
            resolver: ImageResolver::new(runtime.clone(), registry),
            config,
            runtime,
            hooks,
            env,
            fleet: Fleet::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Workers started by this controller and not yet gone
    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub async fn run(&self, command: Command) -> Result<RunOutcome> {
        let base_name = self.base_name().await?;
        debug!("Running {:?} for {}", command, base_name);

        match command {
            Command::Start => self.start(&base_name).await,
            Command::Status => self.status(&base_name).await.map(RunOutcome::Status),
            Command::Stop => self.stop(&base_name).await.map(RunOutcome::Stopped),
        }
    }

    /// Explicit instance name, else the host name
    pub async fn base_name(&self) -> Result<String> {
        if let Some(name) = self.config.instance_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(name.to_string());
        }
        if let Some(name) = self.env.get("HOSTNAME") {
            return Ok(name.to_string());
        }
        detect_hostname()
            .await
            .ok_or_else(|| FleetError::Startup("unable to access hostname".to_string()))
    }

    // =============================================================================
    // Start
    // =============================================================================

    async fn start(&self, base_name: &str) -> Result<RunOutcome> {
        self.config.validate()?;
        let token = self.config.resolve_token(&self.env)?;
        let env = self.worker_env(&token)?;

        match self.resolver.check_registry_images(&self.config, true).await {
            Ok(check) => debug!("Registry check: {:?}", check),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Registry check failed: {}", e),
        }

        let image = self
            .resolver
            .resolve_local_image(&self.config)
            .await?
            .ok_or(FleetError::NoLocalImage)?;

        let label = fleet_label(base_name);
        let existing = self.runtime.list_containers(FLEET_LABEL, &label).await?;
        if !existing.is_empty() {
            return Err(FleetError::AlreadyRunning(base_name.to_string()));
        }

        let group = self.config.effective_group(base_name);
        let labels = BTreeMap::from([
            (FLEET_LABEL.to_string(), label),
            (GROUP_LABEL.to_string(), group.clone()),
        ]);
        let binds = self.worker_binds();

        for index in 1..=self.config.runner_count {
            let name = format!("{}_{}", base_name, index);
            let spec = ContainerSpec {
                cmd: self.worker_command(&name, &image.name, &token, &group),
                name,
                image: image.name.clone(),
                env: env.clone(),
                labels: labels.clone(),
                binds: binds.clone(),
            };

            match self.start_worker(&spec).await {
                Ok(worker) => self.fleet.insert(worker).await,
                Err(e) => warn!("Runner {} was not started: {}", spec.name, e),
            }
        }

        if self.fleet.is_empty().await {
            return Err(FleetError::Startup(format!(
                "Unable to start any runner for {}",
                base_name
            )));
        }

        if let Some(path) = &self.config.store_path {
            info!("Output is written to the {} directory", path.display());
        }
        debug!("Running with production: {}", self.config.production);

        let workers = self.fleet.snapshot().await;
        if self.config.no_wait {
            info!(
                "Use the corral stop command with the same name to terminate the started runner(s)."
            );
            return Ok(RunOutcome::Started {
                workers,
                detached: true,
            });
        }

        self.wait_for_fleet().await;
        Ok(RunOutcome::Started {
            workers,
            detached: false,
        })
    }

    /// Creates one worker and records what the runtime reports for it
    async fn start_worker(&self, spec: &ContainerSpec) -> Result<WorkerInstance> {
        let id = self.runtime.create_and_start(spec).await?;
        info!("Runner {} has started.", spec.name);
        debug!("Runner image: {}", spec.image);

        let details = self.inspect_started(&spec.name, &id).await?;
        Ok(WorkerInstance::new(&spec.name, details.id, details.status))
    }

    /// Inspects a new container, retrying with exponential backoff
    ///
    /// The runtime may not report a container right after it was started.
    async fn inspect_started(&self, name: &str, id: &str) -> Result<ContainerDetails> {
        let policy = self.config.inspect_retry;
        let mut attempt = 0;
        let mut delay = policy.initial_delay;

        loop {
            attempt += 1;
            match self.runtime.inspect_container(id).await {
                Ok(details) => return Ok(details),
                Err(e) if attempt >= policy.max_attempts.max(1) => {
                    warn!("Giving up inspecting {} after {} attempt(s)", name, attempt);
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "Inspecting {} failed (attempt {}/{}): {}",
                        name, attempt, policy.max_attempts, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(policy.max_delay);
                }
            }
        }
    }

    /// Environment shared by every worker
    fn worker_env(&self, token: &str) -> Result<Vec<String>> {
        let mut env = vec![format!("{}={}", TOKEN_ENV_VAR, token)];

        if let Some(oci) = &self.config.oci {
            env.push(format!("WERCKER_OCI_TENANCY_OCID={}", oci.tenancy_ocid));
            env.push(format!("WERCKER_OCI_USER_OCID={}", oci.user_ocid));
            env.push(format!("WERCKER_OCI_REGION={}", oci.region));
            env.push(format!("WERCKER_OCI_PRIVATE_KEY_PATH={}", oci.private_key_path));
            env.push(format!("WERCKER_OCI_FINGERPRINT={}", oci.fingerprint));
            if let Some(passphrase) = oci.private_key_passphrase.as_deref().filter(|p| !p.is_empty())
            {
                env.push(format!("WERCKER_OCI_PRIVATE_KEY_PASSPHRASE={}", passphrase));
            }
        } else if self.config.store_path.is_none() {
            match (
                self.env.get("AWS_ACCESS_KEY_ID"),
                self.env.get("AWS_SECRET_ACCESS_KEY"),
            ) {
                (Some(key), Some(secret)) => {
                    env.push(format!("AWS_ACCESS_KEY_ID={}", key));
                    env.push(format!("AWS_SECRET_ACCESS_KEY={}", secret));
                }
                _ => {
                    return Err(FleetError::Config(
                        "Missing AWS S3 access credentials".to_string(),
                    ));
                }
            }
        }

        if self.config.production {
            env.push("WERCKER_SYSTYPE=PROD".to_string());
        }

        env.extend(proxy_passthrough(&self.env));
        Ok(env)
    }

    /// Entry script arguments for one worker
    fn worker_command(&self, name: &str, image: &str, token: &str, group: &str) -> Vec<String> {
        let config = &self.config;
        let mut cmd = vec![
            ENTRY_SCRIPT.to_string(),
            format!("--runner-image={}", image),
            format!("--runner-name={}", name),
            format!("--runner-api-token={}", token),
        ];

        if !group.is_empty() {
            cmd.push(format!("--runner-group={}", group));
        }
        let optional = [
            ("--runner-orgs", config.orgs.clone()),
            ("--runner-apps", config.apps.clone()),
            ("--runner-workflows", config.workflows.clone()),
            (
                "--runner-store-path",
                config.store_path.as_ref().map(|p| p.display().to_string()),
            ),
            ("--runner-operator-url", config.operator_url.clone()),
            (
                "--runner-obj-store-namespace",
                config.oci.as_ref().and_then(|o| o.namespace.clone()),
            ),
            (
                "--bucket-result",
                config.oci.as_ref().and_then(|o| o.bucket.clone()),
            ),
        ];
        for (flag, value) in optional {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                cmd.push(format!("{}={}", flag, value));
            }
        }

        if config.debug {
            cmd.push("-d".to_string());
            cmd.push("--showlogs".to_string());
        }
        if config.all {
            cmd.push("--runner-all".to_string());
        }
        if config.poll_frequency > 0 {
            cmd.push(format!("--poll-frequency={}", config.poll_frequency));
        }
        cmd
    }

    fn worker_binds(&self) -> Vec<String> {
        let config = &self.config;
        let mut binds = vec![
            format!("{}:{}:rw", config.state_dir, config.state_dir),
            format!("{}:{}", config.runtime_socket, config.runtime_socket),
        ];
        for path in [&config.log_path, &config.store_path].into_iter().flatten() {
            let path = path.display();
            binds.push(format!("{}:{}:rw", path, path));
        }
        binds
    }

    // =============================================================================
    // Foreground wait
    // =============================================================================

    /// Streams logs and polls until the fleet is empty
    async fn wait_for_fleet(&self) {
        let multiplexer = LogMultiplexer::new(
            self.runtime.clone(),
            LogTarget::from_path(self.config.log_path.as_deref()),
        );
        let readers: Vec<_> = self
            .fleet
            .snapshot()
            .await
            .iter()
            .map(|worker| multiplexer.attach(worker))
            .collect();

        self.hooks.add(self.cleanup_hook());

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        while !self.fleet.is_empty().await {
            ticker.tick().await;
            self.sweep().await;
        }

        self.hooks.remove(CLEANUP_HOOK_ID);

        let drained = async {
            for reader in readers {
                let _ = reader.await;
            }
        };
        if tokio::time::timeout(LOG_DRAIN_GRACE, drained).await.is_err() {
            debug!("Log readers still running after the fleet drained");
        }
    }

    /// Kills every tracked worker without waiting; the sweep removes them
    fn cleanup_hook(&self) -> Hook {
        let fleet = self.fleet.clone();
        let runtime = self.runtime.clone();
        Hook::new(CLEANUP_HOOK_ID, move || {
            let fleet = fleet.clone();
            let runtime = runtime.clone();
            async move {
                warn!("Interrupt detected, cleaning up runner containers and shutting down");
                for worker in fleet.snapshot().await {
                    if let Err(e) = runtime.kill_container(&worker.id).await {
                        debug!("Kill of {} failed: {}", worker.name, e);
                    }
                }
                true
            }
        })
    }

    /// Inspects every fleet member once and drops the ones that are gone
    ///
    /// Works on a snapshot; removals are applied in one step at the end.
    /// Returns the number of workers dropped.
    pub async fn sweep(&self) -> usize {
        let mut gone = Vec::new();

        for worker in self.fleet.snapshot().await {
            match self.runtime.inspect_container(&worker.id).await {
                Err(e) => {
                    debug!("Runner {} can no longer be inspected: {}", worker.name, e);
                    gone.push(worker.id);
                }
                Ok(details) if details.status.is_terminal() => {
                    if let Err(e) = self.runtime.remove_container(&worker.id).await {
                        debug!("Removing {} failed: {}", worker.name, e);
                    }
                    info!("Runner {} has been stopped.", worker.name);
                    gone.push(worker.id);
                }
                Ok(details) => self.fleet.update_status(&worker.id, details.status).await,
            }
        }

        self.fleet.remove_many(&gone).await
    }

    // =============================================================================
    // Status and stop
    // =============================================================================

    /// Inspected containers labeled for this base name
    async fn labeled_containers(&self, base_name: &str) -> Result<Vec<ContainerDetails>> {
        let summaries = self
            .runtime
            .list_containers(FLEET_LABEL, &fleet_label(base_name))
            .await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            match self.runtime.inspect_container(&summary.id).await {
                Ok(details) => containers.push(details),
                Err(e) => debug!("Skipping {}: {}", summary.name, e),
            }
        }
        Ok(containers)
    }

    async fn status(&self, base_name: &str) -> Result<StatusReport> {
        let containers = self.labeled_containers(base_name).await?;
        let mut report = StatusReport::default();

        if containers.is_empty() {
            info!("There are no runners active.");
            return Ok(report);
        }

        for container in containers {
            if !container.status.is_running() {
                info!(
                    "Inactive runner container {} is being removed.",
                    container.name
                );
                match self.runtime.remove_container(&container.id).await {
                    Ok(()) => report.removed.push(container.name),
                    Err(e) => {
                        warn!("Unable to remove {}: {}", container.name, e);
                        report.failed.push(container.name);
                    }
                }
                continue;
            }

            info!(
                "Runner container: {} is active, status={}",
                container.name, container.status
            );
            report.active.push(WorkerInstance::new(
                container.name,
                container.id,
                container.status,
            ));
        }

        Ok(report)
    }

    async fn stop(&self, base_name: &str) -> Result<StopReport> {
        let containers = self.labeled_containers(base_name).await?;
        let mut report = StopReport::default();

        if containers.is_empty() {
            info!("There are no runners to terminate");
            return Ok(report);
        }

        for container in containers {
            if !container.status.is_running() {
                info!("Inactive runner container {} is removed.", container.name);
                match self.runtime.remove_container(&container.id).await {
                    Ok(()) => report.removed.push(container.name),
                    Err(e) => {
                        warn!("Unable to remove {}: {}", container.name, e);
                        report.failed.push(container.name);
                    }
                }
                continue;
            }

            if let Err(e) = self.runtime.kill_container(&container.id).await {
                warn!(
                    "failed to stop runner container: {}, err={}",
                    container.name, e
                );
                report.failed.push(container.name);
                continue;
            }

            if self.wait_for_exit(&container).await {
                info!("Runner {} has terminated.", container.name);
                report.terminated.push(container.name);
            } else {
                warn!(
                    "Runner {} did not exit within {:?}",
                    container.name, self.config.stop_timeout
                );
                report.failed.push(container.name);
            }
        }

        info!("Runner(s) for {} stopped.", base_name);
        Ok(report)
    }

    /// Polls a killed container until it exits, then removes it
    ///
    /// An inspection error means the container is already gone.
    async fn wait_for_exit(&self, container: &ContainerDetails) -> bool {
        let deadline = Instant::now() + self.config.stop_timeout;

        loop {
            tokio::time::sleep(self.config.kill_poll_interval).await;
            match self.runtime.inspect_container(&container.id).await {
                Err(_) => return true,
                Ok(details) if details.status.is_terminal() => {
                    if let Err(e) = self.runtime.remove_container(&container.id).await {
                        debug!("Removing {} failed: {}", container.name, e);
                    }
                    return true;
                }
                Ok(details) => {
                    if Instant::now() >= deadline {
                        debug!("{} still {}", container.name, details.status);
                        return false;
                    }
                }
            }
        }
    }
}

/// Host name reported by the `hostname` command
async fn detect_hostname() -> Option<String> {
    let output = tokio::process::Command::new("hostname")
        .output()
        .await
        .ok()
        .filter(|output| output.status.success())?;

    let hostname = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if hostname.is_empty() {
        None
    } else {
        Some(hostname)
    }
}

impl std::fmt::Debug for FleetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
