//! Fleet configuration
//!
//! Defines everything one controller run needs: which jobs the workers may
//! pick up, how many to start, where their output goes, and the timing knobs
//! for polling and retries.

use corral_core::domain::image::{DEFAULT_IMAGE_FAMILY_MARKER, DEFAULT_IMAGE_REPOSITORY};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FleetError, Result};

/// Host variable consulted when no bearer token is configured
pub const TOKEN_ENV_VAR: &str = "WERCKER_RUNNER_TOKEN";

/// OCI object store settings forwarded to every worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OciOptions {
    pub tenancy_ocid: String,
    pub user_ocid: String,
    pub region: String,
    pub private_key_path: String,
    pub private_key_passphrase: Option<String>,
    pub fingerprint: String,
    pub namespace: Option<String>,
    pub bucket: Option<String>,
}

impl OciOptions {
    /// Names of required credentials that are missing
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        [
            ("tenancy", &self.tenancy_ocid),
            ("user", &self.user_ocid),
            ("region", &self.region),
            ("private key path", &self.private_key_path),
            ("fingerprint", &self.fingerprint),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

/// Snapshot of the host process environment
///
/// Captured once so credential and proxy forwarding can be tested without
/// touching the real environment.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    vars: BTreeMap<String, String>,
}

impl HostEnv {
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns a variable when it is set to a non-empty value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Run configuration for one controller invocation
///
/// Built by the CLI, validated before any container is created, and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base name for worker containers; the host name when unset
    pub instance_name: Option<String>,

    /// Runner group, optionally `group@organization`
    pub group: Option<String>,

    /// Comma separated organization names
    pub orgs: Option<String>,

    /// Comma separated `org/app` names
    pub apps: Option<String>,

    /// Comma separated `org/app/workflow` names
    pub workflows: Option<String>,

    /// Accept every job the token owner can see
    pub all: bool,

    /// Bearer token handed to each worker
    pub bearer_token: Option<String>,

    /// Number of workers to start
    pub runner_count: usize,

    /// Explicit image reference (honoured outside production only)
    pub image_override: Option<String>,

    /// Restrict image selection to released tags
    pub production: bool,

    /// Seconds between job polls inside each worker
    pub poll_frequency: u64,

    /// Local storage shared with the workers
    pub store_path: Option<PathBuf>,

    /// Directory receiving `<worker>.log` files; console when unset
    pub log_path: Option<PathBuf>,

    /// Return right after starting the workers
    pub no_wait: bool,

    /// Pull a newer remote image when one exists
    pub pull_remote: bool,

    /// Run the workers with debug output
    pub debug: bool,

    /// OCI object store credentials, exclusive with `store_path`
    pub oci: Option<OciOptions>,

    /// Operator download endpoint passed through to workers
    pub operator_url: Option<String>,

    /// Repository reference of the runner image family
    pub image_repository: String,

    /// Substring identifying runner tags in the local image list
    pub image_marker: String,

    /// Runtime control socket bind-mounted into every worker
    pub runtime_socket: String,

    /// Host directory holding shared runner state
    pub state_dir: String,

    /// Time between sweeps of the foreground polling loop
    pub sweep_interval: Duration,

    /// Time between inspections while waiting for a killed worker
    pub kill_poll_interval: Duration,

    /// Longest wait for a killed worker to exit before giving up on it
    pub stop_timeout: Duration,

    /// Upper bound for the best-effort registry check
    pub registry_timeout: Duration,

    /// Retry policy for the inspection right after a container starts
    pub inspect_retry: RetryPolicy,
}

impl RunnerConfig {
    /// Creates a configuration with defaults and no job selectors
    pub fn new() -> Self {
        Self {
            instance_name: None,
            group: None,
            orgs: None,
            apps: None,
            workflows: None,
            all: false,
            bearer_token: None,
            runner_count: 1,
            image_override: None,
            production: true,
            poll_frequency: 5,
            store_path: None,
            log_path: None,
            no_wait: false,
            pull_remote: false,
            debug: false,
            oci: None,
            operator_url: None,
            image_repository: DEFAULT_IMAGE_REPOSITORY.to_string(),
            image_marker: DEFAULT_IMAGE_FAMILY_MARKER.to_string(),
            runtime_socket: "/var/run/docker.sock".to_string(),
            state_dir: "/var/lib/wercker".to_string(),
            sweep_interval: Duration::from_secs(5),
            kill_poll_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(60),
            registry_timeout: Duration::from_secs(30),
            inspect_retry: RetryPolicy::default(),
        }
    }

    fn has_selectors(&self) -> bool {
        self.orgs.is_some() || self.apps.is_some() || self.workflows.is_some()
    }

    fn group_has_org(&self) -> bool {
        self.group.as_deref().is_some_and(|g| g.contains('@'))
    }

    /// Group name sent to workers, defaulting to the base name
    pub fn effective_group(&self, base_name: &str) -> String {
        match self.group.as_deref() {
            Some(group) if !group.is_empty() => group.to_string(),
            _ => base_name.to_string(),
        }
    }

    /// Bearer token from configuration or the host environment
    pub fn resolve_token(&self, env: &HostEnv) -> Result<String> {
        if let Some(token) = self.bearer_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(token.to_string());
        }
        env.get(TOKEN_ENV_VAR).map(str::to_string).ok_or_else(|| {
            FleetError::Config(
                "Unable to start runner(s) because runner bearer token was not supplied"
                    .to_string(),
            )
        })
    }

    /// Validates the start configuration
    ///
    /// Checks the job selector combination, the object store settings and
    /// that storage and log directories already exist. A missing directory
    /// would otherwise surface as a silent bind-mount failure and a worker
    /// that appears hung.
    pub fn validate(&self) -> Result<()> {
        if self.runner_count == 0 {
            return Err(FleetError::Config(
                "runner count must be greater than 0".to_string(),
            ));
        }

        if self.all {
            if self.has_selectors() {
                return Err(FleetError::Config(
                    "--all is not valid with --orgs, --apps, or --workflows".to_string(),
                ));
            }
        } else if !self.group_has_org() && !self.has_selectors() {
            return Err(FleetError::Config(
                "--all must be specified when no other selection criteria".to_string(),
            ));
        }

        if self.group_has_org() && (self.all || self.has_selectors()) {
            return Err(FleetError::Config(
                "--all, --orgs, --apps or --workflows not allowed with groupname@organization"
                    .to_string(),
            ));
        }

        if let Some(oci) = &self.oci {
            if self.store_path.is_some() {
                return Err(FleetError::Config(
                    "OCI object store and a local storage path cannot be combined".to_string(),
                ));
            }
            let missing = oci.missing_credentials();
            if !missing.is_empty() {
                return Err(FleetError::Config(format!(
                    "Missing OCI object store access credentials: {}",
                    missing.join(", ")
                )));
            }
        }

        if let Some(path) = &self.store_path {
            ensure_directory(path, "Local storage path")?;
        }
        if let Some(path) = &self.log_path {
            ensure_directory(path, "Log output path")?;
        }

        if self.sweep_interval.is_zero() || self.kill_poll_interval.is_zero() {
            return Err(FleetError::Config(
                "polling intervals must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_directory(path: &Path, what: &str) -> Result<()> {
    match std::fs::metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FleetError::Config(format!(
            "{} {} does not exist",
            what,
            path.display()
        ))),
        Ok(metadata) if !metadata.is_dir() => Err(FleetError::Config(format!(
            "{} {} is not a directory",
            what,
            path.display()
        ))),
        _ => Ok(()),
    }
}
