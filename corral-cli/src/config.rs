//! Configuration module
//!
//! Global CLI settings shared by every command.

use anyhow::{Context, Result};
use corral_fleet::CliRuntime;
use corral_registry::RegistryClient;
use std::sync::Arc;
use tracing::debug;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Container runtime client binary (`docker` or `podman`)
    pub runtime: String,

    /// Whether `--debug` was given
    pub debug: bool,
}

impl Config {
    /// Runtime handle after checking the client binary works
    pub async fn container_runtime(&self) -> Result<Arc<CliRuntime>> {
        let runtime = CliRuntime::new(&self.runtime);
        let version = runtime
            .check_available()
            .await
            .with_context(|| format!("Container runtime '{}' is not usable", self.runtime))?;
        debug!("Using {} ({})", self.runtime, version);
        Ok(Arc::new(runtime))
    }

    pub fn registry(&self, image_repository: &str) -> Result<Arc<RegistryClient>> {
        let client = RegistryClient::for_repository(image_repository)
            .context("Invalid runner image repository")?;
        debug!("Registry client ready for {}", image_repository);
        Ok(Arc::new(client))
    }
}
