//! Configure command handler
//!
//! Compares the local runner image with the registry and optionally pulls
//! a newer one.

use anyhow::Result;
use clap::Args;
use colored::*;
use corral_fleet::{ImageResolver, RegistryCheck, RunnerConfig};

use super::ImageArgs;
use crate::config::Config;

/// Arguments of `corral configure`
#[derive(Args, Debug, Clone)]
pub struct ConfigureArgs {
    /// Pull the newest runner image when the local one is missing or older
    #[arg(long)]
    pub pull: bool,

    #[command(flatten)]
    pub image: ImageArgs,
}

impl ConfigureArgs {
    pub fn into_runner_config(self) -> RunnerConfig {
        RunnerConfig {
            pull_remote: self.pull,
            production: !self.image.dev,
            image_override: self.image.image_name,
            image_repository: self.image.image_repository,
            image_marker: self.image.image_marker,
            ..RunnerConfig::default()
        }
    }
}

pub async fn configure(args: ConfigureArgs, config: &Config) -> Result<()> {
    let runner_config = args.into_runner_config();
    let runtime = config.container_runtime().await?;
    let registry = config.registry(&runner_config.image_repository)?;
    let resolver = ImageResolver::new(runtime, registry);

    match resolver.check_registry_images(&runner_config, false).await? {
        RegistryCheck::UpToDate { local } => {
            println!("{}", "✓ Local runner image is up-to-date.".green().bold());
            println!("  Image:   {}", local.name.bold());
            println!("  Created: {}", local.created.format("%Y-%m-%d %H:%M:%S"));
        }
        RegistryCheck::UpdateAvailable { remote } => {
            println!("{}", "A newer runner image is available.".yellow().bold());
            println!("  Image:   {}", remote.name.bold());
            println!("  Created: {}", remote.created.format("%Y-%m-%d %H:%M:%S"));
            println!(
                "Execute {} to update your system.",
                "corral configure --pull".cyan()
            );
        }
        RegistryCheck::Pulled { image } => {
            println!("{}", "✓ Pulled newer runner image".green().bold());
            println!("  Image:   {}", image.bold());
        }
        RegistryCheck::RemoteUnavailable => {
            println!("{}", "Remote registry is unavailable.".yellow());
        }
    }

    Ok(())
}
