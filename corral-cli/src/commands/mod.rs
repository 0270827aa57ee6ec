//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod configure;
mod runner;

pub use configure::ConfigureArgs;
pub use runner::{StartArgs, TargetArgs};

use anyhow::Result;
use clap::{Args, Subcommand};
use corral_core::domain::image::{DEFAULT_IMAGE_FAMILY_MARKER, DEFAULT_IMAGE_REPOSITORY};

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start a fleet of runners
    Start(StartArgs),
    /// Show the runners of a fleet, removing inactive ones
    Status(TargetArgs),
    /// Stop and remove the runners of a fleet
    Stop(TargetArgs),
    /// Check the local runner image against the registry
    Configure(ConfigureArgs),
}

/// Runner image selection shared by `start` and `configure`
#[derive(Args, Debug, Clone)]
pub struct ImageArgs {
    /// Development mode: allow any runner image tag
    #[arg(long)]
    pub dev: bool,

    /// Image reference to run (development mode only)
    #[arg(long)]
    pub image_name: Option<String>,

    /// Repository of the runner image family
    #[arg(long, hide = true, default_value = DEFAULT_IMAGE_REPOSITORY)]
    pub image_repository: String,

    /// Tag substring identifying runner images locally
    #[arg(long, hide = true, default_value = DEFAULT_IMAGE_FAMILY_MARKER)]
    pub image_marker: String,
}

/// Handle a CLI command
///
/// Routes the command to the appropriate handler module.
///
/// # Arguments
/// * `command` - The command to execute
/// * `config` - The CLI configuration
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Start(args) => runner::start(args, config).await,
        Commands::Status(args) => runner::status(args, config).await,
        Commands::Stop(args) => runner::stop(args, config).await,
        Commands::Configure(args) => configure::configure(args, config).await,
    }
}
