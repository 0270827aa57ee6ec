//! Corral CLI
//!
//! Command-line interface for starting, inspecting and stopping external
//! runner fleets on this host.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "corral")]
#[command(about = "External runner fleet manager", long_about = None)]
struct Cli {
    /// Container runtime client binary
    #[arg(long, global = true, env = "CORRAL_RUNTIME", default_value = "docker")]
    runtime: String,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "corral=debug,corral_fleet=debug,corral_registry=debug"
    } else {
        "corral=info,corral_fleet=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config {
        runtime: cli.runtime,
        debug: cli.debug,
    };

    handle_command(cli.command, &config).await
}
