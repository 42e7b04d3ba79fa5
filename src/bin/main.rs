//! draftlm binary.
//!
//! Manages the on-device weight cache for the catalog models and reports GPU
//! capability.

use clap::Parser;
use draftlm_core::cli::commands::{Commands, LoggingArgs};
use draftlm_core::cli::{handle_command, init_logging};
use draftlm_core::config::{ConfigArgs, ServiceConfig};
use tracing::debug;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.logging)?;

    let config = ServiceConfig::load(&cli.config)?;
    debug!("Using cache at {}", config.cache.resolved_dir().display());

    handle_command(cli.command, config).await
}
