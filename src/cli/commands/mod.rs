pub mod model;

pub use model::{EvictCommand, ManifestCommand, ModelsCommand, PullCommand, VerifyCommand};

use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// List the models this build can serve
    Models(ModelsCommand),
    /// Resolve and print the shard manifest of a model variant
    Manifest(ManifestCommand),
    /// Download a model variant into the weight cache
    Pull(PullCommand),
    /// Check that a cached model variant is complete
    Verify(VerifyCommand),
    /// Remove cached generations of a model
    Evict(EvictCommand),
    /// Probe for a usable GPU adapter
    Probe,
}

/// Logging options
#[derive(Debug, Clone, Args)]
pub struct LoggingArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "DRAFTLM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Filter directives, e.g. "draftlm_core=debug,reqwest=warn"
    #[arg(long, global = true, env = "RUST_LOG")]
    pub log_filter: Option<String>,

    /// Also write logs to this directory, rotated daily
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
}
