//! Model and cache management commands

use clap::Args;

use crate::models::Quantization;

#[derive(Debug, Args)]
pub struct ModelsCommand {
    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ManifestCommand {
    /// Catalog model id, e.g. lfm2-350m
    pub model: String,

    /// Variant to resolve; defaults to the model's primary variant
    #[arg(short, long)]
    pub quantization: Option<Quantization>,
}

#[derive(Debug, Args)]
pub struct PullCommand {
    /// Catalog model id
    pub model: String,

    /// Variant to download; defaults to the model's primary variant
    #[arg(short, long)]
    pub quantization: Option<Quantization>,

    /// Hide the progress bar
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Debug, Args)]
pub struct VerifyCommand {
    /// Catalog model id
    pub model: String,

    #[arg(short, long)]
    pub quantization: Option<Quantization>,
}

#[derive(Debug, Args)]
pub struct EvictCommand {
    /// Catalog model id
    pub model: String,

    /// Also remove the generation of the current revision
    #[arg(long)]
    pub all: bool,
}
