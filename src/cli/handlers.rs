use anyhow::{Context, Result};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use super::commands::{
    Commands, EvictCommand, LoggingArgs, ManifestCommand, ModelsCommand, PullCommand,
    VerifyCommand,
};
use crate::api::{CacheManager, DownloadProgress, HfHubClient, ManifestResolver, ProgressObserver, RetryPolicy, WeightRepository};
use crate::config::ServiceConfig;
use crate::models::{catalog, find, ModelDefinition};
use crate::runtime::default_probe;
use crate::storage::FsBlobStore;

/// Install the global subscriber. The returned guard flushes the log file and
/// must live until exit.
pub fn init_logging(args: &LoggingArgs) -> Result<Option<WorkerGuard>> {
    let level: Level = args.log_level.parse().unwrap_or(Level::INFO);
    let filter = || {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(args.log_filter.as_deref().unwrap_or(""))
    };

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(filter());

    let (file, guard) = match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "draftlm.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(guard)
}

pub async fn handle_command(command: Commands, config: ServiceConfig) -> Result<()> {
    match command {
        Commands::Models(cmd) => handle_models(cmd),
        Commands::Manifest(cmd) => handle_manifest(cmd, &config).await,
        Commands::Pull(cmd) => handle_pull(cmd, &config).await,
        Commands::Verify(cmd) => handle_verify(cmd, &config).await,
        Commands::Evict(cmd) => handle_evict(cmd, &config).await,
        Commands::Probe => handle_probe(&config).await,
    }
}

fn lookup(model: &str) -> Result<&'static ModelDefinition> {
    find(model).with_context(|| {
        let known: Vec<&str> = catalog().iter().map(|d| d.id).collect();
        format!("Unknown model '{}' (known: {})", model, known.join(", "))
    })
}

fn acquisition(config: &ServiceConfig) -> Result<(ManifestResolver, Arc<CacheManager>)> {
    let repo: Arc<dyn WeightRepository> =
        Arc::new(HfHubClient::new(&config.hub).context("Failed to create hub client")?);
    let store = Arc::new(FsBlobStore::new(config.cache.resolved_dir()));
    let cache = Arc::new(CacheManager::with_settings(
        Arc::clone(&repo),
        store,
        &config.cache,
        RetryPolicy::from(&config.retry),
    ));
    Ok((ManifestResolver::new(repo), cache))
}

fn handle_models(cmd: ModelsCommand) -> Result<()> {
    if cmd.json {
        let rows: Vec<serde_json::Value> = catalog()
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "label": d.label,
                    "repository": d.repository,
                    "revision": d.revision,
                    "quantization": d.quantization,
                    "fallbacks": d.fallbacks,
                    "cpu_fallback": d.cpu_fallback,
                    "context_window": d.context_window,
                    "images": d.supports_images(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{:<16} {:<40} {:<8} {:>8}  {}", "ID", "REPOSITORY", "VARIANT", "CONTEXT", "IMAGES");
    for d in catalog() {
        println!(
            "{:<16} {:<40} {:<8} {:>8}  {}",
            d.id,
            d.repository,
            d.quantization,
            d.context_window,
            if d.supports_images() { "yes" } else { "no" }
        );
    }
    Ok(())
}

async fn handle_manifest(cmd: ManifestCommand, config: &ServiceConfig) -> Result<()> {
    let definition = lookup(&cmd.model)?;
    let (resolver, _) = acquisition(config)?;
    let manifest = resolver
        .resolve(definition, cmd.quantization.unwrap_or(definition.quantization))
        .await
        .with_context(|| format!("Failed to resolve manifest for {}", definition.id))?;
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

/// Renders acquisition progress on a terminal bar
struct ProgressBarObserver {
    bar: ProgressBar,
}

impl ProgressBarObserver {
    fn new() -> Result<Self> {
        let bar = ProgressBar::new(1000);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {msg}")?
                .progress_chars("#>-"),
        );
        Ok(Self { bar })
    }
}

impl ProgressObserver for ProgressBarObserver {
    fn on_progress(&self, percentage: f64, stats: &DownloadProgress) {
        self.bar.set_position((percentage * 10.0).round() as u64);
        let total = stats
            .total_bytes
            .map(|t| HumanBytes(t).to_string())
            .unwrap_or_else(|| "?".to_string());
        self.bar.set_message(format!(
            "{}/{} files, {}/{} at {}/s",
            stats.completed_files,
            stats.total_files,
            HumanBytes(stats.downloaded_bytes),
            total,
            HumanBytes(stats.speed_bytes_per_sec as u64)
        ));
    }
}

async fn handle_pull(cmd: PullCommand, config: &ServiceConfig) -> Result<()> {
    let definition = lookup(&cmd.model)?;
    let quantization = cmd.quantization.unwrap_or(definition.quantization);
    let (resolver, cache) = acquisition(config)?;

    let manifest = resolver
        .resolve(definition, quantization)
        .await
        .with_context(|| format!("Failed to resolve manifest for {}", definition.id))?;
    info!("Pulling {} ({}) into {}", definition.id, quantization, config.cache.resolved_dir().display());

    let observer = if cmd.quiet { None } else { Some(Arc::new(ProgressBarObserver::new()?)) };
    let report = cache
        .ensure_cached(&manifest, observer.clone().map(|o| o as Arc<dyn ProgressObserver>))
        .await
        .with_context(|| format!("Failed to cache {}", definition.id))?;
    if let Some(observer) = observer {
        observer.bar.finish_and_clear();
    }

    println!(
        "{}: {} downloaded ({}), {} cached, {} not on remote",
        report.generation,
        report.downloaded.len(),
        HumanBytes(report.bytes_downloaded),
        report.hits.len(),
        report.dropped.len()
    );
    for generation in &report.evicted {
        println!("evicted {}", generation);
    }
    Ok(())
}

async fn handle_verify(cmd: VerifyCommand, config: &ServiceConfig) -> Result<()> {
    let definition = lookup(&cmd.model)?;
    let (resolver, cache) = acquisition(config)?;
    let manifest = resolver
        .resolve(definition, cmd.quantization.unwrap_or(definition.quantization))
        .await
        .with_context(|| format!("Failed to resolve manifest for {}", definition.id))?;

    let missing = cache.verify_cached(&manifest).await?;
    if missing.is_empty() {
        println!("{} ({}) is complete", definition.id, manifest.quantization);
        return Ok(());
    }
    for path in &missing {
        println!("missing {}", path);
    }
    anyhow::bail!("{} file(s) of {} are missing or truncated", missing.len(), definition.id)
}

async fn handle_evict(cmd: EvictCommand, config: &ServiceConfig) -> Result<()> {
    let definition = lookup(&cmd.model)?;
    let (_, cache) = acquisition(config)?;
    let evicted = if cmd.all {
        cache.evict_all(definition.id).await?
    } else {
        cache.evict_stale(definition.id, definition.revision).await?
    };

    if evicted.is_empty() {
        println!("nothing to evict for {}", definition.id);
    }
    for generation in evicted {
        println!("evicted {}", generation);
    }
    Ok(())
}

async fn handle_probe(config: &ServiceConfig) -> Result<()> {
    let device = default_probe()
        .acquire(config.gpu.power_preference)
        .await
        .context("GPU preflight failed")?;
    println!(
        "{} ({}), shader-f16: {}",
        device.adapter_name,
        device.backend,
        if device.supports_shader_f16 { "yes" } else { "no" }
    );
    Ok(())
}
