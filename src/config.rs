//! Configuration management for the draftlm runtime.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/draftlm/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `DRAFTLM_`, `__` between sections)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! - `DRAFTLM_HUB__TOKEN` - Bearer token for gated repositories
//! - `DRAFTLM_CACHE__DIR` - Weight cache directory
//! - `DRAFTLM_GPU__REQUIRE_GPU` - Fail instead of falling back to CPU

use clap::Args;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{acquisition, hub};
use crate::error::Result;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const SYSTEM_CONFIG: &str = "/etc/draftlm/config.toml";

/// Command-line overrides shared by every subcommand
#[derive(Debug, Default, Clone, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, global = true, env = "DRAFTLM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Weight cache directory
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Model hub base URL
    #[arg(long, global = true)]
    pub hub_url: Option<String>,

    /// Hub access token
    #[arg(long, global = true, env = "HF_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Enable GPU acceleration
    #[arg(long, global = true)]
    pub gpu_enabled: Option<bool>,

    /// Fail instead of falling back to the CPU tier
    #[arg(long, global = true)]
    pub require_gpu: bool,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub hub: HubSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub gpu: GpuSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
}

/// Remote weight repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    /// Connect and read timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

/// Weight cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Cache root; `None` resolves to the platform cache directory
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl CacheSettings {
    /// Cache root, falling back to `$XDG_CACHE_HOME/draftlm` or `~/.cache/draftlm`
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        let base = std::env::var_os("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| Path::new(&h).join(".cache")))
            .unwrap_or_else(std::env::temp_dir);
        base.join("draftlm")
    }
}

/// Download retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Adapter preference passed to the GPU probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerPreference {
    #[default]
    HighPerformance,
    LowPower,
}

/// GPU acceleration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSettings {
    /// Enable GPU acceleration
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Report a capability error instead of using the CPU tier
    #[serde(default)]
    pub require_gpu: bool,
    #[serde(default)]
    pub power_preference: PowerPreference,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            require_gpu: false,
            power_preference: PowerPreference::default(),
        }
    }
}

/// Generation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Upper bound on new tokens; `None` uses each model's own budget
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_tokens: None,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .add_source(File::with_name(SYSTEM_CONFIG).required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        builder = builder.add_source(
            Environment::with_prefix("DRAFTLM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;
        config.apply_args(args);
        Ok(config)
    }

    /// Override with command line args
    pub fn apply_args(&mut self, args: &ConfigArgs) {
        if let Some(dir) = &args.cache_dir {
            self.cache.dir = Some(dir.clone());
        }
        if let Some(url) = &args.hub_url {
            self.hub.base_url = url.clone();
        }
        if let Some(token) = &args.token {
            self.hub.token = Some(token.clone());
        }
        if let Some(enabled) = args.gpu_enabled {
            self.gpu.enabled = enabled;
        }
        if args.require_gpu {
            self.gpu.require_gpu = true;
        }
    }
}

fn default_base_url() -> String {
    hub::DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    hub::USER_AGENT.to_string()
}

fn default_max_concurrent_downloads() -> usize {
    num_cpus::get().clamp(1, acquisition::MAX_CONCURRENT_DOWNLOADS)
}

fn default_progress_interval_ms() -> u64 {
    acquisition::PROGRESS_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    acquisition::MAX_ATTEMPTS
}

fn default_base_delay_ms() -> u64 {
    acquisition::BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    acquisition::MAX_DELAY_MS
}

fn default_true() -> bool {
    true
}

fn default_model() -> String {
    "lfm2-350m".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::load(&ConfigArgs::default()).unwrap();
        assert_eq!(config.hub.base_url, hub::DEFAULT_BASE_URL);
        assert_eq!(config.cache.progress_interval_ms, 500);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.gpu.enabled);
        assert!(!config.gpu.require_gpu);
        assert_eq!(config.generation.default_model, "lfm2-350m");
    }

    #[test]
    fn test_user_file_then_args() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[cache]\nmax_concurrent_downloads = 2\n\n[gpu]\npower_preference = \"low-power\"\n\n[hub]\nbase_url = \"https://mirror.example\""
        )
        .unwrap();

        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            hub_url: Some("https://override.example".to_string()),
            require_gpu: true,
            ..ConfigArgs::default()
        };
        let config = ServiceConfig::load(&args).unwrap();

        assert_eq!(config.cache.max_concurrent_downloads, 2);
        assert_eq!(config.gpu.power_preference, PowerPreference::LowPower);
        assert_eq!(config.hub.base_url, "https://override.example");
        assert!(config.gpu.require_gpu);
        // untouched sections keep defaults
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let settings = CacheSettings {
            dir: Some(PathBuf::from("/srv/weights")),
            ..CacheSettings::default()
        };
        assert_eq!(settings.resolved_dir(), PathBuf::from("/srv/weights"));
    }
}
