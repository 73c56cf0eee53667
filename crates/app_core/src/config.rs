//! Application configuration

use crate::AppError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`LoaderConfig::worker_threads`].
pub const ENV_LOADER_THREADS: &str = "QUICKVIEW_LOADER_THREADS";
/// Environment variable overriding [`CacheConfig::soft_limit_mb`].
pub const ENV_CACHE_LIMIT_MB: &str = "QUICKVIEW_CACHE_LIMIT_MB";
/// Environment variable overriding [`CacheConfig::sweep_interval_ticks`].
pub const ENV_SWEEP_INTERVAL: &str = "QUICKVIEW_SWEEP_INTERVAL";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub loader: LoaderConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Number of decode workers. `None` uses the host's hardware concurrency.
    pub worker_threads: Option<usize>,
}

impl LoaderConfig {
    /// Effective worker count, never less than one.
    pub fn worker_count(&self) -> usize {
        self.worker_threads
            .filter(|&n| n > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Soft memory budget for decoded images, in megabytes.
    pub soft_limit_mb: u64,
    /// Run the eviction sweep once every this many render ticks.
    pub sweep_interval_ticks: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            soft_limit_mb: 128,
            sweep_interval_ticks: 30,
        }
    }
}

impl CacheConfig {
    /// Soft limit in cost units (bytes).
    pub fn soft_limit_bytes(&self) -> u64 {
        self.soft_limit_mb.saturating_mul(1024 * 1024)
    }
}

impl AppConfig {
    /// Load configuration from file, then apply environment overrides.
    ///
    /// An unreadable file falls back to the defaults; an invalid environment
    /// override is an error.
    pub fn load() -> Result<Self, AppError> {
        Self::resolve(&Self::config_path(), |name| std::env::var(name).ok())
    }

    fn resolve(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::load_file(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load configuration, using defaults: {}", e);
            Self::default()
        });
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    fn load_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Using default configuration");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> PathBuf {
        ProjectDirs::from("com", "QuickView", "QuickView")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("./config.toml"))
    }

    /// Apply `QUICKVIEW_*` environment variables on top of the current values.
    pub fn apply_env_overrides(&mut self) -> Result<(), AppError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Either every override applies or, on a bad value, none does.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), AppError> {
        let threads = parse_var::<usize>(&lookup, ENV_LOADER_THREADS)?;
        let limit = parse_var::<u64>(&lookup, ENV_CACHE_LIMIT_MB)?;
        let interval = parse_var::<u32>(&lookup, ENV_SWEEP_INTERVAL)?;

        if let Some(threads) = threads {
            self.loader.worker_threads = Some(threads);
        }
        if let Some(limit) = limit {
            self.cache.soft_limit_mb = limit;
        }
        if let Some(interval) = interval {
            self.cache.sweep_interval_ticks = interval.max(1);
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, AppError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| AppError::Config(format!("{} has invalid value {:?}", name, raw))),
    }
}
