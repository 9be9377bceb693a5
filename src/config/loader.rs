use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;

use super::types::GlobalConfig;

const CONFIG_FILE: &str = "sentinel.yaml";

const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "./sentinel.yaml",
    "./config/sentinel.yaml",
];

const SYSTEM_CONFIG_PATH: &str = "/etc/sentinel/sentinel.yaml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from various sources with fallbacks
    pub fn load() -> Result<GlobalConfig> {
        Self::load_with_custom_path(None)
    }

    /// Load configuration with a custom path, then apply environment overrides.
    pub fn load_with_custom_path(custom_path: Option<&Path>) -> Result<GlobalConfig> {
        let mut config = Self::load_file(custom_path)?;
        Self::apply_env(&mut config, |key| std::env::var(key).ok());
        Self::validate_config(&config)?;
        Ok(config)
    }

    fn load_file(custom_path: Option<&Path>) -> Result<GlobalConfig> {
        if let Some(path) = custom_path {
            if path.exists() {
                return Self::load_from_file(path)
                    .with_context(|| format!("Failed to load config from custom path: {:?}", path));
            }
            tracing::warn!("Custom config path does not exist: {:?}, falling back to defaults", path);
        }

        for path in Self::search_paths() {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(config) => {
                    tracing::info!("Loaded configuration from: {:?}", path);
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!("Failed to load config from {:?}: {:#}", path, e);
                }
            }
        }

        tracing::info!("No configuration file found, using default settings");
        Ok(GlobalConfig::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect();
        if let Some(dirs) = ProjectDirs::from("", "", "sentinel-live") {
            paths.push(dirs.config_dir().join(CONFIG_FILE));
        }
        paths.push(PathBuf::from(SYSTEM_CONFIG_PATH));
        paths
    }

    /// Load configuration from a specific file
    fn load_from_file(path: &Path) -> Result<GlobalConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: GlobalConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML config: {:?}", path))?;

        Self::validate_config(&config)?;
        Ok(config)
    }

    fn apply_env(config: &mut GlobalConfig, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("SENTINEL_API_URL") {
            config.backend.api_url = url;
        }
        if let Some(url) = var("SENTINEL_DATA_URL") {
            config.data.rest_url = url;
        }
        if let Some(key) = var("SENTINEL_DATA_KEY") {
            config.data.api_key = Some(key);
        }
    }

    /// Validate configuration values
    fn validate_config(config: &GlobalConfig) -> Result<()> {
        if config.backend.api_url.trim().is_empty() {
            anyhow::bail!("backend.api_url cannot be empty");
        }

        if config.data.rest_url.trim().is_empty() {
            anyhow::bail!("data.rest_url cannot be empty");
        }

        let live = &config.live;
        if live.poll_interval_ms == 0 {
            anyhow::bail!("live.poll_interval_ms must be greater than 0");
        }

        if live.event_limit == 0 {
            anyhow::bail!("live.event_limit must be greater than 0");
        }

        if live.stale_after_ms < live.poll_interval_ms {
            anyhow::bail!("live.stale_after_ms must be at least live.poll_interval_ms");
        }

        if live.fetch_timeout_ms == 0 {
            anyhow::bail!("live.fetch_timeout_ms must be greater than 0");
        }

        if live.render_interval_ms == 0 {
            anyhow::bail!("live.render_interval_ms must be greater than 0");
        }

        if let Some(level) = &config.logging.level {
            if config.logging.level().is_none() {
                anyhow::bail!("logging.level {:?} is not a known level", level);
            }
        }

        Ok(())
    }

    /// Write a fully populated default configuration
    pub fn generate_template(path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(&GlobalConfig::default())
            .context("Failed to serialize configuration to YAML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }
}
