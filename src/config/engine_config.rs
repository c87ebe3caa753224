//! Engine configuration file handling
//!
//! Loads and manages ~/.config/collectkit/config.yaml. The request knobs can
//! be overridden by the `API_RETRY`, `API_TIMEOUT` and `API_REQUESTS_PER_HOUR`
//! environment variables.

use super::connection::ConnectionConfig;
use super::validation::validate_config_result;
use crate::{CollectError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries per request after the first attempt
    #[serde(default = "default_api_retry")]
    pub api_retry: u32,

    /// Per-request transport timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    /// Default hourly budget for connections without their own
    #[serde(default = "default_requests_per_hour")]
    pub api_requests_per_hour: u32,

    /// SQLite database holding all three layers
    #[serde(default = "default_database")]
    pub database: PathBuf,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

fn default_api_retry() -> u32 {
    3
}

fn default_api_timeout() -> u64 {
    120
}

fn default_requests_per_hour() -> u32 {
    18000
}

fn default_database() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("collectkit");
    path.push("collect.db");
    path
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_retry: default_api_retry(),
            api_timeout_secs: default_api_timeout(),
            api_requests_per_hour: default_requests_per_hour(),
            database: default_database(),
            connections: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from the default location; see [`Self::load_checked`]
    pub fn load_default() -> Result<Self> {
        Self::load_checked(Self::default_path())
    }

    /// Load, apply environment overrides, then validate the result
    ///
    /// Overrides are applied first so that e.g. `API_REQUESTS_PER_HOUR=0`
    /// is rejected like a zero budget in the file.
    pub fn load_checked(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        validate_config_result(&config)?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(CollectError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading engine configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;

        tracing::debug!(
            connections = config.connections.len(),
            api_retry = config.api_retry,
            requests_per_hour = config.api_requests_per_hour,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Save configuration to a file, creating parent directories
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;

        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Default config location (~/.config/collectkit/config.yaml)
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("collectkit");
        path.push("config.yaml");
        path
    }

    /// Apply `API_RETRY`, `API_TIMEOUT` and `API_REQUESTS_PER_HOUR`
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("API_RETRY") {
            self.api_retry = parse_override("API_RETRY", &v)?;
        }
        if let Some(v) = lookup("API_TIMEOUT") {
            self.api_timeout_secs = parse_override("API_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("API_REQUESTS_PER_HOUR") {
            self.api_requests_per_hour = parse_override("API_REQUESTS_PER_HOUR", &v)?;
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn get_connection(&self, id: u64) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.id == id)
    }

    pub fn add_connection(&mut self, connection: ConnectionConfig) {
        self.connections.retain(|c| c.id != connection.id);
        self.connections.push(connection);
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CollectError::Config(format!("Invalid value for {}: '{}'", key, value)))
}
