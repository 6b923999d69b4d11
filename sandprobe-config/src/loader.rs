//! Configuration loading and environment variable handling

use crate::domains::logging::{LogFormat, LogLevel};
use crate::domains::SandprobeConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with the `E2B` prefix
    pub fn new() -> Self {
        Self {
            prefix: "E2B".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<SandprobeConfig> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config: SandprobeConfig = serde_yaml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration file");

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<SandprobeConfig> {
        let mut config = SandprobeConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<SandprobeConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut SandprobeConfig) -> ConfigResult<()> {
        if let Some(api_key) = self.get_env_var("API_KEY") {
            config.api.api_key = Some(api_key);
        }

        if let Some(url) = self.get_env_var("API_URL") {
            config.api.base_url = url;
        }

        if let Some(timeout) = self.get_env_var("REQUEST_TIMEOUT") {
            config.api.request_timeout = parse_seconds("REQUEST_TIMEOUT", &timeout)?;
        }

        if let Some(template) = self.get_env_var("TEMPLATE_ID") {
            config.sandbox.template = template;
        }

        if let Some(timeout) = self.get_env_var("SANDBOX_TIMEOUT") {
            config.sandbox.timeout = parse_seconds("SANDBOX_TIMEOUT", &timeout)?;
        }

        if let Some(log_level) = self.get_env_var("LOG_LEVEL") {
            config.logging.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Some(format) = self.get_env_var("LOG_FORMAT") {
            config.logging.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get a non-empty environment variable with prefix
    fn get_env_var(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}_{}", self.prefix, name))
            .ok()
            .filter(|value| !value.trim().is_empty())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_seconds(name: &str, value: &str) -> ConfigResult<Duration> {
    let seconds: u64 = value
        .trim()
        .parse()
        .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e)))?;
    Ok(Duration::from_secs(seconds))
}
