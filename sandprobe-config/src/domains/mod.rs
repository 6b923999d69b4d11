//! Domain-specific configuration modules

pub mod api;
pub mod logging;
pub mod retry;
pub mod sandbox;
pub mod utils;

use crate::error::ConfigResult;
use crate::validation::Validatable;
use serde::{Deserialize, Serialize};

/// Main sandprobe configuration combining all domains
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SandprobeConfig {
    /// Control-plane API access
    #[serde(default)]
    pub api: api::ApiConfig,

    /// Sandbox defaults
    #[serde(default)]
    pub sandbox: sandbox::SandboxDefaults,

    /// Retry policies per operation
    #[serde(default)]
    pub retry: retry::RetryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: logging::LoggingConfig,
}

impl SandprobeConfig {
    /// Validate all domain configurations
    pub fn validate_all(&self) -> ConfigResult<()> {
        self.api.validate()?;
        self.sandbox.validate()?;
        self.retry.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = SandprobeConfig::default();
        serde_yaml::to_string(&config)
            .unwrap_or_else(|_| "# Failed to generate sample config".to_string())
    }
}
