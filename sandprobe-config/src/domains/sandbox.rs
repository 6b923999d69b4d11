//! Sandbox defaults

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Defaults applied to sandboxes created or connected by a lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxDefaults {
    /// Template identifier used when none is given
    #[serde(default = "default_template")]
    pub template: String,

    /// Sandbox lifetime requested on create
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_timeout"
    )]
    pub timeout: Duration,

    #[serde(default = "crate::domains::utils::default_true")]
    pub allow_internet_access: bool,

    /// Lifetime re-armed on connect
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_timeout"
    )]
    pub connect_timeout: Duration,

    /// Timeout for attaching to a running process
    #[serde(
        with = "crate::domains::utils::serde_duration",
        default = "default_process_connect_timeout"
    )]
    pub process_connect_timeout: Duration,
}

impl Default for SandboxDefaults {
    fn default() -> Self {
        Self {
            template: default_template(),
            timeout: default_timeout(),
            allow_internet_access: true,
            connect_timeout: default_timeout(),
            process_connect_timeout: default_process_connect_timeout(),
        }
    }
}

impl Validatable for SandboxDefaults {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.template, "template", self.domain_name())?;
        validate_positive(self.timeout.as_secs(), "timeout", self.domain_name())?;
        validate_positive(self.connect_timeout.as_secs(), "connect_timeout", self.domain_name())?;
        validate_positive(
            self.process_connect_timeout.as_secs(),
            "process_connect_timeout",
            self.domain_name(),
        )?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "sandbox"
    }
}

// Default value functions
fn default_template() -> String {
    "base".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_process_connect_timeout() -> Duration {
    Duration::from_secs(10)
}
