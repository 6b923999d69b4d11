//! Domain-driven configuration for sandprobe
//!
//! Configuration is split by functional domain (API access, sandbox
//! defaults, retry policies, logging), loaded from YAML and/or `E2B_*`
//! environment variables, and validated before use.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    api::ApiConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    retry::RetryConfig,
    sandbox::SandboxDefaults,
    SandprobeConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration;
