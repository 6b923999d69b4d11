//! REST client configuration

use sandprobe_config::ApiConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Control-plane client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Base URL of the sandbox API; endpoint paths are appended to its path
    pub base_url: String,

    /// Sent as `X-API-Key`
    pub api_key: Option<String>,

    /// Request timeout
    pub timeout: Duration,

    /// User agent string
    pub user_agent: String,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self::from(ApiConfig::default())
    }
}

impl From<ApiConfig> for RestConfig {
    fn from(config: ApiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            timeout: config.request_timeout,
            user_agent: config.user_agent,
        }
    }
}
