//! Retry policies per lifecycle operation

use crate::error::ConfigResult;
use crate::validation::{validate_retry_policy, Validatable};
use sandprobe_resilience::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One retry policy per operation family
///
/// Missing entries in a config file fall back to the defaults below. Inside
/// an entry, omitted budgets stay unset, so a policy that only names a
/// `time_limit` remains purely time-bounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Sandbox creation; a single attempt unless configured otherwise
    pub create: RetryPolicy,
    /// Connect by id, including implicit resume
    pub connect: RetryPolicy,
    /// Pause, retried through the not-yet-pausable window
    pub pause: RetryPolicy,
    pub kill: RetryPolicy,
    /// File reads after a resume
    pub read: RetryPolicy,
    /// Readiness probes
    pub probe: RetryPolicy,
    /// Waiting for a started process to appear in the process list
    pub visibility: RetryPolicy,
    /// Reattaching to a running process
    pub reattach: RetryPolicy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let secs = Duration::from_secs;
        Self {
            create: RetryPolicy::single_attempt(),
            connect: RetryPolicy::attempts(6, secs(1), secs(10)),
            pause: RetryPolicy::attempts(6, secs(1), secs(8)),
            kill: RetryPolicy::default().with_max_attempts(3),
            read: RetryPolicy::attempts(10, secs(1), secs(10)),
            probe: RetryPolicy::time_bounded(secs(30), Duration::from_millis(500)),
            visibility: RetryPolicy::attempts(6, secs(1), secs(8)),
            reattach: RetryPolicy::attempts(6, secs(1), secs(8)),
        }
    }
}

impl RetryConfig {
    fn policies(&self) -> [(&'static str, &RetryPolicy); 8] {
        [
            ("create", &self.create),
            ("connect", &self.connect),
            ("pause", &self.pause),
            ("kill", &self.kill),
            ("read", &self.read),
            ("probe", &self.probe),
            ("visibility", &self.visibility),
            ("reattach", &self.reattach),
        ]
    }
}

impl Validatable for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        for (name, policy) in self.policies() {
            validate_retry_policy(policy, name, self.domain_name())?;
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "retry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.create.max_attempts, Some(1));
        assert_eq!(config.connect.max_attempts, Some(6));
        assert_eq!(config.connect.max_delay, Duration::from_secs(10));
        assert_eq!(config.pause.max_delay, Duration::from_secs(8));
        assert_eq!(config.kill.max_attempts, Some(3));
        assert_eq!(config.read.max_attempts, Some(10));
        assert_eq!(config.probe.max_attempts, None);
        assert_eq!(config.probe.time_limit, Some(Duration::from_secs(30)));
        assert_eq!(config.probe.base_delay, Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
pause:
  max_attempts: 10
  base_delay: 2s
  max_delay: 16s
"#;
        let config: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pause.max_attempts, Some(10));
        assert_eq!(config.pause.base_delay, Duration::from_secs(2));
        assert_eq!(config.connect, RetryConfig::default().connect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_time_only_yaml_policy_has_no_attempt_cap() {
        let yaml = r#"
probe:
  time_limit: 30s
  base_delay: 500ms
  max_delay: 500ms
"#;
        let config: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.probe.max_attempts, None);
        assert_eq!(config.probe, RetryConfig::default().probe);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_policy_is_rejected() {
        let mut config = RetryConfig::default();
        config.read.base_delay = Duration::from_secs(20);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("read"));
    }
}
