//! Integration tests for sandprobe-config

use sandprobe_config::*;
use std::io::Write;
use std::time::Duration;
use temp_env::with_vars;

const ALL_VARS: [&str; 7] = [
    "E2B_API_KEY",
    "E2B_API_URL",
    "E2B_TEMPLATE_ID",
    "E2B_SANDBOX_TIMEOUT",
    "E2B_REQUEST_TIMEOUT",
    "E2B_LOG_LEVEL",
    "E2B_LOG_FORMAT",
];

/// Every `E2B_*` variable unset except the given overrides
fn env_with(overrides: &[(&'static str, &'static str)]) -> Vec<(&'static str, Option<&'static str>)> {
    ALL_VARS
        .iter()
        .map(|name| {
            let value = overrides
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| *value);
            (*name, value)
        })
        .collect()
}

#[test]
fn test_default_config_validation() {
    let config = SandprobeConfig::default();
    assert!(config.validate_all().is_ok());
}

#[test]
fn test_config_loader_from_env() {
    let vars = env_with(&[
        ("E2B_API_KEY", "e2b_test_key"),
        ("E2B_TEMPLATE_ID", "python-3.11"),
        ("E2B_SANDBOX_TIMEOUT", "120"),
        ("E2B_LOG_LEVEL", "debug"),
        ("E2B_LOG_FORMAT", "json"),
    ]);

    with_vars(vars, || {
        let config = ConfigLoader::new().from_env().unwrap();

        assert_eq!(config.api.api_key.as_deref(), Some("e2b_test_key"));
        assert_eq!(config.sandbox.template, "python-3.11");
        assert_eq!(config.sandbox.timeout, Duration::from_secs(120));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    });
}

#[test]
fn test_empty_env_values_are_ignored() {
    let vars = env_with(&[("E2B_TEMPLATE_ID", "")]);

    with_vars(vars, || {
        let config = ConfigLoader::new().from_env().unwrap();
        assert_eq!(config.sandbox.template, "base");
    });
}

#[test]
fn test_invalid_env_values() {
    let vars = env_with(&[("E2B_SANDBOX_TIMEOUT", "ten minutes")]);
    with_vars(vars, || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EnvError(_)));
    });

    let vars = env_with(&[("E2B_API_URL", "not a url")]);
    with_vars(vars, || {
        let err = ConfigLoader::new().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::DomainError { .. }));
    });
}

#[test]
fn test_custom_prefix() {
    with_vars(
        [("SBX_TEMPLATE_ID", Some("desktop")), ("E2B_TEMPLATE_ID", None)],
        || {
            let config = ConfigLoader::with_prefix("SBX").from_env().unwrap();
            assert_eq!(config.sandbox.template, "desktop");
        },
    );
}

#[test]
fn test_yaml_config_serialization() {
    let yaml = SandprobeConfig::generate_sample();
    let parsed: SandprobeConfig = serde_yaml::from_str(&yaml).unwrap();
    assert!(parsed.validate_all().is_ok());
    assert_eq!(parsed.retry, RetryConfig::default());
}

#[test]
fn test_comprehensive_config_file() {
    let yaml = r#"
api:
  base_url: "http://127.0.0.1:3000"
  request_timeout: 5

sandbox:
  template: "code-interpreter"
  timeout: 300
  allow_internet_access: false

retry:
  connect:
    max_attempts: 3
    base_delay: 500ms
    max_delay: 2s
  probe:
    time_limit: 1m
    base_delay: 1s
    max_delay: 1s

logging:
  level: warn
  format: compact
"#;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    with_vars(env_with(&[]), || {
        let config = ConfigLoader::new().from_file(file.path()).unwrap();

        assert_eq!(config.api.base_url, "http://127.0.0.1:3000");
        assert_eq!(config.api.request_timeout, Duration::from_secs(5));
        assert_eq!(config.sandbox.template, "code-interpreter");
        assert!(!config.sandbox.allow_internet_access);
        assert_eq!(config.retry.connect.max_attempts, Some(3));
        assert_eq!(config.retry.connect.base_delay, Duration::from_millis(500));
        assert_eq!(config.retry.probe.time_limit, Some(Duration::from_secs(60)));
        assert_eq!(config.retry.probe.max_attempts, None);
        assert_eq!(config.retry.pause, RetryConfig::default().pause);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.logging.format, LogFormat::Compact);
    });
}

#[test]
fn test_env_overrides_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"sandbox:\n  template: from-file\n").unwrap();

    let vars = env_with(&[("E2B_TEMPLATE_ID", "from-env")]);
    with_vars(vars, || {
        let config = ConfigLoader::new().load(Some(file.path())).unwrap();
        assert_eq!(config.sandbox.template, "from-env");
    });
}

#[test]
fn test_unbounded_retry_policy_in_file_is_rejected() {
    let yaml = r#"
retry:
  kill:
    max_attempts: null
    time_limit: null
"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(yaml.as_bytes()).unwrap();

    with_vars(env_with(&[]), || {
        let err = ConfigLoader::new().from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("kill"));
    });
}
