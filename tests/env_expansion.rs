//! Integration tests for the full Config::from_file_with_env pipeline.
//!
//! TOML file -> raw parse -> default merge -> key resolution -> final Config
//! with KeySource metadata. Each test uses its own env var names to avoid
//! parallel test interference.

use std::io::Write;
use std::time::Duration;
use switchyard::config::{Config, ConfigError, KeySource};
use switchyard::router::Algorithm;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp config");
    file.write_all(content.as_bytes())
        .expect("Failed to write temp config");
    file
}

fn source_of<'a>(key_sources: &'a [(String, KeySource)], id: &str) -> &'a KeySource {
    key_sources
        .iter()
        .find(|(target, _)| target == id)
        .map(|(_, s)| s)
        .unwrap_or_else(|| panic!("Key source for '{}' should exist", id))
}

#[test]
fn test_env_expansion_resolves_var() {
    let var_name = "SWITCHYARD_TEST_E2E_01_KEY";
    unsafe { std::env::set_var(var_name, "sk-resolved") };

    let file = write_config(&format!(
        r#"
[[targets]]
id = "env-test"
api_key = "${{{}}}"
"#,
        var_name
    ));

    let (config, key_sources) = tokio_test::assert_ok!(Config::from_file_with_env(file.path()));

    let target = config
        .targets
        .iter()
        .find(|t| t.id == "env-test")
        .expect("Target 'env-test' should exist");
    assert_eq!(
        target.api_key.as_ref().unwrap().expose_secret(),
        "sk-resolved"
    );
    assert_eq!(*source_of(&key_sources, "env-test"), KeySource::EnvExpanded);

    unsafe { std::env::remove_var(var_name) };
}

#[test]
fn test_env_expansion_missing_var_errors() {
    let var_name = "SWITCHYARD_TEST_E2E_02_MISSING";
    unsafe { std::env::remove_var(var_name) };

    let file = write_config(&format!(
        r#"
[[targets]]
id = "missing-test"
api_key = "${{{}}}"
"#,
        var_name
    ));

    let err = tokio_test::assert_err!(Config::from_file_with_env(file.path())).to_string();
    assert!(err.contains(var_name), "Error should name the variable: {}", err);
    assert!(
        err.contains("missing-test"),
        "Error should name the target: {}",
        err
    );
}

#[test]
fn test_env_convention_discovers_key() {
    let var_name = "SWITCHYARD_CONV_TARGET_API_KEY";
    unsafe { std::env::set_var(var_name, "sk-convention") };

    let file = write_config(
        r#"
[[targets]]
id = "conv-target"
"#,
    );

    let (config, key_sources) = tokio_test::assert_ok!(Config::from_file_with_env(file.path()));
    assert_eq!(
        config.targets[0].api_key.as_ref().unwrap().expose_secret(),
        "sk-convention"
    );
    assert_eq!(
        *source_of(&key_sources, "conv-target"),
        KeySource::Convention(var_name.to_string())
    );

    unsafe { std::env::remove_var(var_name) };
}

#[test]
fn test_env_no_key_produces_none_source() {
    unsafe { std::env::remove_var("SWITCHYARD_NOKEY_TARGET_API_KEY") };

    let file = write_config(
        r#"
[[targets]]
id = "nokey-target"
"#,
    );

    let (config, key_sources) = tokio_test::assert_ok!(Config::from_file_with_env(file.path()));
    assert!(config.targets[0].api_key.is_none());
    assert_eq!(*source_of(&key_sources, "nokey-target"), KeySource::None);
}

#[test]
fn test_full_file_round_trip() {
    let file = write_config(
        r#"
[server]
listen = "0.0.0.0:9100"
request_timeout = 45

[balancer]
algorithm = "dynamic_least_load"
concurrency_limit = 3
max_wait = 20
probe_timeout = 1.5

[logging]
level = "debug"

[[targets]]
id = "primary"
api_key = "sk-literal"
base_url = "https://primary.example.com"
model = "gpt-4o"
weight = 2
rps_limit = 10
rpm_limit = 300
tpm_limit = 50000
mrr = 0.1
sri = 0
429_wait_time = 30
403_wait_time = 0
retry_wait_time = 1
max_retries = 3
load_window = 30

[[targets]]
id = "secondary"
url = "None"
latency_check_url = "https://status.example.com/ping"
"#,
    );

    let (config, key_sources) = tokio_test::assert_ok!(Config::from_file_with_env(file.path()));

    assert_eq!(config.server.listen, "0.0.0.0:9100");
    assert_eq!(config.server.request_timeout(), Duration::from_secs(45));
    assert_eq!(config.balancer.algorithm, Algorithm::DynamicLeastLoad);
    assert_eq!(config.balancer.concurrency_limit, 3);
    assert_eq!(config.balancer.max_wait, Duration::from_secs(20));
    assert_eq!(config.balancer.probe_timeout, Duration::from_millis(1500));
    assert_eq!(config.logging.level, "debug");

    let primary = &config.targets[0];
    assert_eq!(primary.endpoint(), "https://primary.example.com/v1/chat/completions");
    assert_eq!(primary.weight, 2.0);
    assert_eq!(primary.rpm_limit, 300);
    assert_eq!(primary.tpm_limit, 50_000);
    assert_eq!(primary.min_request_interval, Duration::from_millis(100));
    assert!(primary.success_interval.is_zero());
    assert_eq!(primary.cooldowns.too_many_requests, Duration::from_secs(30));
    assert!(primary.cooldowns.forbidden.is_zero());
    assert_eq!(primary.max_retries, 3);
    assert_eq!(primary.load_window, Duration::from_secs(30));
    assert_eq!(*source_of(&key_sources, "primary"), KeySource::Literal);

    let secondary = &config.targets[1];
    assert_eq!(
        secondary.endpoint(),
        "https://api.oneapi.com/v1/chat/completions"
    );
    assert_eq!(secondary.probe_url(), "https://status.example.com/ping");
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::from_file_with_env(dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let file = write_config("[[targets]\nid = ");
    let err = Config::from_file_with_env(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}
