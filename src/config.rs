//! Configuration parsing and validation for switchyard.
//!
//! Targets are declared as partial records in TOML and merged over a fixed
//! default record, so a target only needs an `id` to be usable.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::router::{Algorithm, ErrorClass};

/// Default base address used when a target declares neither `url` nor `base_url`.
pub const DEFAULT_BASE_URL: &str = "https://api.oneapi.com";
/// Default model name injected into outbound payloads.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
/// Path appended to `base_url` when no explicit `url` is configured.
pub const DEFAULT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

const DEFAULT_WEIGHT: f64 = 1.0;
const DEFAULT_RPS_LIMIT: f64 = 2.0;
const DEFAULT_RPM_LIMIT: u32 = 120;
const DEFAULT_TPM_LIMIT: u64 = 1_000_000;
const DEFAULT_MIN_REQUEST_INTERVAL: f64 = 0.3;
const DEFAULT_SUCCESS_INTERVAL: f64 = 0.5;
const DEFAULT_RETRY_WAIT_TIME: f64 = 3.0;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_LOAD_WINDOW: f64 = 60.0;

/// Root configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub balancer: BalancerConfig,
    pub targets: Vec<TargetConfig>,
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Whole-request deadline in seconds, covering queueing and retries
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> f64 {
    600.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.request_timeout).unwrap_or(Duration::MAX)
    }
}

/// Dispatcher-wide settings.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Selection algorithm, fixed for the process lifetime.
    pub algorithm: Algorithm,
    /// Maximum simultaneous backend deliveries across all targets.
    pub concurrency_limit: usize,
    /// Ceiling on the accumulated "no target available" wait.
    pub max_wait: Duration,
    /// Capacity of each target's request and cost history.
    pub history_capacity: usize,
    /// Timeout for a single liveness probe (latency-probed selection only).
    pub probe_timeout: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::WeightedRandom,
            concurrency_limit: 10,
            max_wait: Duration::from_secs(300),
            history_capacity: 100,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Raw balancer section as written in TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RawBalancerConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_max_wait")]
    pub max_wait: f64,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: f64,
}

fn default_algorithm() -> String {
    Algorithm::WeightedRandom.as_str().to_string()
}

fn default_concurrency_limit() -> usize {
    10
}

fn default_max_wait() -> f64 {
    300.0
}

fn default_history_capacity() -> usize {
    100
}

fn default_probe_timeout() -> f64 {
    5.0
}

impl Default for RawBalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            concurrency_limit: default_concurrency_limit(),
            max_wait: default_max_wait(),
            history_capacity: default_history_capacity(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Only accessible via `.expose_secret()`, so every use is grep-auditable.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a target's API key was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Key was a literal string in config (no ${} references)
    Literal,
    /// Key contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Key was auto-discovered from convention env var (holds var name)
    Convention(String),
    /// No key available
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Per-error-class cooldowns. A zero duration disables the cooldown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cooldowns {
    pub too_many_requests: Duration,
    pub internal_error: Duration,
    pub bad_gateway: Duration,
    pub service_unavailable: Duration,
    pub forbidden: Duration,
}

impl Default for Cooldowns {
    fn default() -> Self {
        Self {
            too_many_requests: Duration::from_secs(60),
            internal_error: Duration::from_secs(5),
            bad_gateway: Duration::from_secs(5),
            service_unavailable: Duration::from_secs(5),
            forbidden: Duration::from_secs(15),
        }
    }
}

impl Cooldowns {
    /// Cooldown configured for `class`, if any.
    ///
    /// Transport failures and unclassified statuses never cool a target down.
    pub fn get(&self, class: ErrorClass) -> Option<Duration> {
        let duration = match class {
            ErrorClass::TooManyRequests => self.too_many_requests,
            ErrorClass::InternalError => self.internal_error,
            ErrorClass::BadGateway => self.bad_gateway,
            ErrorClass::ServiceUnavailable => self.service_unavailable,
            ErrorClass::Forbidden => self.forbidden,
            ErrorClass::Transport | ErrorClass::Other => return None,
        };
        (!duration.is_zero()).then_some(duration)
    }
}

/// Fully resolved, immutable policy for one backend target.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Unique identifier
    pub id: String,
    /// Optional bearer credential
    pub api_key: Option<ApiKey>,
    pub user_agent: String,
    /// Explicit endpoint; used only when it starts with `http`
    pub url: Option<String>,
    /// Base address for the default completions path and liveness probes
    pub base_url: String,
    /// Relative share for weighted random selection
    pub weight: f64,
    /// Model name injected into every outbound payload
    pub model: String,
    /// Requests per second (0 disables)
    pub rps_limit: f64,
    /// Requests per minute (0 disables)
    pub rpm_limit: u32,
    /// Cost units per minute (0 disables)
    pub tpm_limit: u64,
    /// Minimum gap between two requests
    pub min_request_interval: Duration,
    /// Minimum gap between a success and the next request
    pub success_interval: Duration,
    pub cooldowns: Cooldowns,
    /// Wait between delivery attempts
    pub retry_wait_time: Duration,
    /// Total delivery attempts per request
    pub max_retries: u32,
    /// Window used by windowed-load selection
    pub load_window: Duration,
    /// Liveness probe address for latency-probed selection
    pub latency_check_url: Option<String>,
}

impl TargetConfig {
    /// A target with every field at its default.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            api_key: None,
            user_agent: default_user_agent(),
            url: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            weight: DEFAULT_WEIGHT,
            model: DEFAULT_MODEL.to_string(),
            rps_limit: DEFAULT_RPS_LIMIT,
            rpm_limit: DEFAULT_RPM_LIMIT,
            tpm_limit: DEFAULT_TPM_LIMIT,
            min_request_interval: Duration::from_secs_f64(DEFAULT_MIN_REQUEST_INTERVAL),
            success_interval: Duration::from_secs_f64(DEFAULT_SUCCESS_INTERVAL),
            cooldowns: Cooldowns::default(),
            retry_wait_time: Duration::from_secs_f64(DEFAULT_RETRY_WAIT_TIME),
            max_retries: DEFAULT_MAX_RETRIES,
            load_window: Duration::from_secs_f64(DEFAULT_LOAD_WINDOW),
            latency_check_url: None,
        }
    }

    /// A target with every limit, interval and cooldown disabled.
    ///
    /// Handy as a starting point when only one constraint is under test.
    pub fn unlimited(id: impl Into<String>) -> Self {
        Self {
            rps_limit: 0.0,
            rpm_limit: 0,
            tpm_limit: 0,
            min_request_interval: Duration::ZERO,
            success_interval: Duration::ZERO,
            cooldowns: Cooldowns {
                too_many_requests: Duration::ZERO,
                internal_error: Duration::ZERO,
                bad_gateway: Duration::ZERO,
                service_unavailable: Duration::ZERO,
                forbidden: Duration::ZERO,
            },
            retry_wait_time: Duration::ZERO,
            ..Self::new(id)
        }
    }

    /// Merge a partial record over the default record.
    fn merge(
        index: usize,
        raw: RawTargetConfig,
        api_key: Option<ApiKey>,
    ) -> Result<Self, ConfigError> {
        let id = match raw.id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(ConfigError::MissingId { index }),
        };
        let label = format!("Target '{}'", id);
        let mut target = Self::new(id);
        let secs = |field: &str, value: f64| seconds(&label, field, value);

        target.api_key = api_key;
        if let Some(v) = raw.user_agent {
            target.user_agent = v;
        }
        target.url = raw.url;
        if let Some(v) = raw.base_url {
            target.base_url = v;
        }
        if let Some(v) = raw.weight {
            target.weight = v;
        }
        if let Some(v) = raw.model {
            target.model = v;
        }
        if let Some(v) = raw.rps_limit {
            if !v.is_finite() || v < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "Target '{}' has invalid rps_limit {}",
                    target.id, v
                )));
            }
            target.rps_limit = v;
        }
        if let Some(v) = raw.rpm_limit {
            target.rpm_limit = v;
        }
        if let Some(v) = raw.tpm_limit {
            target.tpm_limit = v;
        }
        if let Some(v) = raw.min_request_interval {
            target.min_request_interval = secs("min_request_interval", v)?;
        }
        if let Some(v) = raw.success_interval {
            target.success_interval = secs("success_interval", v)?;
        }
        if let Some(v) = raw.wait_429 {
            target.cooldowns.too_many_requests = secs("429_wait_time", v)?;
        }
        if let Some(v) = raw.wait_500 {
            target.cooldowns.internal_error = secs("500_wait_time", v)?;
        }
        if let Some(v) = raw.wait_502 {
            target.cooldowns.bad_gateway = secs("502_wait_time", v)?;
        }
        if let Some(v) = raw.wait_503 {
            target.cooldowns.service_unavailable = secs("503_wait_time", v)?;
        }
        if let Some(v) = raw.wait_403 {
            target.cooldowns.forbidden = secs("403_wait_time", v)?;
        }
        if let Some(v) = raw.retry_wait_time {
            target.retry_wait_time = secs("retry_wait_time", v)?;
        }
        if let Some(v) = raw.max_retries {
            target.max_retries = v;
        }
        if let Some(v) = raw.load_window {
            target.load_window = secs("load_window", v)?;
        }
        target.latency_check_url = raw.latency_check_url;

        Ok(target)
    }

    /// Address the chat completion is posted to.
    ///
    /// An explicit `url` wins only when it looks like an absolute HTTP URL;
    /// otherwise the default path is appended to `base_url`.
    pub fn endpoint(&self) -> String {
        match &self.url {
            Some(url) if url.starts_with("http") => url.clone(),
            _ => format!(
                "{}{}",
                self.base_url.trim_end_matches('/'),
                DEFAULT_COMPLETIONS_PATH
            ),
        }
    }

    /// Address used for liveness probes.
    pub fn probe_url(&self) -> &str {
        self.latency_check_url.as_deref().unwrap_or(&self.base_url)
    }
}

fn default_user_agent() -> String {
    concat!("switchyard/", env!("CARGO_PKG_VERSION")).to_string()
}

fn target_label(index: usize) -> String {
    format!("targets[{}]", index)
}

/// Convert a seconds value from config into a `Duration`.
fn seconds(target: &str, field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        ConfigError::Validation(format!(
            "{} has invalid {} '{}': expected a non-negative number of seconds",
            target, field, value
        ))
    })
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Target at position {index} has no id")]
    MissingId { index: usize },

    #[error("Duplicate target id '{0}'")]
    DuplicateTarget(String),

    #[error("Target '{target}' has invalid weight {weight}: weight must be a positive number")]
    InvalidWeight { target: String, weight: f64 },

    #[error("Unknown selection algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("Environment variable '{var}' not set for target '{target}': {message}")]
    EnvVar {
        var: String,
        target: String,
        message: String,
    },
}

/// Partial target record deserialized directly from TOML.
///
/// Every field is optional and falls back to the default record. `api_key`
/// may contain `${VAR}` references not yet expanded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTargetConfig {
    pub id: Option<String>,
    pub api_key: Option<String>,
    pub user_agent: Option<String>,
    pub url: Option<String>,
    pub base_url: Option<String>,
    pub weight: Option<f64>,
    pub model: Option<String>,
    pub rps_limit: Option<f64>,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u64>,
    #[serde(alias = "mrr")]
    pub min_request_interval: Option<f64>,
    #[serde(alias = "sri")]
    pub success_interval: Option<f64>,
    #[serde(rename = "429_wait_time")]
    pub wait_429: Option<f64>,
    #[serde(rename = "500_wait_time")]
    pub wait_500: Option<f64>,
    #[serde(rename = "502_wait_time")]
    pub wait_502: Option<f64>,
    #[serde(rename = "503_wait_time")]
    pub wait_503: Option<f64>,
    #[serde(rename = "403_wait_time")]
    pub wait_403: Option<f64>,
    pub retry_wait_time: Option<f64>,
    pub max_retries: Option<u32>,
    pub load_window: Option<f64>,
    pub latency_check_url: Option<String>,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub balancer: RawBalancerConfig,
    #[serde(default)]
    pub targets: Vec<RawTargetConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}/v1`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(
    input: &str,
    target_id: &str,
    lookup: F,
) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            target: target_id.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                target: target_id.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            target: target_id.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in target '{}')",
                var_name, target_id
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn expand_env_vars(input: &str, target_id: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, target_id, |name| std::env::var(name).ok())
}

/// Derive the convention-based env var name for a target.
///
/// - "alpha" -> "SWITCHYARD_ALPHA_API_KEY"
/// - "target-beta" -> "SWITCHYARD_TARGET_BETA_API_KEY"
pub fn convention_env_var_name(target_id: &str) -> String {
    let upper_snake = target_id.to_uppercase().replace(['-', ' ', '.'], "_");
    format!("SWITCHYARD_{}_API_KEY", upper_snake)
}

fn convention_key_lookup(target_id: &str) -> Option<(String, String)> {
    let var_name = convention_env_var_name(target_id);
    std::env::var(&var_name).ok().map(|value| (var_name, value))
}

/// Resolve a raw `api_key` value into a key and its source.
fn resolve_api_key(
    target_id: &str,
    raw_key: Option<&str>,
) -> Result<(Option<ApiKey>, KeySource), ConfigError> {
    Ok(match raw_key {
        Some(raw_key) if raw_key.contains("${") => {
            let expanded = expand_env_vars(raw_key, target_id)?;
            (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
        }
        Some(raw_key) => (Some(ApiKey::from(raw_key)), KeySource::Literal),
        None => match convention_key_lookup(target_id) {
            Some((var_name, value)) => (Some(ApiKey::from(value)), KeySource::Convention(var_name)),
            None => (None, KeySource::None),
        },
    })
}

impl Config {
    /// Convert raw (deserialized) config to final config.
    ///
    /// Merges every target over the default record, resolves API keys and
    /// parses the algorithm tag. Returns per-target key source information.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let mut targets = Vec::with_capacity(raw.targets.len());
        let mut key_sources = Vec::with_capacity(raw.targets.len());

        for (index, rt) in raw.targets.into_iter().enumerate() {
            let label = rt.id.clone().unwrap_or_else(|| target_label(index));
            let (api_key, source) = resolve_api_key(&label, rt.api_key.as_deref())?;
            let target = TargetConfig::merge(index, rt, api_key)?;
            key_sources.push((target.id.clone(), source));
            targets.push(target);
        }

        let rb = raw.balancer;
        let algorithm = Algorithm::from_str(&rb.algorithm)?;
        let balancer = BalancerConfig {
            algorithm,
            concurrency_limit: rb.concurrency_limit,
            max_wait: seconds("balancer", "max_wait", rb.max_wait)?,
            history_capacity: rb.history_capacity,
            probe_timeout: seconds("balancer", "probe_timeout", rb.probe_timeout)?,
        };

        let config = Config {
            server: raw.server,
            balancer,
            targets,
            logging: raw.logging,
        };
        config.validate()?;

        Ok((config, key_sources))
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::from_raw(raw).map(|(config, _)| config)
    }

    /// Load configuration from a TOML file with environment variable expansion.
    ///
    /// Returns the config and per-target key source information.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(String, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content)?;
        Self::from_raw(raw)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.balancer.concurrency_limit == 0 {
            return Err(ConfigError::Validation(
                "balancer.concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.balancer.history_capacity == 0 {
            return Err(ConfigError::Validation(
                "balancer.history_capacity must be at least 1".to_string(),
            ));
        }

        crate::router::validate_targets(&self.targets)
    }
}
