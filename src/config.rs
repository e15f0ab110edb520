//! Configuration parsing and validation for genrelay.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::Path;
use std::time::Duration;

use crate::catalog::BackendDescriptor;

/// Convention env var consulted when `[upstream].api_key` is absent.
pub const CONVENTION_API_KEY_VAR: &str = "GENRELAY_API_KEY";

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub warmup: WarmupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Catalog override. Empty means the built-in catalog is used.
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Longest accepted `inputs` string, in characters
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_input_chars() -> usize {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

/// Hosted inference endpoint the backends live behind.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL; backend calls go to `{base_url}/models/{identifier}`
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer credential for outbound calls
    pub api_key: Option<ApiKey>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://api-inference.huggingface.co".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Per-client fixed window limits.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_quota")]
    pub quota: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_quota() -> u32 {
    10
}

fn default_window_ms() -> u64 {
    60_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            quota: default_quota(),
            window_ms: default_window_ms(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Retry, timeout and failover tuning for the dispatch engine.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Timeout of the first attempt against a backend
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,
    /// Added to the timeout for every further attempt on the same backend
    #[serde(default = "default_timeout_increment_ms")]
    pub timeout_increment_ms: u64,
    /// Attempts per backend while it reports itself busy/loading
    #[serde(default = "default_max_attempts_per_backend")]
    pub max_attempts_per_backend: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Pause before failing over after a non-busy, non-timeout error
    #[serde(default = "default_failover_delay_ms")]
    pub failover_delay_ms: u64,
    /// Consecutive failures that trigger the recovery probe
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_base_timeout_ms() -> u64 {
    30_000
}

fn default_timeout_increment_ms() -> u64 {
    10_000
}

fn default_max_attempts_per_backend() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    8_000
}

fn default_failover_delay_ms() -> u64 {
    250
}

fn default_failure_threshold() -> u32 {
    5
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: default_base_timeout_ms(),
            timeout_increment_ms: default_timeout_increment_ms(),
            max_attempts_per_backend: default_max_attempts_per_backend(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            failover_delay_ms: default_failover_delay_ms(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Background recovery sweep tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Sweeps allowed before the probe backs off for `cooldown_ms`
    #[serde(default = "default_max_sweeps")]
    pub max_sweeps: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_prompt")]
    pub probe_prompt: String,
}

fn default_max_sweeps() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    300_000
}

fn default_probe_timeout_ms() -> u64 {
    10_000
}

fn default_probe_prompt() -> String {
    "Hello".to_string()
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_sweeps: default_max_sweeps(),
            cooldown_ms: default_cooldown_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_prompt: default_probe_prompt(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    /// Cleaned answers shorter than this become the "needs more detail" fallback
    #[serde(default = "default_min_viable_chars")]
    pub min_viable_chars: usize,
}

fn default_min_viable_chars() -> usize {
    10
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_viable_chars: default_min_viable_chars(),
        }
    }
}

/// Priming dispatch run at startup and on `POST /warmup`.
#[derive(Debug, Clone, Deserialize)]
pub struct WarmupConfig {
    #[serde(default = "default_true")]
    pub on_start: bool,
    #[serde(default = "default_warmup_prompt")]
    pub prompt: String,
}

fn default_warmup_prompt() -> String {
    "What is the capital of France?".to_string()
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            on_start: true,
            prompt: default_warmup_prompt(),
        }
    }
}

/// API key wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    /// Access the raw key value. Every call site is auditable via `grep expose_secret`.
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

/// How the upstream API key was resolved.
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

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            rate_limit: RateLimitConfig::default(),
            dispatch: DispatchConfig::default(),
            recovery: RecoveryConfig::default(),
            normalizer: NormalizerConfig::default(),
            warmup: WarmupConfig::default(),
            logging: LoggingConfig::default(),
            backends: Vec::new(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string, without env expansion.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstream.base_url.is_empty() {
            return Err(ConfigError::Validation(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        if self.server.max_input_chars == 0 {
            return Err(ConfigError::Validation(
                "server.max_input_chars must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.quota == 0 || self.rate_limit.window_ms == 0 {
            return Err(ConfigError::Validation(
                "rate_limit.quota and rate_limit.window_ms must be positive".to_string(),
            ));
        }

        let dispatch = &self.dispatch;
        if dispatch.max_attempts_per_backend == 0 {
            return Err(ConfigError::Validation(
                "dispatch.max_attempts_per_backend must be at least 1".to_string(),
            ));
        }
        if dispatch.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "dispatch.failure_threshold must be at least 1".to_string(),
            ));
        }
        if dispatch.base_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "dispatch.base_timeout_ms must be positive".to_string(),
            ));
        }
        // Busy retries must wait strictly longer each time without clipping at the cap.
        if dispatch.max_attempts_per_backend >= 2 {
            let retries = dispatch.max_attempts_per_backend - 1;
            let largest = 2u64
                .checked_pow(retries - 1)
                .and_then(|factor| dispatch.backoff_base_ms.checked_mul(factor));
            match largest {
                Some(largest) if dispatch.backoff_base_ms > 0 && largest <= dispatch.backoff_cap_ms => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "dispatch.backoff_cap_ms ({}) must admit {} strictly increasing delays from backoff_base_ms ({})",
                        dispatch.backoff_cap_ms, retries, dispatch.backoff_base_ms
                    )));
                }
            }
        }

        if self.recovery.probe_prompt.trim().is_empty() {
            return Err(ConfigError::Validation(
                "recovery.probe_prompt must not be empty".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "Backend with empty id in [[backends]]".to_string(),
                ));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Backend '{}' is listed more than once",
                    backend.id
                )));
            }
        }

        if self.upstream.api_key.is_none() {
            tracing::warn!("No upstream API key configured - generation requests will be refused");
        }

        Ok(())
    }
}

/// Configuration errors.
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

    #[error("Environment variable '{var}' not set for {field}: {message}")]
    EnvVar {
        var: String,
        field: String,
        message: String,
    },
}

/// Raw upstream config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawUpstreamConfig {
    #[serde(default = "default_base_url")]
    base_url: String,
    api_key: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
}

impl Default for RawUpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    upstream: RawUpstreamConfig,
    #[serde(default)]
    rate_limit: RateLimitConfig,
    #[serde(default)]
    dispatch: DispatchConfig,
    #[serde(default)]
    recovery: RecoveryConfig,
    #[serde(default)]
    normalizer: NormalizerConfig,
    #[serde(default)]
    warmup: WarmupConfig,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    backends: Vec<BackendDescriptor>,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string (e.g., `${SCHEME}://${HOST}`).
/// Fails on first missing variable, unclosed `${`, or empty variable name.
fn expand_env_vars_with<F>(input: &str, field: &str, lookup: F) -> Result<String, ConfigError>
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
            field: field.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                field: field.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            field: field.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced in {})",
                var_name, field
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

impl Config {
    /// Convert raw (deserialized) config to final config with env var expansion.
    ///
    /// `lookup` resolves environment variables; production code passes
    /// `std::env::var`, tests pass a closure.
    pub fn from_raw_with<F>(raw: RawConfig, lookup: F) -> Result<(Self, KeySource), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (api_key, source) = match raw.upstream.api_key {
            Some(ref raw_key) if raw_key.contains("${") => {
                let expanded = expand_env_vars_with(raw_key, "upstream.api_key", &lookup)?;
                (Some(ApiKey::from(expanded)), KeySource::EnvExpanded)
            }
            Some(ref raw_key) => (Some(ApiKey::from(raw_key.as_str())), KeySource::Literal),
            None => match lookup(CONVENTION_API_KEY_VAR) {
                Some(value) if !value.is_empty() => (
                    Some(ApiKey::from(value)),
                    KeySource::Convention(CONVENTION_API_KEY_VAR.to_string()),
                ),
                _ => (None, KeySource::None),
            },
        };

        let base_url =
            expand_env_vars_with(&raw.upstream.base_url, "upstream.base_url", &lookup)?;

        let config = Config {
            server: raw.server,
            upstream: UpstreamConfig {
                base_url,
                api_key,
                connect_timeout_ms: raw.upstream.connect_timeout_ms,
            },
            rate_limit: raw.rate_limit,
            dispatch: raw.dispatch,
            recovery: raw.recovery,
            normalizer: raw.normalizer,
            warmup: raw.warmup,
            logging: raw.logging,
            backends: raw.backends,
        };

        Ok((config, source))
    }

    /// Parse a TOML string with environment variable expansion and validation.
    pub fn parse_str_with_env(content: &str) -> Result<(Self, KeySource), ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
        let (config, source) = Self::from_raw_with(raw, |name| std::env::var(name).ok())?;
        config.validate()?;
        Ok((config, source))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> Result<(Self, KeySource), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str_with_env(&content)
    }
}
