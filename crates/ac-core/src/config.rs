use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration, usually loaded from `conduit.toml`.
///
/// Every section is optional; a missing section falls back to its defaults.
/// API keys are never stored here, only the name of the environment
/// variable holding them (see [`ProviderEntry::api_key_env`]).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub pricing: Vec<PricingEntry>,
}

impl Config {
    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not expressible via types.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;

        let mut seen = HashSet::new();
        for entry in &self.providers {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::Validation("provider name must not be empty".into()));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate provider name `{}`",
                    entry.name
                )));
            }
        }

        if !self.providers.is_empty() {
            let default_enabled = self
                .providers
                .iter()
                .any(|p| p.enabled && p.name == self.routing.default_provider);
            if !default_enabled {
                return Err(ConfigError::Validation(format!(
                    "routing.default_provider `{}` is not an enabled provider",
                    self.routing.default_provider
                )));
            }
        }
        Ok(())
    }

    /// Enabled provider entries, in declaration order.
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pipelines executing at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

impl QueueConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Validation("queue.concurrency must be >= 1".into()));
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per provider, including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound on a single adapter call.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            factor: default_factor(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation("retry.max_attempts must be >= 1".into()));
        }
        if !(self.factor >= 1.0) {
            return Err(ConfigError::Validation("retry.factor must be >= 1.0".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Validation("retry.call_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_factor() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    10_000
}
fn default_call_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an opened circuit rejects calls before allowing a trial.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Applied to the cooldown each time a half-open trial fails.
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: f64,
    #[serde(default = "default_max_cooldown_ms")]
    pub max_cooldown_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            cooldown_multiplier: default_cooldown_multiplier(),
            max_cooldown_ms: default_max_cooldown_ms(),
        }
    }
}

impl CircuitConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit_breaker.failure_threshold must be >= 1".into(),
            ));
        }
        if !(self.cooldown_multiplier >= 1.0) {
            return Err(ConfigError::Validation(
                "circuit_breaker.cooldown_multiplier must be >= 1.0".into(),
            ));
        }
        if self.max_cooldown_ms < self.cooldown_ms {
            return Err(ConfigError::Validation(
                "circuit_breaker.max_cooldown_ms must be >= cooldown_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_cooldown_multiplier() -> f64 {
    2.0
}
fn default_max_cooldown_ms() -> u64 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_provider_name")]
    pub default_provider: String,
    /// Providers tried, in order, after the primary is exhausted or blocked.
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider_name(),
            fallback_chain: Vec::new(),
        }
    }
}

fn default_provider_name() -> String {
    "primary".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Deterministic in-process provider, used for dry runs and tests.
    #[default]
    Scripted,
    /// Any `/v1/chat/completions` endpoint.
    OpenaiCompatible,
    /// Placeholder that always reports "not configured".
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    #[serde(default = "default_model_name")]
    pub default_model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Scripted providers fail this many calls before succeeding.
    #[serde(default)]
    pub fail_first: u32,
    /// Scripted providers sleep this long per call.
    #[serde(default)]
    pub latency_ms: u64,
}

impl ProviderEntry {
    pub fn new(name: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default_model: default_model_name(),
            base_url: String::new(),
            api_key_env: String::new(),
            enabled: true,
            fail_first: 0,
            latency_ms: 0,
        }
    }
}

fn default_model_name() -> String {
    "default".into()
}
fn default_true() -> bool {
    true
}

/// Per-million-token prices for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingEntry {
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
