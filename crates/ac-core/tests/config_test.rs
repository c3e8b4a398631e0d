use std::io::Write;
use std::time::Duration;

use ac_core::config::*;

const SAMPLE: &str = r#"
[logging]
level = "debug"
format = "json"

[queue]
concurrency = 2

[retry]
max_attempts = 4
base_delay_ms = 100
factor = 3.0

[circuit_breaker]
failure_threshold = 2
cooldown_ms = 1000
max_cooldown_ms = 8000

[routing]
default_provider = "alpha"
fallback_chain = ["beta"]

[[providers]]
name = "alpha"
kind = "openai_compatible"
default_model = "gpt-4o-mini"
base_url = "https://api.example.test"
api_key_env = "ALPHA_KEY"

[[providers]]
name = "beta"
kind = "scripted"
fail_first = 1
latency_ms = 20

[[pricing]]
model = "gpt-4o-mini"
input_per_million = 0.15
output_per_million = 0.60
"#;

#[test]
fn parses_full_document() {
    let cfg = Config::from_toml_str(SAMPLE).unwrap();
    assert_eq!(cfg.logging.format, LogFormat::Json);
    assert_eq!(cfg.queue.concurrency, 2);
    assert_eq!(cfg.retry.max_attempts, 4);
    assert_eq!(cfg.retry.base_delay(), Duration::from_millis(100));
    // unspecified keys keep their defaults
    assert_eq!(cfg.retry.max_delay_ms, 10_000);
    assert_eq!(cfg.circuit_breaker.failure_threshold, 2);
    assert_eq!(cfg.circuit_breaker.cooldown_multiplier, 2.0);
    assert_eq!(cfg.routing.fallback_chain, vec!["beta".to_string()]);
    assert_eq!(cfg.providers.len(), 2);
    assert_eq!(cfg.providers[0].kind, ProviderKind::OpenaiCompatible);
    assert_eq!(cfg.providers[1].fail_first, 1);
    assert!(cfg.providers[1].enabled);
    assert_eq!(cfg.providers[1].default_model, "default");
    assert_eq!(cfg.pricing.len(), 1);
}

#[test]
fn empty_document_is_defaults() {
    let cfg = Config::from_toml_str("").unwrap();
    assert_eq!(cfg.queue.concurrency, 4);
    assert_eq!(cfg.routing.default_provider, "primary");
    assert!(cfg.providers.is_empty());
}

#[test]
fn zero_concurrency_is_rejected() {
    let err = Config::from_toml_str("[queue]\nconcurrency = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn duplicate_provider_names_are_rejected() {
    let text = r#"
[routing]
default_provider = "a"

[[providers]]
name = "a"

[[providers]]
name = "a"
"#;
    let err = Config::from_toml_str(text).unwrap_err();
    assert!(err.to_string().contains("duplicate"));
}

#[test]
fn default_provider_must_be_enabled() {
    let text = r#"
[routing]
default_provider = "a"

[[providers]]
name = "a"
enabled = false
"#;
    assert!(Config::from_toml_str(text).is_err());
}

#[test]
fn malformed_toml_is_parse_error() {
    let err = Config::from_toml_str("[queue\nconcurrency = ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn load_from_file_and_roundtrip() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();

    let cfg = Config::load_from(file.path()).unwrap();
    let text = cfg.to_toml().unwrap();
    let back = Config::from_toml_str(&text).unwrap();
    assert_eq!(back.providers.len(), 2);
    assert_eq!(back.routing.default_provider, "alpha");
}

#[test]
fn missing_file_is_io_error() {
    let err = Config::load_from("/definitely/not/here/conduit.toml").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}
