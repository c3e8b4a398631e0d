use ac_core::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, EnvFilter};

fn filter_for(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging with human-readable output.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "ac_harness=debug,warn").
///
/// Safe to call multiple times (e.g. in tests); later calls are no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    fmt()
        .with_env_filter(filter_for(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (human-readable)");
}

/// Initialize logging with one JSON object per line.
///
/// Same filter rules as [`init_logging`]; later calls are no-ops.
pub fn init_logging_json(service_name: &str, default_level: &str) {
    fmt()
        .json()
        .with_env_filter(filter_for(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_current_span(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::debug!(service = service_name, "logging initialised (json)");
}

/// Initialize logging from the `[logging]` config section.
pub fn init_from_config(service_name: &str, config: &LoggingConfig) {
    match config.format {
        LogFormat::Pretty => init_logging(service_name, &config.level),
        LogFormat::Json => init_logging_json(service_name, &config.level),
    }
}
