pub mod config;
pub mod run;

use std::path::Path;

use ac_core::config::{Config, ProviderEntry, ProviderKind};
use anyhow::Context;

/// Load `path`, or fall back to the built-in dry-run configuration.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(dry_run_config()),
    }
}

/// Defaults plus two scripted providers, `primary` falling back to
/// `secondary`.
fn dry_run_config() -> Config {
    let mut config = Config::default();
    config.routing.default_provider = "primary".into();
    config.routing.fallback_chain = vec!["secondary".into()];
    config.providers = vec![
        ProviderEntry::new("primary", ProviderKind::Scripted),
        ProviderEntry::new("secondary", ProviderKind::Scripted),
    ];
    config
}
