use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ac_core::config::{Config, ProviderEntry, ProviderKind};
use tracing::{info, warn};

use crate::http::OpenAiCompatibleAdapter;
use crate::provider::{ProviderAdapter, ScriptedProvider, StubProvider};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("default provider `{0}` is not registered")]
    DefaultMissing(String),
}

/// Named provider adapters plus the routing order used for fallbacks.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    /// Registration order, for stable listings.
    order: Vec<String>,
    default_provider: String,
    fallback_chain: Vec<String>,
}

impl ProviderRegistry {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            order: Vec::new(),
            default_provider: default_provider.into(),
            fallback_chain: Vec::new(),
        }
    }

    pub fn with_fallback_chain(mut self, chain: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fallback_chain = chain.into_iter().map(Into::into).collect();
        self
    }

    /// Build adapters for every enabled `[[providers]]` entry.
    ///
    /// An HTTP provider whose API key variable is unset is skipped with a
    /// warning, the same as a provider that failed to initialise. The default
    /// provider must survive this step.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let mut registry = Self::new(config.routing.default_provider.clone())
            .with_fallback_chain(config.routing.fallback_chain.iter().cloned());

        for entry in config.enabled_providers() {
            match build_adapter(entry, config.retry.call_timeout()) {
                Some(adapter) => {
                    info!(provider = %entry.name, kind = ?entry.kind, "registered provider");
                    registry.register(adapter);
                }
                None => warn!(provider = %entry.name, "provider skipped during bootstrap"),
            }
        }

        if !registry.contains(&registry.default_provider) {
            return Err(RegistryError::DefaultMissing(registry.default_provider.clone()));
        }
        Ok(registry)
    }

    /// Add or replace an adapter under its own name.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let name = adapter.name().to_string();
        if self.providers.insert(name.clone(), adapter).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered provider names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    pub fn fallback_chain(&self) -> &[String] {
        &self.fallback_chain
    }

    /// Providers to try for a run whose primary is `primary`: the primary
    /// first, then the configured fallbacks in order. Unregistered names and
    /// duplicates are dropped.
    pub fn chain_for(&self, primary: &str) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        for name in std::iter::once(primary).chain(self.fallback_chain.iter().map(String::as_str)) {
            if self.contains(name) && !chain.iter().any(|c| c == name) {
                chain.push(name.to_string());
            }
        }
        chain
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn build_adapter(entry: &ProviderEntry, call_timeout: Duration) -> Option<Arc<dyn ProviderAdapter>> {
    match entry.kind {
        ProviderKind::Scripted => Some(Arc::new(
            ScriptedProvider::new(entry.name.clone())
                .with_model(entry.default_model.clone())
                .with_latency(Duration::from_millis(entry.latency_ms))
                .failing_first(entry.fail_first),
        )),
        ProviderKind::Stub => Some(Arc::new(StubProvider::new(entry.name.clone()))),
        ProviderKind::OpenaiCompatible => {
            if entry.base_url.trim().is_empty() {
                warn!(provider = %entry.name, "openai_compatible provider has no base_url");
                return None;
            }
            let api_key = if entry.api_key_env.trim().is_empty() {
                None
            } else {
                match std::env::var(&entry.api_key_env) {
                    Ok(key) => Some(key),
                    Err(_) => {
                        warn!(
                            provider = %entry.name,
                            env = %entry.api_key_env,
                            "API key environment variable not set"
                        );
                        return None;
                    }
                }
            };
            Some(Arc::new(OpenAiCompatibleAdapter::new(
                entry.name.clone(),
                entry.base_url.clone(),
                api_key,
                entry.default_model.clone(),
                call_timeout,
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
