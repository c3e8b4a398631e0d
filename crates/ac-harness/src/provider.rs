//! Uniform provider adapter contract.
//!
//! Every external AI provider is reached through [`ProviderAdapter::call`],
//! which takes a prompt and a model name and always returns a
//! [`ProviderResponse`]. Adapters never return `Err` and never panic on
//! provider faults: network errors, auth failures, rate limits, and
//! timeouts are all folded into [`ProviderResponse::Failure`].
//!
//! # Validation at the boundary
//!
//! Providers that hand back loosely-typed payloads should deserialize into
//! [`RawProviderResponse`] and convert with [`ProviderResponse::from_raw`].
//! Nothing past that point has to deal with a "success" that carries no
//! content or a "failure" with no explanation.
//!
//! # Example
//!
//! ```rust
//! use ac_harness::provider::{ProviderAdapter, ProviderResponse, ScriptedProvider};
//!
//! # async fn demo() {
//! let provider = ScriptedProvider::new("primary");
//! match provider.call("hello", "default").await {
//!     ProviderResponse::Success { content, .. } => println!("{content}"),
//!     ProviderResponse::Failure(f) => println!("failed: {f}"),
//! }
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Category of an adapter-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Connection, DNS, TLS, or transport failure.
    Network,
    /// Credentials rejected by the provider.
    Auth,
    /// Provider asked us to slow down.
    RateLimited,
    /// No answer within the allotted time.
    Timeout,
    /// The provider answered with something we could not interpret.
    InvalidResponse,
    /// The adapter has no usable configuration.
    NotConfigured,
    Other,
}

impl ProviderErrorKind {
    /// Whether retrying the same provider can plausibly help.
    ///
    /// Auth and configuration failures do not heal between attempts, so the
    /// orchestrator moves straight to the next provider for those.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderErrorKind::Auth | ProviderErrorKind::NotConfigured)
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProviderErrorKind::Network => "network",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Timeout => "timeout",
            ProviderErrorKind::InvalidResponse => "invalid_response",
            ProviderErrorKind::NotConfigured => "not_configured",
            ProviderErrorKind::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// A failed provider call, as reported by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFailure {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderFailure {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Token usage reported by a provider.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Provider-computed cost in USD, when the provider reports one.
    #[serde(default)]
    pub cost_estimate: Option<f64>,
}

/// Outcome of one adapter call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderResponse {
    Success {
        content: String,
        usage: Option<Usage>,
    },
    Failure(ProviderFailure),
}

impl ProviderResponse {
    pub fn success(content: impl Into<String>) -> Self {
        ProviderResponse::Success {
            content: content.into(),
            usage: None,
        }
    }

    pub fn success_with_usage(content: impl Into<String>, usage: Usage) -> Self {
        ProviderResponse::Success {
            content: content.into(),
            usage: Some(usage),
        }
    }

    pub fn failure(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        ProviderResponse::Failure(ProviderFailure::new(kind, message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProviderResponse::Success { .. })
    }

    /// Validate a loosely-typed payload into a well-formed response.
    pub fn from_raw(raw: RawProviderResponse) -> Self {
        if raw.success {
            match raw.content {
                Some(content) => ProviderResponse::Success {
                    content,
                    usage: raw.usage,
                },
                None => ProviderResponse::failure(
                    ProviderErrorKind::InvalidResponse,
                    "provider reported success without content",
                ),
            }
        } else {
            match raw.error {
                Some(message) if !message.trim().is_empty() => {
                    ProviderResponse::failure(ProviderErrorKind::Other, message)
                }
                _ => ProviderResponse::failure(
                    ProviderErrorKind::InvalidResponse,
                    "provider reported failure without an error message",
                ),
            }
        }
    }
}

/// Untrusted response shape as it arrives from an external provider.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawProviderResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

/// The one call every provider integration exposes.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry key for this provider.
    fn name(&self) -> &str;

    /// Model used when this provider is reached through a fallback.
    fn default_model(&self) -> &str;

    /// Send `prompt` to `model`. Must not panic on provider faults.
    async fn call(&self, prompt: &str, model: &str) -> ProviderResponse;
}

// ---------------------------------------------------------------------------
// StubProvider
// ---------------------------------------------------------------------------

/// Placeholder for a provider that has no concrete integration yet.
/// Every call reports [`ProviderErrorKind::NotConfigured`].
#[derive(Debug, Clone)]
pub struct StubProvider {
    provider_name: String,
}

impl StubProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            provider_name: name.into(),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for StubProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn default_model(&self) -> &str {
        "none"
    }

    async fn call(&self, _prompt: &str, _model: &str) -> ProviderResponse {
        ProviderResponse::failure(
            ProviderErrorKind::NotConfigured,
            format!(
                "{} provider is not configured, install a concrete adapter",
                self.provider_name
            ),
        )
    }
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

/// Deterministic in-process provider.
///
/// Pops responses from a script in order; once the script is empty every
/// call gets the fallback response. Tracks call counts and the peak number
/// of concurrent calls, which makes it the workhorse for dry runs and tests.
pub struct ScriptedProvider {
    provider_name: String,
    model: String,
    script: Mutex<VecDeque<ProviderResponse>>,
    fallback: ProviderResponse,
    latency: Duration,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    models_seen: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    /// A provider that always succeeds.
    pub fn new(name: impl Into<String>) -> Self {
        let provider_name = name.into();
        let fallback = ProviderResponse::success_with_usage(
            format!("response from {provider_name}"),
            Usage {
                input_tokens: 100,
                output_tokens: 50,
                cost_estimate: None,
            },
        );
        Self {
            provider_name,
            model: "default".into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            models_seen: Mutex::new(Vec::new()),
        }
    }

    /// A provider whose every call fails with `kind`.
    pub fn always_failing(name: impl Into<String>, kind: ProviderErrorKind) -> Self {
        let mut provider = Self::new(name);
        provider.fallback = ProviderResponse::failure(kind, "scripted failure");
        provider
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue responses to hand out before falling back.
    pub fn with_script(self, responses: impl IntoIterator<Item = ProviderResponse>) -> Self {
        self.script
            .lock()
            .expect("ScriptedProvider lock poisoned")
            .extend(responses);
        self
    }

    /// Fail the first `n` calls with a network error.
    pub fn failing_first(self, n: u32) -> Self {
        let failures = (0..n).map(|i| {
            ProviderResponse::failure(
                ProviderErrorKind::Network,
                format!("scripted failure {}", i + 1),
            )
        });
        self.with_script(failures)
    }

    pub fn with_fallback(mut self, response: ProviderResponse) -> Self {
        self.fallback = response;
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed executing at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn models_seen(&self) -> Vec<String> {
        self.models_seen
            .lock()
            .expect("ScriptedProvider lock poisoned")
            .clone()
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn call(&self, _prompt: &str, model: &str) -> ProviderResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.models_seen
            .lock()
            .expect("ScriptedProvider lock poisoned")
            .push(model.to_string());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let next = self
            .script
            .lock()
            .expect("ScriptedProvider lock poisoned")
            .pop_front();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
