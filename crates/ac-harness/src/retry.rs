//! Retry and cross-provider fallback.
//!
//! [`RetryOrchestrator::call_with_retry`] walks the fallback chain for a
//! primary provider. Each provider gets its own attempt budget with
//! exponential backoff between attempts; a provider whose circuit is open is
//! skipped without spending any of that budget. Every retry and every switch
//! of provider is reported to an [`AttemptObserver`] before it happens, so
//! callers can log and trace "retrying" separately from "switching".

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ac_core::config::RetryConfig;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreakerError, CircuitBreakerRegistry, CircuitSnapshot};
use crate::provider::{ProviderFailure, ProviderResponse, Usage};
use crate::registry::ProviderRegistry;

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per provider, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: cfg.base_delay(),
            factor: cfg.factor.max(1.0),
            max_delay: cfg.max_delay(),
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): `base * factor^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt notifications
// ---------------------------------------------------------------------------

/// Why an attempt did not produce a response.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Provider(ProviderFailure),
    /// The provider was skipped without a call.
    CircuitOpen { retry_in: Duration },
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Provider(failure) => write!(f, "{failure}"),
            AttemptFailure::CircuitOpen { retry_in } => {
                write!(f, "circuit open (retry in {retry_in:?})")
            }
        }
    }
}

/// What the orchestrator does next after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    /// Retry the same provider after `delay`.
    Retry { delay: Duration },
    /// Switch to provider `to`.
    Fallback { to: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptEvent {
    pub provider: String,
    /// Attempts spent on `provider` so far (0 for a circuit-open skip).
    pub attempt: u32,
    /// Provider calls made across the whole chain so far.
    pub total_attempts: u32,
    pub failure: AttemptFailure,
    pub next: NextStep,
}

impl AttemptEvent {
    /// The provider about to be tried, when this event is a switch.
    pub fn next_provider(&self) -> Option<&str> {
        match &self.next {
            NextStep::Fallback { to } => Some(to),
            NextStep::Retry { .. } => None,
        }
    }
}

/// Receives every retry and fallback decision before it is acted on.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn on_attempt(&self, event: &AttemptEvent);
}

/// Observer that ignores everything.
pub struct NoopObserver;

#[async_trait]
impl AttemptObserver for NoopObserver {
    async fn on_attempt(&self, _event: &AttemptEvent) {}
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub usage: Option<Usage>,
    pub used_provider: String,
    pub model: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryError {
    #[error("all providers exhausted after {attempts} attempts: {summary}")]
    Exhausted { attempts: u32, summary: String },
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
    #[error("no registered provider for `{0}`")]
    UnknownProvider(String),
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts } => {
                *attempts
            }
            RetryError::UnknownProvider(_) => 0,
        }
    }
}

// ---------------------------------------------------------------------------
// RetryOrchestrator
// ---------------------------------------------------------------------------

/// Drives provider calls through retries, circuit breakers, and fallbacks.
pub struct RetryOrchestrator {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            breakers,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `primary` (then its fallbacks) until one succeeds.
    ///
    /// `model` applies to the primary; fallback providers use their own
    /// default model. `cancel` is checked before every attempt and cuts
    /// backoff sleeps short, but an in-flight provider call always runs to
    /// completion.
    pub async fn call_with_retry(
        &self,
        primary: &str,
        prompt: &str,
        model: &str,
        observer: &dyn AttemptObserver,
        cancel: &CancellationToken,
    ) -> Result<Completion, RetryError> {
        let chain = self.registry.chain_for(primary);
        if chain.is_empty() {
            return Err(RetryError::UnknownProvider(primary.to_string()));
        }

        let mut total_attempts = 0u32;
        let mut failures: Vec<String> = Vec::new();

        for (idx, name) in chain.iter().enumerate() {
            let Some(adapter) = self.registry.get(name) else {
                continue;
            };
            let next_provider = chain.get(idx + 1);
            let model = if idx == 0 {
                model.to_string()
            } else {
                adapter.default_model().to_string()
            };
            let mut provider_attempts = 0u32;

            loop {
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled {
                        attempts: total_attempts,
                    });
                }

                let failure = match self
                    .breakers
                    .call(name, || adapter.call(prompt, &model))
                    .await
                {
                    Err(CircuitBreakerError::Open { retry_in, .. }) => {
                        debug!(provider = %name, ?retry_in, "circuit open, skipping provider");
                        failures.push(format!("{name}: circuit open"));
                        if let Some(to) = next_provider {
                            observer
                                .on_attempt(&AttemptEvent {
                                    provider: name.clone(),
                                    attempt: provider_attempts,
                                    total_attempts,
                                    failure: AttemptFailure::CircuitOpen { retry_in },
                                    next: NextStep::Fallback { to: to.clone() },
                                })
                                .await;
                        }
                        break;
                    }
                    Ok(ProviderResponse::Success { content, usage }) => {
                        total_attempts += 1;
                        return Ok(Completion {
                            content,
                            usage,
                            used_provider: name.clone(),
                            model,
                            attempts: total_attempts,
                        });
                    }
                    Ok(ProviderResponse::Failure(failure)) => failure,
                };

                total_attempts += 1;
                provider_attempts += 1;
                warn!(
                    provider = %name,
                    attempt = provider_attempts,
                    error = %failure,
                    "provider call failed"
                );

                let budget_left = failure.kind.is_retryable()
                    && provider_attempts < self.policy.max_attempts;
                if budget_left {
                    let delay = self.policy.delay_after(provider_attempts);
                    observer
                        .on_attempt(&AttemptEvent {
                            provider: name.clone(),
                            attempt: provider_attempts,
                            total_attempts,
                            failure: AttemptFailure::Provider(failure),
                            next: NextStep::Retry { delay },
                        })
                        .await;
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: total_attempts });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }

                failures.push(format!("{name}: {failure}"));
                if let Some(to) = next_provider {
                    observer
                        .on_attempt(&AttemptEvent {
                            provider: name.clone(),
                            attempt: provider_attempts,
                            total_attempts,
                            failure: AttemptFailure::Provider(failure),
                            next: NextStep::Fallback { to: to.clone() },
                        })
                        .await;
                }
                break;
            }
        }

        Err(RetryError::Exhausted {
            attempts: total_attempts,
            summary: failures.join("; "),
        })
    }

    /// Convenience wrapper with no observer and no cancellation.
    pub async fn call(
        &self,
        primary: &str,
        prompt: &str,
        model: &str,
    ) -> Result<Completion, RetryError> {
        let cancel = CancellationToken::new();
        self.call_with_retry(primary, prompt, model, &NoopObserver, &cancel)
            .await
    }

    // -----------------------------------------------------------------------
    // Administrative operations
    // -----------------------------------------------------------------------

    /// Snapshot of every registered provider's circuit (plus any other
    /// provider the breakers have seen).
    pub fn get_circuit_status(&self) -> BTreeMap<String, CircuitSnapshot> {
        let mut status = self.breakers.status();
        for name in self.registry.names() {
            status.entry(name.clone()).or_default();
        }
        status
    }

    pub fn reset_circuit(&self, provider: &str) {
        self.breakers.reset(provider);
    }

    pub fn reset_all_circuits(&self) {
        self.breakers.reset_all();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
