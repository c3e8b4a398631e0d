use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use ac_core::config::{CircuitConfig, RetryConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::provider::{ProviderErrorKind, ProviderResponse};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Returned instead of calling a provider whose circuit is blocking traffic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    /// The circuit is open, or half-open with its single trial already in
    /// flight. `retry_in` is the remaining cooldown (zero while a trial runs).
    #[error("circuit for `{provider}` is open, refusing call (retry in {retry_in:?})")]
    Open { provider: String, retry_in: Duration },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation, all calls pass through.
    Closed,
    /// Too many consecutive failures, calls are rejected until cooldown ends.
    Open,
    /// Cooldown elapsed, exactly one trial call is allowed through.
    HalfOpen,
}

/// Point-in-time view of one provider's circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            cooldown_until: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial is allowed.
    pub cooldown: Duration,
    /// Growth applied to the cooldown after a failed trial.
    pub cooldown_multiplier: f64,
    pub max_cooldown: Duration,
    /// Maximum duration for an individual call.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from_config(&CircuitConfig::default(), &RetryConfig::default())
    }
}

impl CircuitBreakerConfig {
    pub fn from_config(circuit: &CircuitConfig, retry: &RetryConfig) -> Self {
        Self {
            failure_threshold: circuit.failure_threshold.max(1),
            cooldown: circuit.cooldown(),
            cooldown_multiplier: circuit.cooldown_multiplier.max(1.0),
            max_cooldown: circuit.max_cooldown().max(circuit.cooldown()),
            call_timeout: retry.call_timeout(),
        }
    }

    fn extended(&self, current: Duration) -> Duration {
        current.mul_f64(self.cooldown_multiplier).min(self.max_cooldown)
    }
}

// ---------------------------------------------------------------------------
// Per-provider state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    open_until: Option<Instant>,
    cooldown_until: Option<DateTime<Utc>>,
    /// Cooldown to apply the next time the circuit opens.
    cooldown: Duration,
}

impl BreakerState {
    fn closed(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            open_until: None,
            cooldown_until: None,
            cooldown,
        }
    }

    fn open_for(&mut self, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.cooldown = cooldown;
        self.open_until = Some(Instant::now() + cooldown);
        self.cooldown_until = chrono::Duration::from_std(cooldown)
            .ok()
            .map(|d| Utc::now() + d);
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_at: self.last_failure_at,
            cooldown_until: self.cooldown_until,
        }
    }
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Trial,
}

// ---------------------------------------------------------------------------
// CircuitBreakerRegistry
// ---------------------------------------------------------------------------

/// Process-wide circuit breakers keyed by provider name.
///
/// Each provider's state lives behind its own map entry, so check-and-update
/// is serialized per provider while different providers never contend. The
/// registry is meant to be shared by reference (`Arc`) with every executing
/// task; it is not a global.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    states: DashMap<String, BreakerState>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute `f` against `provider` through its circuit breaker.
    ///
    /// If the circuit is **Open** and the cooldown has not elapsed, or a
    /// half-open trial is already running, the call is rejected without
    /// invoking `f`. Once the cooldown has elapsed the circuit moves to
    /// **HalfOpen** and this call becomes the single trial. A call that
    /// outlives `call_timeout` is reported as a timeout failure.
    pub async fn call<F, Fut>(
        &self,
        provider: &str,
        f: F,
    ) -> Result<ProviderResponse, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ProviderResponse>,
    {
        let admission = self.admit(provider)?;
        let mut guard = CallGuard {
            registry: self,
            provider,
            admission,
            settled: false,
        };

        let response = match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(response) => response,
            Err(_elapsed) => ProviderResponse::failure(
                ProviderErrorKind::Timeout,
                format!("call timed out after {:?}", self.config.call_timeout),
            ),
        };

        guard.settled = true;
        if response.is_success() {
            self.record_success(provider, admission);
        } else {
            self.record_failure(provider, admission);
        }
        Ok(response)
    }

    fn admit(&self, provider: &str) -> Result<Admission, CircuitBreakerError> {
        let mut entry = self
            .states
            .entry(provider.to_string())
            .or_insert_with(|| BreakerState::closed(self.config.cooldown));
        let state = entry.value_mut();

        match state.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen => Err(CircuitBreakerError::Open {
                provider: provider.to_string(),
                retry_in: Duration::ZERO,
            }),
            CircuitState::Open => {
                let now = Instant::now();
                match state.open_until {
                    Some(until) if now < until => Err(CircuitBreakerError::Open {
                        provider: provider.to_string(),
                        retry_in: until - now,
                    }),
                    _ => {
                        info!(provider, "circuit breaker transitioning Open -> HalfOpen");
                        state.state = CircuitState::HalfOpen;
                        Ok(Admission::Trial)
                    }
                }
            }
        }
    }

    fn record_success(&self, provider: &str, admission: Admission) {
        let Some(mut entry) = self.states.get_mut(provider) else {
            return;
        };
        let state = entry.value_mut();
        match (state.state, admission) {
            (CircuitState::HalfOpen, Admission::Trial) => {
                info!(provider, "circuit breaker transitioning HalfOpen -> Closed");
                *state = BreakerState::closed(self.config.cooldown);
            }
            (CircuitState::Closed, _) => {
                state.consecutive_failures = 0;
            }
            // A late success from a call admitted before the circuit opened
            // does not close it; only a trial can.
            _ => {}
        }
    }

    fn record_failure(&self, provider: &str, admission: Admission) {
        let Some(mut entry) = self.states.get_mut(provider) else {
            return;
        };
        let state = entry.value_mut();
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Utc::now());

        match (state.state, admission) {
            (CircuitState::Closed, _) => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        provider,
                        failures = state.consecutive_failures,
                        cooldown = ?self.config.cooldown,
                        "circuit breaker transitioning Closed -> Open"
                    );
                    state.open_for(self.config.cooldown);
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                let cooldown = self.config.extended(state.cooldown);
                warn!(
                    provider,
                    cooldown = ?cooldown,
                    "circuit breaker transitioning HalfOpen -> Open (trial failed)"
                );
                state.open_for(cooldown);
            }
            _ => { /* already open */ }
        }
    }

    /// Current state of one provider (closed if never seen).
    pub fn state(&self, provider: &str) -> CircuitState {
        self.states
            .get(provider)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        self.states
            .get(provider)
            .map(|s| s.snapshot())
            .unwrap_or_default()
    }

    /// Snapshot of every provider this registry has seen.
    pub fn status(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Force `provider` closed with zero failures. Idempotent.
    pub fn reset(&self, provider: &str) {
        self.states.insert(
            provider.to_string(),
            BreakerState::closed(self.config.cooldown),
        );
        info!(provider, "circuit breaker manually reset");
    }

    pub fn reset_all(&self) {
        for mut entry in self.states.iter_mut() {
            *entry.value_mut() = BreakerState::closed(self.config.cooldown);
        }
        info!("all circuit breakers manually reset");
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Settles an admitted call as a failure if its future is dropped or panics
/// before reporting, so a half-open trial can never stay in flight forever.
struct CallGuard<'a> {
    registry: &'a CircuitBreakerRegistry,
    provider: &'a str,
    admission: Admission,
    settled: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(provider = self.provider, "provider call abandoned before completion");
            self.registry.record_failure(self.provider, self.admission);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
