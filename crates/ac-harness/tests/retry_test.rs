use std::sync::{Arc, Mutex};
use std::time::Duration;

use ac_harness::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use ac_harness::provider::{ProviderErrorKind, ProviderResponse, ScriptedProvider};
use ac_harness::registry::ProviderRegistry;
use ac_harness::retry::{
    AttemptEvent, AttemptFailure, AttemptObserver, NextStep, RetryError, RetryOrchestrator,
    RetryPolicy,
};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

fn policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(500),
        factor: 2.0,
        max_delay: Duration::from_secs(10),
    }
}

fn breaker_config(failure_threshold: u32) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold,
        cooldown: Duration::from_secs(30),
        cooldown_multiplier: 2.0,
        max_cooldown: Duration::from_secs(300),
        call_timeout: Duration::from_secs(60),
    }
}

fn orchestrator(
    primary: Arc<ScriptedProvider>,
    secondary: Arc<ScriptedProvider>,
    failure_threshold: u32,
) -> RetryOrchestrator {
    let mut registry = ProviderRegistry::new("primary").with_fallback_chain(["secondary"]);
    registry.register(primary);
    registry.register(secondary);
    RetryOrchestrator::new(
        Arc::new(registry),
        Arc::new(CircuitBreakerRegistry::new(breaker_config(failure_threshold))),
        policy(),
    )
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<AttemptEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<AttemptEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttemptObserver for Recorder {
    async fn on_attempt(&self, event: &AttemptEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Cancels the run as soon as the first retry is announced.
struct CancelOnFirstEvent(CancellationToken);

#[async_trait]
impl AttemptObserver for CancelOnFirstEvent {
    async fn on_attempt(&self, _event: &AttemptEvent) {
        self.0.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn retries_then_succeeds_on_primary() {
    let primary = Arc::new(ScriptedProvider::new("primary").failing_first(2));
    let secondary = Arc::new(ScriptedProvider::new("secondary"));
    let orch = orchestrator(primary.clone(), secondary.clone(), 10);
    let recorder = Recorder::default();

    let done = orch
        .call_with_retry("primary", "goal", "m-1", &recorder, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.used_provider, "primary");
    assert_eq!(done.model, "m-1");
    assert_eq!(done.attempts, 3);
    assert_eq!(primary.call_count(), 3);
    assert_eq!(secondary.call_count(), 0);

    let delays: Vec<_> = recorder
        .events()
        .into_iter()
        .map(|e| e.next)
        .collect();
    assert_eq!(
        delays,
        vec![
            NextStep::Retry { delay: Duration::from_millis(500) },
            NextStep::Retry { delay: Duration::from_millis(1_000) },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn falls_back_with_fallback_default_model() {
    let primary = Arc::new(ScriptedProvider::always_failing(
        "primary",
        ProviderErrorKind::Network,
    ));
    let secondary = Arc::new(ScriptedProvider::new("secondary").with_model("backup-model"));
    let orch = orchestrator(primary.clone(), secondary.clone(), 10);
    let recorder = Recorder::default();

    let done = orch
        .call_with_retry("primary", "goal", "m-1", &recorder, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(done.used_provider, "secondary");
    assert_eq!(done.model, "backup-model");
    assert_eq!(done.attempts, 4);
    assert_eq!(secondary.models_seen(), vec!["backup-model"]);

    let events = recorder.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].next_provider(), Some("secondary"));
    assert_eq!(events[2].attempt, 3);
}

#[tokio::test(start_paused = true)]
async fn auth_failure_skips_straight_to_fallback() {
    let primary = Arc::new(ScriptedProvider::always_failing(
        "primary",
        ProviderErrorKind::Auth,
    ));
    let secondary = Arc::new(ScriptedProvider::new("secondary"));
    let orch = orchestrator(primary.clone(), secondary.clone(), 10);

    let done = orch.call("primary", "goal", "m").await.unwrap();

    assert_eq!(primary.call_count(), 1);
    assert_eq!(done.used_provider, "secondary");
    assert_eq!(done.attempts, 2);
}

#[tokio::test]
async fn open_circuit_is_skipped_without_spending_attempts() {
    let primary = Arc::new(ScriptedProvider::new("primary"));
    let secondary = Arc::new(ScriptedProvider::new("secondary"));
    let orch = orchestrator(primary.clone(), secondary.clone(), 1);

    let _ = orch
        .breakers()
        .call("primary", || async {
            ProviderResponse::failure(ProviderErrorKind::Network, "down")
        })
        .await;
    assert_eq!(orch.breakers().state("primary"), CircuitState::Open);

    let recorder = Recorder::default();
    let done = orch
        .call_with_retry("primary", "goal", "m", &recorder, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(primary.call_count(), 0);
    assert_eq!(done.used_provider, "secondary");
    assert_eq!(done.attempts, 1);

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].attempt, 0);
    assert!(matches!(events[0].failure, AttemptFailure::CircuitOpen { .. }));
}

#[tokio::test(start_paused = true)]
async fn exhaustion_reports_every_provider() {
    let primary = Arc::new(ScriptedProvider::always_failing(
        "primary",
        ProviderErrorKind::RateLimited,
    ));
    let secondary = Arc::new(ScriptedProvider::always_failing(
        "secondary",
        ProviderErrorKind::Timeout,
    ));
    let orch = orchestrator(primary, secondary, 10);

    let err = orch.call("primary", "goal", "m").await.unwrap_err();
    match err {
        RetryError::Exhausted { attempts, summary } => {
            assert_eq!(attempts, 6);
            assert!(summary.contains("primary: rate_limited"));
            assert!(summary.contains("secondary: timeout"));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_before_first_attempt() {
    let primary = Arc::new(ScriptedProvider::new("primary"));
    let secondary = Arc::new(ScriptedProvider::new("secondary"));
    let orch = orchestrator(primary.clone(), secondary, 10);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orch
        .call_with_retry("primary", "goal", "m", &Recorder::default(), &cancel)
        .await
        .unwrap_err();

    assert_eq!(err, RetryError::Cancelled { attempts: 0 });
    assert_eq!(primary.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_backoff() {
    let primary = Arc::new(ScriptedProvider::always_failing(
        "primary",
        ProviderErrorKind::Network,
    ));
    let secondary = Arc::new(ScriptedProvider::new("secondary"));
    let orch = orchestrator(primary.clone(), secondary.clone(), 10);
    let cancel = CancellationToken::new();

    let err = orch
        .call_with_retry(
            "primary",
            "goal",
            "m",
            &CancelOnFirstEvent(cancel.clone()),
            &cancel,
        )
        .await
        .unwrap_err();

    assert_eq!(err.attempts(), 1);
    assert!(matches!(err, RetryError::Cancelled { .. }));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 0);
}

#[tokio::test]
async fn unknown_primary_is_rejected() {
    let registry = ProviderRegistry::new("nobody");
    let orch = RetryOrchestrator::new(
        Arc::new(registry),
        Arc::new(CircuitBreakerRegistry::default()),
        policy(),
    );
    assert!(matches!(
        orch.call("nobody", "goal", "m").await,
        Err(RetryError::UnknownProvider(name)) if name == "nobody"
    ));
}

#[tokio::test]
async fn circuit_status_lists_registered_providers() {
    let primary = Arc::new(ScriptedProvider::new("primary"));
    let secondary = Arc::new(ScriptedProvider::new("secondary"));
    let orch = orchestrator(primary, secondary, 1);

    let _ = orch
        .breakers()
        .call("primary", || async {
            ProviderResponse::failure(ProviderErrorKind::Network, "down")
        })
        .await;

    let status = orch.get_circuit_status();
    assert_eq!(status.len(), 2);
    assert_eq!(status["primary"].state, CircuitState::Open);
    assert_eq!(status["secondary"].state, CircuitState::Closed);

    orch.reset_circuit("primary");
    orch.reset_circuit("primary");
    assert_eq!(orch.get_circuit_status()["primary"].state, CircuitState::Closed);

    let _ = orch
        .breakers()
        .call("secondary", || async {
            ProviderResponse::failure(ProviderErrorKind::Network, "down")
        })
        .await;
    orch.reset_all_circuits();
    assert!(orch
        .get_circuit_status()
        .values()
        .all(|s| s.state == CircuitState::Closed));
}
