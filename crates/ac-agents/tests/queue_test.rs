//! Integration tests for the task queue (admission, isolation, cancellation).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ac_agents::pipeline::RunPipeline;
use ac_agents::queue::{CancelOutcome, TaskQueue, DEFAULT_MAX_CONCURRENT};
use ac_bridge::event_bus::EventBus;
use ac_bridge::protocol::RunEvent;
use ac_core::cost::InMemoryCostTracker;
use ac_core::storage::{InMemoryStorage, Storage, StorageError};
use ac_core::types::*;
use ac_harness::circuit_breaker::CircuitBreakerRegistry;
use ac_harness::provider::{ProviderAdapter, ProviderErrorKind, ProviderResponse, ScriptedProvider};
use ac_harness::registry::ProviderRegistry;
use ac_harness::retry::{RetryOrchestrator, RetryPolicy};
use async_trait::async_trait;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

struct PanickingProvider;

#[async_trait]
impl ProviderAdapter for PanickingProvider {
    fn name(&self) -> &str {
        "boom"
    }

    fn default_model(&self) -> &str {
        "boom-model"
    }

    async fn call(&self, _prompt: &str, _model: &str) -> ProviderResponse {
        panic!("adapter bug");
    }
}

/// In-memory storage whose message writes can be switched off.
#[derive(Default)]
struct FlakyStorage {
    inner: InMemoryStorage,
    fail_messages: AtomicBool,
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn create_run(&self, run: Run) -> Result<Run, StorageError> {
        self.inner.create_run(run).await
    }
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StorageError> {
        self.inner.get_run(id).await
    }
    async fn update_run(&self, id: Uuid, update: RunUpdate) -> Result<Run, StorageError> {
        self.inner.update_run(id, update).await
    }
    async fn create_message(&self, message: Message) -> Result<(), StorageError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk full".into()));
        }
        self.inner.create_message(message).await
    }
    async fn create_decision_trace(&self, entry: DecisionTraceEntry) -> Result<(), StorageError> {
        self.inner.create_decision_trace(entry).await
    }
    async fn create_usage_record(&self, record: UsageRecord) -> Result<(), StorageError> {
        self.inner.create_usage_record(record).await
    }
    async fn create_audit_log(&self, entry: AuditLogEntry) -> Result<(), StorageError> {
        self.inner.create_audit_log(entry).await
    }
    async fn get_org(&self, id: Uuid) -> Result<Option<Organization>, StorageError> {
        self.inner.get_org(id).await
    }
}

/// Storage that applies every run update without checking transitions and
/// cannot write usage records.
#[derive(Default)]
struct LaxStorage {
    inner: InMemoryStorage,
}

#[async_trait]
impl Storage for LaxStorage {
    async fn create_run(&self, run: Run) -> Result<Run, StorageError> {
        self.inner.create_run(run).await
    }
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StorageError> {
        self.inner.get_run(id).await
    }
    async fn update_run(&self, id: Uuid, update: RunUpdate) -> Result<Run, StorageError> {
        let mut run = self
            .inner
            .get_run(id)
            .await?
            .ok_or(StorageError::RunNotFound(id))?;
        update.apply_to(&mut run);
        self.inner.create_run(run).await
    }
    async fn create_message(&self, message: Message) -> Result<(), StorageError> {
        self.inner.create_message(message).await
    }
    async fn create_decision_trace(&self, entry: DecisionTraceEntry) -> Result<(), StorageError> {
        self.inner.create_decision_trace(entry).await
    }
    async fn create_usage_record(&self, _record: UsageRecord) -> Result<(), StorageError> {
        Err(StorageError::Backend("usage table locked".into()))
    }
    async fn create_audit_log(&self, entry: AuditLogEntry) -> Result<(), StorageError> {
        self.inner.create_audit_log(entry).await
    }
    async fn get_org(&self, id: Uuid) -> Result<Option<Organization>, StorageError> {
        self.inner.get_org(id).await
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    storage: Arc<FlakyStorage>,
    bus: EventBus,
    queue: TaskQueue,
}

impl Fixture {
    fn new(primary: Arc<ScriptedProvider>, concurrency: usize) -> Self {
        Self::with_policy(primary, concurrency, Duration::from_millis(10))
    }

    fn with_policy(primary: Arc<ScriptedProvider>, concurrency: usize, base_delay: Duration) -> Self {
        let mut registry = ProviderRegistry::new("primary").with_fallback_chain(["secondary"]);
        registry.register(primary);
        registry.register(Arc::new(ScriptedProvider::new("secondary")));
        registry.register(Arc::new(PanickingProvider));

        let orchestrator = Arc::new(RetryOrchestrator::new(
            Arc::new(registry),
            Arc::new(CircuitBreakerRegistry::default()),
            RetryPolicy {
                max_attempts: 3,
                base_delay,
                factor: 2.0,
                max_delay: Duration::from_secs(10),
            },
        ));
        let storage = Arc::new(FlakyStorage::default());
        let bus = EventBus::new();
        let pipeline = Arc::new(RunPipeline::new(
            storage.clone(),
            orchestrator,
            Arc::new(InMemoryCostTracker::new()),
            Arc::new(bus.clone()),
        ));

        Self {
            storage,
            bus,
            queue: TaskQueue::new(pipeline, concurrency),
        }
    }

    async fn task(&self, org_id: Uuid, goal: &str) -> Task {
        let run = self
            .storage
            .create_run(Run::new(Uuid::new_v4(), org_id, goal))
            .await
            .unwrap();
        Task::new(&run, goal, "chat")
    }

    async fn status(&self, run_id: Uuid) -> RunStatus {
        self.storage.get_run(run_id).await.unwrap().unwrap().status
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn never_exceeds_concurrency_bound() {
    let primary = Arc::new(ScriptedProvider::new("primary").with_latency(Duration::from_millis(50)));
    let fx = Fixture::new(primary.clone(), 2);

    let mut ids = Vec::new();
    for i in 0..5 {
        let task = fx.task(Uuid::new_v4(), &format!("goal {i}")).await;
        ids.push(task.run_id);
        fx.queue.enqueue(task);
    }
    assert_eq!(fx.queue.active_count(), 2);
    assert_eq!(fx.queue.backlog_len(), 3);

    fx.queue.wait_idle().await;

    assert_eq!(primary.max_in_flight(), 2);
    assert_eq!(primary.call_count(), 5);
    for id in ids {
        assert_eq!(fx.status(id).await, RunStatus::Completed);
    }
    assert!(fx.queue.is_idle());
}

#[tokio::test(start_paused = true)]
async fn admission_is_fifo() {
    let primary = Arc::new(ScriptedProvider::new("primary").with_latency(Duration::from_millis(5)));
    let fx = Fixture::new(primary, 1);
    let rx = fx.bus.subscribe();

    let mut ids = Vec::new();
    for i in 0..4 {
        let task = fx.task(Uuid::new_v4(), &format!("goal {i}")).await;
        ids.push(task.run_id);
        fx.queue.enqueue(task);
    }
    fx.queue.wait_idle().await;

    let finished: Vec<Uuid> = rx
        .drain()
        .filter(RunEvent::is_finished)
        .map(|e| e.run_id())
        .collect();
    assert_eq!(finished, ids);
}

#[tokio::test]
async fn zero_concurrency_uses_default() {
    let fx = Fixture::new(Arc::new(ScriptedProvider::new("primary")), 0);
    assert_eq!(fx.queue.max_concurrent(), DEFAULT_MAX_CONCURRENT);
}

#[tokio::test(start_paused = true)]
async fn step_numbers_are_gap_free_under_concurrency() {
    let primary = Arc::new(
        ScriptedProvider::new("primary")
            .failing_first(4)
            .with_latency(Duration::from_millis(3)),
    );
    let fx = Fixture::new(primary, 3);

    let mut ids = Vec::new();
    for i in 0..6 {
        let task = fx.task(Uuid::new_v4(), &format!("goal {i}")).await;
        ids.push(task.run_id);
        fx.queue.enqueue(task);
    }
    fx.queue.wait_idle().await;

    for id in ids {
        let steps: Vec<u32> = fx
            .storage
            .inner
            .traces_for(id)
            .await
            .iter()
            .map(|t| t.step_number)
            .collect();
        let expected: Vec<u32> = (1..=steps.len() as u32).collect();
        assert!(steps.len() >= 3);
        assert_eq!(steps, expected);
    }
}

// ---------------------------------------------------------------------------
// Log stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_stream_ends_with_terminal_status() {
    let fx = Fixture::new(Arc::new(ScriptedProvider::new("primary")), 2);
    let task = fx.task(Uuid::new_v4(), "goal").await;
    let stream = fx.bus.subscribe_run(task.run_id);

    fx.queue.enqueue(task);
    let (entries, status) = stream.collect().await;

    assert_eq!(status, Some(RunStatus::Completed));
    assert_eq!(entries.first().map(|e| e.level), Some(LogLevel::Info));
    assert_eq!(entries.last().map(|e| e.level), Some(LogLevel::Success));
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_pipeline_fails_only_its_run() {
    let fx = Fixture::new(Arc::new(ScriptedProvider::new("primary")), 2);
    let mut org = Organization::new("chaos");
    org.preferred_provider = Some("boom".into());
    let chaos_org = org.id;
    fx.storage.inner.insert_org(org).await;

    let doomed = fx.task(chaos_org, "explode").await;
    let doomed_id = doomed.run_id;
    let stream = fx.bus.subscribe_run(doomed_id);
    let healthy = fx.task(Uuid::new_v4(), "fine").await;
    let healthy_id = healthy.run_id;

    fx.queue.enqueue(doomed);
    fx.queue.enqueue(healthy);
    fx.queue.wait_idle().await;

    let run = fx.storage.get_run(doomed_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.unwrap().contains("panicked"));
    assert_eq!(fx.status(healthy_id).await, RunStatus::Completed);

    let (_, status) = stream.collect().await;
    assert_eq!(status, Some(RunStatus::Failed));
}

#[tokio::test]
async fn storage_failure_becomes_failed_run() {
    let fx = Fixture::new(Arc::new(ScriptedProvider::new("primary")), 1);
    fx.storage.fail_messages.store(true, Ordering::SeqCst);
    let task = fx.task(Uuid::new_v4(), "goal").await;
    let run_id = task.run_id;
    let stream = fx.bus.subscribe_run(run_id);

    fx.queue.enqueue(task);
    let (entries, status) = stream.collect().await;

    assert_eq!(status, Some(RunStatus::Failed));
    assert_eq!(entries.last().map(|e| e.level), Some(LogLevel::Error));
    let run = fx.storage.get_run(run_id).await.unwrap().unwrap();
    assert!(run.error.unwrap().contains("pipeline aborted"));
}

#[tokio::test]
async fn bookkeeping_failure_after_completion_keeps_run_completed() {
    let mut registry = ProviderRegistry::new("primary");
    registry.register(Arc::new(ScriptedProvider::new("primary")));
    let orchestrator = Arc::new(RetryOrchestrator::new(
        Arc::new(registry),
        Arc::new(CircuitBreakerRegistry::default()),
        RetryPolicy::default(),
    ));
    let storage = Arc::new(LaxStorage::default());
    let tracker = InMemoryCostTracker::new();
    let bus = EventBus::new();
    let pipeline = Arc::new(RunPipeline::new(
        storage.clone(),
        orchestrator,
        Arc::new(tracker.clone()),
        Arc::new(bus.clone()),
    ));
    let queue = TaskQueue::new(pipeline, 1);

    let run = storage
        .create_run(Run::new(Uuid::new_v4(), Uuid::new_v4(), "goal"))
        .await
        .unwrap();
    let stream = bus.subscribe_run(run.id);
    queue.enqueue(Task::new(&run, "goal", "chat"));
    let (_, status) = stream.collect().await;
    queue.wait_idle().await;

    assert_eq!(status, Some(RunStatus::Completed));
    let stored = storage.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(stored.output.is_some());
    assert!(stored.error.is_none());
    assert_eq!(tracker.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_enqueue_is_ignored() {
    let primary = Arc::new(ScriptedProvider::new("primary").with_latency(Duration::from_millis(50)));
    let fx = Fixture::new(primary.clone(), 1);
    let task = fx.task(Uuid::new_v4(), "goal").await;
    let queued = fx.task(Uuid::new_v4(), "other").await;

    assert!(fx.queue.enqueue(task.clone()));
    assert!(!fx.queue.enqueue(task.clone()));
    assert!(fx.queue.enqueue(queued.clone()));
    assert!(!fx.queue.enqueue(queued));
    assert_eq!(fx.queue.active_count(), 1);
    assert_eq!(fx.queue.backlog_len(), 1);

    fx.queue.wait_idle().await;
    assert_eq!(primary.call_count(), 2);
    assert_eq!(primary.max_in_flight(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_removes_backlog_task() {
    let primary = Arc::new(ScriptedProvider::new("primary").with_latency(Duration::from_millis(50)));
    let fx = Fixture::new(primary.clone(), 1);
    let first = fx.task(Uuid::new_v4(), "first").await;
    let second = fx.task(Uuid::new_v4(), "second").await;
    let second_id = second.run_id;
    let stream = fx.bus.subscribe_run(second_id);

    fx.queue.enqueue(first);
    fx.queue.enqueue(second);
    assert_eq!(fx.queue.cancel(second_id).await, CancelOutcome::Dequeued);
    fx.queue.wait_idle().await;

    assert_eq!(fx.status(second_id).await, RunStatus::Cancelled);
    assert_eq!(primary.call_count(), 1);
    assert!(fx.storage.inner.traces_for(second_id).await.is_empty());

    let (entries, status) = stream.collect().await;
    assert_eq!(status, Some(RunStatus::Cancelled));
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].level, LogLevel::Warning);
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_retry_backoff() {
    let primary = Arc::new(ScriptedProvider::always_failing(
        "primary",
        ProviderErrorKind::Network,
    ));
    let fx = Fixture::with_policy(primary.clone(), 1, Duration::from_secs(5));
    let task = fx.task(Uuid::new_v4(), "goal").await;
    let run_id = task.run_id;
    let stream = fx.bus.subscribe_run(run_id);

    fx.queue.enqueue(task);
    // Let the first attempt fail and the backoff sleep begin.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fx.queue.cancel(run_id).await, CancelOutcome::Signalled);
    fx.queue.wait_idle().await;

    assert_eq!(fx.status(run_id).await, RunStatus::Cancelled);
    assert_eq!(primary.call_count(), 1);

    let steps: Vec<StepType> = fx
        .storage
        .inner
        .traces_for(run_id)
        .await
        .iter()
        .map(|t| t.step_type)
        .collect();
    assert_eq!(
        steps,
        vec![
            StepType::ProviderSelection,
            StepType::ContextAnalysis,
            StepType::Retry,
            StepType::ErrorHandling,
        ]
    );

    let (entries, status) = stream.collect().await;
    assert_eq!(status, Some(RunStatus::Cancelled));
    assert_eq!(entries.last().map(|e| e.level), Some(LogLevel::Warning));
}

#[tokio::test]
async fn cancel_unknown_run_is_not_found() {
    let fx = Fixture::new(Arc::new(ScriptedProvider::new("primary")), 1);
    assert_eq!(fx.queue.cancel(Uuid::new_v4()).await, CancelOutcome::NotFound);
}
