use std::sync::Arc;

use ac_bridge::event_bus::LogSink;
use ac_core::cost::{CostTracker, PricingTable};
use ac_core::storage::{Storage, StorageError};
use ac_core::types::{
    AuditLogEntry, LogEntry, Message, Organization, RunStatus, RunUpdate, StepType, Task,
    UsageRecord,
};
use ac_harness::provider::Usage;
use ac_harness::retry::{
    AttemptEvent, AttemptObserver, Completion, NextStep, RetryError, RetryOrchestrator,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::trace::{DecisionTraceRecorder, TraceOptions};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that abort a run outside the normal failed/cancelled paths.
/// The queue turns these into a failed run unless the run had already
/// reached a terminal state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// Bookkeeping after the terminal update failed. The stored status stands.
    #[error("storage error after run was {status}: {source}")]
    AfterTerminal {
        status: RunStatus,
        #[source]
        source: StorageError,
    },
}

impl PipelineError {
    /// The terminal status already stored for the run, if any.
    pub fn reached_status(&self) -> Option<RunStatus> {
        match self {
            PipelineError::Storage(_) => None,
            PipelineError::AfterTerminal { status, .. } => Some(*status),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// ---------------------------------------------------------------------------
// RunPipeline
// ---------------------------------------------------------------------------

/// Drives one task from `queued` to a terminal state.
///
/// Steps: mark running, persist input, select a provider, analyse context,
/// call the orchestrator, then either persist the response and report cost or
/// record the failure. The cancellation token is checked between steps; a
/// cancelled run is closed as `cancelled` at the next checkpoint.
pub struct RunPipeline {
    storage: Arc<dyn Storage>,
    orchestrator: Arc<RetryOrchestrator>,
    recorder: Arc<DecisionTraceRecorder>,
    cost_tracker: Arc<dyn CostTracker>,
    sink: Arc<dyn LogSink>,
    pricing: PricingTable,
}

impl RunPipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        orchestrator: Arc<RetryOrchestrator>,
        cost_tracker: Arc<dyn CostTracker>,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let recorder = Arc::new(DecisionTraceRecorder::new(Arc::clone(&storage)));
        Self {
            storage,
            orchestrator,
            recorder,
            cost_tracker,
            sink,
            pricing: PricingTable::new(),
        }
    }

    /// Prices used when a provider reports tokens but no cost.
    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    pub fn recorder(&self) -> &Arc<DecisionTraceRecorder> {
        &self.recorder
    }

    pub fn orchestrator(&self) -> &Arc<RetryOrchestrator> {
        &self.orchestrator
    }

    /// Run the pipeline and return the terminal status it reached.
    ///
    /// Provider failures and cancellation are handled here and come back as
    /// `Ok(Failed)` / `Ok(Cancelled)`. Storage errors are returned as `Err`
    /// without touching the run further.
    pub async fn run(&self, task: &Task, cancel: &CancellationToken) -> Result<RunStatus> {
        let run_id = task.run_id;
        self.recorder.begin_run(run_id);

        if cancel.is_cancelled() {
            return self.cancel_run(task, "before start").await;
        }

        self.storage
            .update_run(run_id, RunUpdate::status(RunStatus::Running))
            .await?;
        info!(run_id = %run_id, mode = %task.mode, "run started");
        self.log(run_id, LogEntry::info(format!("Run started ({} mode)", task.mode)));

        self.storage
            .create_message(Message::user(run_id, task.goal.clone()))
            .await?;

        // Provider selection
        let selection_started = Instant::now();
        let org = self.storage.get_org(task.org_id).await?;
        let selection = self.select_provider(org.as_ref());
        self.recorder
            .trace_decision(
                run_id,
                StepType::ProviderSelection,
                format!("Use {} ({})", selection.provider, selection.model),
                selection.reasoning.clone(),
                TraceOptions::default()
                    .confidence(selection.confidence)
                    .alternatives(selection.alternatives.clone())
                    .context(json!({
                        "org_id": task.org_id,
                        "fallback_chain": selection.alternatives,
                    }))
                    .started_at(selection_started),
            )
            .await;

        if cancel.is_cancelled() {
            return self.cancel_run(task, "after provider selection").await;
        }

        // Context analysis
        let goal_chars = task.goal.chars().count();
        self.recorder
            .trace_decision(
                run_id,
                StepType::ContextAnalysis,
                format!("Prompt built from goal ({goal_chars} chars)"),
                format!("Goal is sent verbatim in {} mode", task.mode),
                TraceOptions::default().context(json!({
                    "project_id": task.project_id,
                    "mode": task.mode,
                    "goal_chars": goal_chars,
                })),
            )
            .await;

        if cancel.is_cancelled() {
            return self.cancel_run(task, "before provider call").await;
        }

        // Provider call
        self.log(
            run_id,
            LogEntry::info(format!(
                "Calling {} ({})",
                selection.provider, selection.model
            )),
        );
        let call_started = Instant::now();
        let observer = RunObserver {
            run_id,
            recorder: &self.recorder,
            sink: self.sink.as_ref(),
        };
        let result = self
            .orchestrator
            .call_with_retry(
                &selection.provider,
                &task.goal,
                &selection.model,
                &observer,
                cancel,
            )
            .await;

        match result {
            Ok(completion) => self.complete_run(task, completion, call_started).await,
            Err(RetryError::Cancelled { attempts }) => {
                self.cancel_run(task, &format!("after {attempts} provider attempts"))
                    .await
            }
            Err(e) => self.fail_run(task, &e).await,
        }
    }

    fn select_provider(&self, org: Option<&Organization>) -> Selection {
        let registry = self.orchestrator.registry();
        let preferred = org
            .and_then(|o| o.preferred_provider.as_deref())
            .filter(|p| registry.contains(p));

        let (provider, reasoning, confidence) = match preferred {
            Some(p) => (
                p.to_string(),
                "Organization prefers this provider".to_string(),
                0.95,
            ),
            None => (
                registry.default_provider().to_string(),
                "Routing default provider".to_string(),
                0.9,
            ),
        };

        // An org's model only makes sense on the org's own provider.
        let model = preferred
            .and(org.and_then(|o| o.preferred_model.clone()))
            .or_else(|| registry.get(&provider).map(|a| a.default_model().to_string()))
            .unwrap_or_else(|| "default".to_string());

        let alternatives = registry
            .chain_for(&provider)
            .into_iter()
            .filter(|name| *name != provider)
            .collect();

        Selection {
            provider,
            model,
            reasoning,
            confidence,
            alternatives,
        }
    }

    async fn complete_run(
        &self,
        task: &Task,
        completion: Completion,
        call_started: Instant,
    ) -> Result<RunStatus> {
        let run_id = task.run_id;
        let Completion {
            content,
            usage,
            used_provider,
            model,
            attempts,
        } = completion;
        let cost = self.cost_of(&model, usage.as_ref());

        self.storage
            .create_message(Message::assistant(
                run_id,
                content.clone(),
                used_provider.clone(),
                model.clone(),
            ))
            .await?;

        self.storage
            .update_run(
                run_id,
                RunUpdate {
                    status: Some(RunStatus::Completed),
                    provider: Some(used_provider.clone()),
                    model: Some(model.clone()),
                    output: Some(content),
                    cost_estimate: Some(cost),
                    error: None,
                },
            )
            .await?;

        let (input_tokens, output_tokens) = usage
            .as_ref()
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((0, 0));

        self.recorder
            .trace_decision(
                run_id,
                StepType::ResponseGeneration,
                format!("Response generated by {used_provider} ({model})"),
                format!("Succeeded after {attempts} attempt(s)"),
                TraceOptions::default()
                    .context(json!({
                        "provider": used_provider,
                        "model": model,
                        "attempts": attempts,
                        "input_tokens": input_tokens,
                        "output_tokens": output_tokens,
                        "cost_estimate": cost,
                    }))
                    .started_at(call_started),
            )
            .await;

        // The run is already completed; a tracker outage must not undo that.
        if let Err(e) = self.cost_tracker.track_cost(task.org_id, cost).await {
            warn!(run_id = %run_id, error = %e, "cost tracking failed");
        }

        self.storage
            .create_usage_record(UsageRecord {
                id: Uuid::new_v4(),
                org_id: task.org_id,
                project_id: task.project_id,
                run_id,
                provider: used_provider.clone(),
                model: model.clone(),
                input_tokens,
                output_tokens,
                cost_estimate: cost,
                created_at: Utc::now(),
            })
            .await
            .map_err(completed)?;

        self.log(
            run_id,
            LogEntry::success(format!(
                "Completed with {used_provider} in {attempts} attempt(s)"
            )),
        );

        self.storage
            .create_audit_log(AuditLogEntry::for_run(
                task.org_id,
                run_id,
                "run.completed",
                json!({
                    "provider": used_provider,
                    "model": model,
                    "attempts": attempts,
                    "cost_estimate": cost,
                }),
            ))
            .await
            .map_err(completed)?;

        info!(run_id = %run_id, provider = %used_provider, attempts, cost, "run completed");
        Ok(RunStatus::Completed)
    }

    async fn fail_run(&self, task: &Task, err: &RetryError) -> Result<RunStatus> {
        let run_id = task.run_id;
        error!(run_id = %run_id, error = %err, "run failed");

        self.recorder
            .trace_decision(
                run_id,
                StepType::ErrorHandling,
                "Mark run failed",
                err.to_string(),
                TraceOptions::default().context(json!({ "attempts": err.attempts() })),
            )
            .await;

        self.storage
            .update_run(run_id, RunUpdate::failed(err.to_string()))
            .await?;
        self.log(run_id, LogEntry::error(format!("Run failed: {err}")));
        Ok(RunStatus::Failed)
    }

    async fn cancel_run(&self, task: &Task, when: &str) -> Result<RunStatus> {
        let run_id = task.run_id;
        warn!(run_id = %run_id, checkpoint = when, "run cancelled");

        self.recorder
            .trace_decision(
                run_id,
                StepType::ErrorHandling,
                "Cancel run",
                format!("Cancellation requested, stopped {when}"),
                TraceOptions::default(),
            )
            .await;

        self.storage
            .update_run(run_id, RunUpdate::cancelled(format!("cancelled {when}")))
            .await?;
        self.log(run_id, LogEntry::warning(format!("Run cancelled {when}")));
        Ok(RunStatus::Cancelled)
    }

    /// Provider-reported cost wins, then the pricing table, then zero.
    fn cost_of(&self, model: &str, usage: Option<&Usage>) -> f64 {
        match usage {
            Some(Usage {
                cost_estimate: Some(cost),
                ..
            }) => *cost,
            Some(u) => self.pricing.cost_for(model, u.input_tokens, u.output_tokens),
            None => 0.0,
        }
    }

    fn log(&self, run_id: Uuid, entry: LogEntry) {
        self.sink.log(run_id, entry);
    }
}

fn completed(source: StorageError) -> PipelineError {
    PipelineError::AfterTerminal {
        status: RunStatus::Completed,
        source,
    }
}

struct Selection {
    provider: String,
    model: String,
    reasoning: String,
    confidence: f64,
    alternatives: Vec<String>,
}

// ---------------------------------------------------------------------------
// RunObserver
// ---------------------------------------------------------------------------

/// Turns orchestrator retry/fallback notifications into log events and
/// trace steps for one run.
struct RunObserver<'a> {
    run_id: Uuid,
    recorder: &'a DecisionTraceRecorder,
    sink: &'a dyn LogSink,
}

#[async_trait]
impl AttemptObserver for RunObserver<'_> {
    async fn on_attempt(&self, event: &AttemptEvent) {
        match &event.next {
            NextStep::Retry { delay } => {
                self.sink.log(
                    self.run_id,
                    LogEntry::warning(format!(
                        "Attempt {} on {} failed ({}), retrying in {}ms",
                        event.attempt,
                        event.provider,
                        event.failure,
                        delay.as_millis()
                    )),
                );
                self.recorder
                    .trace_decision(
                        self.run_id,
                        StepType::Retry,
                        format!("Retry {} (attempt {})", event.provider, event.attempt + 1),
                        event.failure.to_string(),
                        TraceOptions::default().confidence(0.7).context(json!({
                            "provider": event.provider,
                            "attempt": event.attempt,
                            "total_attempts": event.total_attempts,
                            "delay_ms": delay.as_millis() as u64,
                        })),
                    )
                    .await;
            }
            NextStep::Fallback { to } => {
                self.sink.log(
                    self.run_id,
                    LogEntry::warning(format!(
                        "Switching from {} to {}: {}",
                        event.provider, to, event.failure
                    )),
                );
                self.recorder
                    .trace_decision(
                        self.run_id,
                        StepType::Fallback,
                        format!("Fall back from {} to {}", event.provider, to),
                        event.failure.to_string(),
                        TraceOptions::default()
                            .confidence(0.6)
                            .alternatives([to.clone()])
                            .context(json!({
                                "from": event.provider,
                                "to": to,
                                "attempts_on_previous": event.attempt,
                                "total_attempts": event.total_attempts,
                            })),
                    )
                    .await;
            }
        }
    }
}
