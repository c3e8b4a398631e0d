use std::sync::Arc;

use ac_core::storage::Storage;
use ac_core::types::{DecisionTraceEntry, StepType};
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// Confidence recorded when the caller does not supply one.
pub const DEFAULT_CONFIDENCE: f64 = 1.0;

/// Optional details attached to a trace step.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub confidence: Option<f64>,
    pub alternatives: Vec<String>,
    pub context_used: serde_json::Value,
    /// When the decision started; turned into `duration_ms`.
    pub started_at: Option<Instant>,
}

impl TraceOptions {
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn alternatives(mut self, alternatives: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.alternatives = alternatives.into_iter().map(Into::into).collect();
        self
    }

    pub fn context(mut self, context_used: serde_json::Value) -> Self {
        self.context_used = context_used;
        self
    }

    pub fn started_at(mut self, started_at: Instant) -> Self {
        self.started_at = Some(started_at);
        self
    }
}

/// Appends numbered decision steps for each run.
///
/// Step numbers come from an in-memory counter per run, created by
/// [`begin_run`](Self::begin_run). The counter only advances after a step is
/// persisted, so the stored sequence is always `1..=K`. A failed write is
/// logged and dropped; it never fails the run.
pub struct DecisionTraceRecorder {
    storage: Arc<dyn Storage>,
    counters: DashMap<Uuid, u32>,
}

impl DecisionTraceRecorder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            counters: DashMap::new(),
        }
    }

    pub fn begin_run(&self, run_id: Uuid) {
        self.counters.insert(run_id, 0);
    }

    /// Drop the counter for a finished run.
    pub fn end_run(&self, run_id: Uuid) {
        self.counters.remove(&run_id);
    }

    /// Steps persisted so far for `run_id`.
    pub fn steps_recorded(&self, run_id: Uuid) -> u32 {
        self.counters.get(&run_id).map(|c| *c).unwrap_or(0)
    }

    /// Record one step and return its number, or `None` if it could not be
    /// persisted.
    ///
    /// Steps of a single run must be recorded sequentially.
    pub async fn trace_decision(
        &self,
        run_id: Uuid,
        step_type: StepType,
        decision: impl Into<String>,
        reasoning: impl Into<String>,
        options: TraceOptions,
    ) -> Option<u32> {
        let step_number = self.steps_recorded(run_id) + 1;
        let entry = DecisionTraceEntry {
            id: Uuid::new_v4(),
            run_id,
            step_number,
            step_type,
            decision: decision.into(),
            reasoning: reasoning.into(),
            confidence: options
                .confidence
                .unwrap_or(DEFAULT_CONFIDENCE)
                .clamp(0.0, 1.0),
            alternatives: options.alternatives,
            context_used: options.context_used,
            duration_ms: options
                .started_at
                .map(|t| t.elapsed().as_millis() as u64),
            created_at: Utc::now(),
        };

        match self.storage.create_decision_trace(entry).await {
            Ok(()) => {
                self.counters.insert(run_id, step_number);
                Some(step_number)
            }
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    step = step_number,
                    step_type = %step_type,
                    error = %e,
                    "failed to persist decision trace"
                );
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
