use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work handed to the queue.
///
/// The matching [`Run`] must already be persisted in [`RunStatus::Queued`]
/// before the task is enqueued; `run_id` is the correlation key for every
/// log event and decision trace the pipeline produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub run_id: Uuid,
    pub project_id: Uuid,
    pub org_id: Uuid,
    pub goal: String,
    pub mode: String,
}

impl Task {
    pub fn new(run: &Run, goal: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            run_id: run.id,
            project_id: run.project_id,
            org_id: run.org_id,
            goal: goal.into(),
            mode: mode.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Transitions are monotonic and every terminal state is final.
    pub fn can_transition_to(&self, target: &RunStatus) -> bool {
        matches!(
            (self, target),
            (RunStatus::Queued, RunStatus::Running)
                | (RunStatus::Queued, RunStatus::Failed)
                | (RunStatus::Queued, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub project_id: Uuid,
    pub org_id: Uuid,
    pub status: RunStatus,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input: String,
    pub output: Option<String>,
    pub cost_estimate: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Create a new run in the `Queued` state.
    pub fn new(project_id: Uuid, org_id: Uuid, input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            org_id,
            status: RunStatus::Queued,
            provider: None,
            model: None,
            input: input.into(),
            output: None,
            cost_estimate: 0.0,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A partial update applied to a persisted [`Run`].
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub output: Option<String>,
    pub cost_estimate: Option<f64>,
    pub error: Option<String>,
}

impl RunUpdate {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Cancelled),
            error: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Apply this update to `run`, stamping `updated_at` (and `completed_at`
    /// when the new status is terminal).
    pub fn apply_to(&self, run: &mut Run) {
        let now = Utc::now();
        if let Some(status) = self.status {
            run.status = status;
            if status.is_terminal() {
                run.completed_at = Some(now);
            }
        }
        if let Some(provider) = &self.provider {
            run.provider = Some(provider.clone());
        }
        if let Some(model) = &self.model {
            run.model = Some(model.clone());
        }
        if let Some(output) = &self.output {
            run.output = Some(output.clone());
        }
        if let Some(cost) = self.cost_estimate {
            run.cost_estimate = cost;
        }
        if let Some(error) = &self.error {
            run.error = Some(error.clone());
        }
        run.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub run_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(run_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            role: MessageRole::User,
            content: content.into(),
            provider: None,
            model: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(
        run_id: Uuid,
        content: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            role: MessageRole::Assistant,
            content: content.into(),
            provider: Some(provider.into()),
            model: Some(model.into()),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Decision traces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ProviderSelection,
    ContextAnalysis,
    Retry,
    Fallback,
    ModelSelection,
    ToolCall,
    ResponseGeneration,
    ErrorHandling,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepType::ProviderSelection => "provider_selection",
            StepType::ContextAnalysis => "context_analysis",
            StepType::Retry => "retry",
            StepType::Fallback => "fallback",
            StepType::ModelSelection => "model_selection",
            StepType::ToolCall => "tool_call",
            StepType::ResponseGeneration => "response_generation",
            StepType::ErrorHandling => "error_handling",
        };
        write!(f, "{label}")
    }
}

/// One append-only audit step of a run. `step_number` is gap-free per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTraceEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_number: u32,
    pub step_type: StepType,
    pub decision: String,
    pub reasoning: String,
    pub confidence: f64,
    #[serde(default)]
    pub alternatives: Vec<String>,
    #[serde(default)]
    pub context_used: serde_json::Value,
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Usage, audit, org
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub org_id: Uuid,
    pub project_id: Uuid,
    pub run_id: Uuid,
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_estimate: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub org_id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn for_run(
        org_id: Uuid,
        run_id: Uuid,
        action: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            org_id,
            action: action.into(),
            resource_type: "run".into(),
            resource_id: run_id.to_string(),
            details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Provider this org routes to first, when registered.
    #[serde(default)]
    pub preferred_provider: Option<String>,
    #[serde(default)]
    pub preferred_model: Option<String>,
}

impl Organization {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            preferred_provider: None,
            preferred_model: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Log entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Success,
    Error,
}

/// A single line of a run's live log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }
}
