//! Persistence port consumed by the orchestration core.
//!
//! The pipeline only ever talks to [`Storage`]; concrete databases live
//! outside this workspace. [`InMemoryStorage`] backs tests and dry runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{
    AuditLogEntry, DecisionTraceEntry, Message, Organization, Run, RunStatus, RunUpdate,
    UsageRecord,
};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("run {run_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Narrow persistence interface. Implementations either succeed or return
/// an error; the pipeline decides which errors are fatal to a run.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<Run>;
    async fn get_run(&self, id: Uuid) -> Result<Option<Run>>;
    /// Apply `update` and return the stored run.
    ///
    /// Implementations should reject status changes that
    /// [`RunStatus::can_transition_to`] does not allow with
    /// [`StorageError::InvalidTransition`]. Callers must not rely on it: the
    /// queue checks for a terminal status itself before failing a run.
    async fn update_run(&self, id: Uuid, update: RunUpdate) -> Result<Run>;
    async fn create_message(&self, message: Message) -> Result<()>;
    async fn create_decision_trace(&self, entry: DecisionTraceEntry) -> Result<()>;
    async fn create_usage_record(&self, record: UsageRecord) -> Result<()>;
    async fn create_audit_log(&self, entry: AuditLogEntry) -> Result<()>;
    async fn get_org(&self, id: Uuid) -> Result<Option<Organization>>;
}

// ---------------------------------------------------------------------------
// InMemoryStorage
// ---------------------------------------------------------------------------

/// Process-local [`Storage`] that enforces the run status state machine.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    runs: Arc<RwLock<HashMap<Uuid, Run>>>,
    messages: Arc<RwLock<Vec<Message>>>,
    traces: Arc<RwLock<Vec<DecisionTraceEntry>>>,
    usage: Arc<RwLock<Vec<UsageRecord>>>,
    audit: Arc<RwLock<Vec<AuditLogEntry>>>,
    orgs: Arc<RwLock<HashMap<Uuid, Organization>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_org(&self, org: Organization) {
        self.orgs.write().await.insert(org.id, org);
    }

    pub async fn messages_for(&self, run_id: Uuid) -> Vec<Message> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.run_id == run_id)
            .cloned()
            .collect()
    }

    /// Traces of one run, in step order.
    pub async fn traces_for(&self, run_id: Uuid) -> Vec<DecisionTraceEntry> {
        let mut traces: Vec<_> = self
            .traces
            .read()
            .await
            .iter()
            .filter(|t| t.run_id == run_id)
            .cloned()
            .collect();
        traces.sort_by_key(|t| t.step_number);
        traces
    }

    pub async fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().await.clone()
    }

    pub async fn audit_logs(&self) -> Vec<AuditLogEntry> {
        self.audit.read().await.clone()
    }

    pub async fn runs(&self) -> Vec<Run> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_run(&self, run: Run) -> Result<Run> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn update_run(&self, id: Uuid, update: RunUpdate) -> Result<Run> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(StorageError::RunNotFound(id))?;
        if let Some(target) = update.status {
            if !run.status.can_transition_to(&target) {
                return Err(StorageError::InvalidTransition {
                    run_id: id,
                    from: run.status,
                    to: target,
                });
            }
        }
        update.apply_to(run);
        Ok(run.clone())
    }

    async fn create_message(&self, message: Message) -> Result<()> {
        self.messages.write().await.push(message);
        Ok(())
    }

    async fn create_decision_trace(&self, entry: DecisionTraceEntry) -> Result<()> {
        self.traces.write().await.push(entry);
        Ok(())
    }

    async fn create_usage_record(&self, record: UsageRecord) -> Result<()> {
        self.usage.write().await.push(record);
        Ok(())
    }

    async fn create_audit_log(&self, entry: AuditLogEntry) -> Result<()> {
        self.audit.write().await.push(entry);
        Ok(())
    }

    async fn get_org(&self, id: Uuid) -> Result<Option<Organization>> {
        Ok(self.orgs.read().await.get(&id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
