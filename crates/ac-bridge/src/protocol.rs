use ac_core::types::{LogEntry, RunStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One event on a run's log stream.
///
/// A run produces zero or more `Log` events followed by exactly one
/// `Finished`, after which nothing else is published for that run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    Log { run_id: Uuid, entry: LogEntry },
    Finished { run_id: Uuid, status: RunStatus },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::Log { run_id, .. } | RunEvent::Finished { run_id, .. } => *run_id,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, RunEvent::Finished { .. })
    }
}
