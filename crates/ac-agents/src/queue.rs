use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use ac_core::types::{LogEntry, RunStatus, RunUpdate, Task};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::RunPipeline;

/// Default number of execution slots when none is specified.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

/// Result of [`TaskQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was still in the backlog and will never run.
    Dequeued,
    /// The task is executing; it stops at its next checkpoint.
    Signalled,
    NotFound,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<Task>,
    active: HashMap<Uuid, CancellationToken>,
}

struct QueueInner {
    pipeline: Arc<RunPipeline>,
    max_concurrent: usize,
    state: Mutex<QueueState>,
    idle: Notify,
}

/// Bounded-concurrency FIFO dispatcher for run pipelines.
///
/// At most `max_concurrent` pipelines execute at once; the rest wait in a
/// FIFO backlog. Slots are re-evaluated on every enqueue and every
/// completion. A pipeline that errors or panics is converted into a failed
/// run at this boundary and never affects its siblings.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(pipeline: Arc<RunPipeline>, max_concurrent: usize) -> Self {
        let limit = if max_concurrent == 0 {
            warn!("max_concurrent was 0, defaulting to {DEFAULT_MAX_CONCURRENT}");
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent
        };
        Self {
            inner: Arc::new(QueueInner {
                pipeline,
                max_concurrent: limit,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Append `task` to the backlog and start it if a slot is free.
    ///
    /// The run must already be persisted in `queued` state. A task whose run
    /// is already queued or executing is ignored and `false` is returned.
    pub fn enqueue(&self, task: Task) -> bool {
        {
            let mut state = self.lock();
            let run_id = task.run_id;
            if state.active.contains_key(&run_id)
                || state.backlog.iter().any(|t| t.run_id == run_id)
            {
                warn!(run_id = %run_id, "run already queued, ignoring duplicate");
                return false;
            }
            debug!(run_id = %run_id, "task enqueued");
            state.backlog.push_back(task);
        }
        self.dispatch();
        true
    }

    /// Request cancellation of `run_id`.
    pub async fn cancel(&self, run_id: Uuid) -> CancelOutcome {
        let dequeued = {
            let mut state = self.lock();
            if let Some(token) = state.active.get(&run_id) {
                token.cancel();
                info!(run_id = %run_id, "cancellation signalled to executing run");
                return CancelOutcome::Signalled;
            }
            state
                .backlog
                .iter()
                .position(|t| t.run_id == run_id)
                .and_then(|idx| state.backlog.remove(idx))
        };

        if dequeued.is_none() {
            return CancelOutcome::NotFound;
        }

        let pipeline = &self.inner.pipeline;
        match pipeline
            .storage()
            .update_run(run_id, RunUpdate::cancelled("cancelled before execution"))
            .await
        {
            Ok(_) => pipeline
                .sink()
                .log(run_id, LogEntry::warning("Run cancelled before execution")),
            Err(e) => warn!(run_id = %run_id, error = %e, "failed to mark dequeued run cancelled"),
        }
        pipeline.sink().finish(run_id, RunStatus::Cancelled);
        info!(run_id = %run_id, "run removed from backlog");
        self.notify_if_idle();
        CancelOutcome::Dequeued
    }

    /// Number of pipelines currently executing.
    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.backlog.is_empty() && state.active.is_empty()
    }

    /// Resolve once the backlog is empty and nothing is executing.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Start backlog tasks while slots are free.
    fn dispatch(&self) {
        let started: Vec<(Task, CancellationToken)> = {
            let mut state = self.lock();
            let mut started = Vec::new();
            while state.active.len() < self.inner.max_concurrent {
                let Some(task) = state.backlog.pop_front() else {
                    break;
                };
                let token = CancellationToken::new();
                state.active.insert(task.run_id, token.clone());
                started.push((task, token));
            }
            started
        };

        for (task, token) in started {
            debug!(run_id = %task.run_id, "task admitted");
            tokio::spawn(self.clone().execute(task, token));
        }
    }

    async fn execute(self, task: Task, cancel: CancellationToken) {
        let run_id = task.run_id;
        let pipeline = Arc::clone(&self.inner.pipeline);

        // The inner task isolates panics; the JoinError lands here.
        let handle = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run(&task, &cancel).await }
        });

        let status = match handle.await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!(run_id = %run_id, error = %e, "run pipeline aborted");
                match e.reached_status() {
                    Some(status) => {
                        pipeline.sink().log(
                            run_id,
                            LogEntry::warning(format!("Run {status}, but bookkeeping failed: {e}")),
                        );
                        status
                    }
                    None => self.fail_run(run_id, format!("pipeline aborted: {e}")).await,
                }
            }
            Err(join_err) => {
                error!(run_id = %run_id, error = %join_err, "run pipeline panicked");
                self.fail_run(run_id, format!("pipeline panicked: {join_err}"))
                    .await
            }
        };

        pipeline.recorder().end_run(run_id);
        pipeline.sink().finish(run_id, status);

        self.lock().active.remove(&run_id);
        self.dispatch();
        self.notify_if_idle();
    }

    /// Mark a run failed after its pipeline aborted. A run that is already
    /// terminal keeps its status; storage is not trusted to refuse the write.
    async fn fail_run(&self, run_id: Uuid, reason: String) -> RunStatus {
        let pipeline = &self.inner.pipeline;
        if let Ok(Some(run)) = pipeline.storage().get_run(run_id).await {
            if run.status.is_terminal() {
                warn!(run_id = %run_id, status = %run.status, "run already terminal, not failing it");
                return run.status;
            }
        }
        match pipeline
            .storage()
            .update_run(run_id, RunUpdate::failed(reason.clone()))
            .await
        {
            Ok(run) => {
                pipeline.sink().log(run_id, LogEntry::error(reason));
                run.status
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "could not mark run failed");
                match pipeline.storage().get_run(run_id).await {
                    Ok(Some(run)) if run.status.is_terminal() => run.status,
                    _ => RunStatus::Failed,
                }
            }
        }
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().expect("TaskQueue lock poisoned")
    }
}
