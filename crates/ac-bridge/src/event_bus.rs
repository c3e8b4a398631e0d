use std::sync::{Arc, Mutex};

use ac_core::types::{LogEntry, RunStatus};
use uuid::Uuid;

use crate::protocol::RunEvent;

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Destination for a run's log events.
///
/// The executing pipeline is handed a sink rather than reaching for a global
/// emitter. Implementations must not block: they are called inline between
/// pipeline steps.
pub trait LogSink: Send + Sync {
    fn log(&self, run_id: Uuid, entry: LogEntry);

    /// Close the run's stream. Called exactly once per run.
    fn finish(&self, run_id: Uuid, status: RunStatus);
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`subscribe`](EventBus::subscribe) creates a new receiver that
/// will receive all events published after the subscription was created. The
/// bus is thread-safe and can be cloned cheaply (it wraps its internals in an
/// `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<RunEvent>>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> flume::Receiver<RunEvent> {
        let (tx, rx) = flume::unbounded();
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Subscribe to the events of a single run.
    ///
    /// Subscribe before enqueueing the run, or early events are missed.
    pub fn subscribe_run(&self, run_id: Uuid) -> RunLogStream {
        RunLogStream {
            run_id,
            rx: self.subscribe(),
            status: None,
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Disconnected subscribers (whose receivers have been dropped) are
    /// automatically pruned.
    pub fn publish(&self, event: RunEvent) {
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Return the number of currently active subscribers.
    pub fn subscriber_count(&self) -> usize {
        let senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for EventBus {
    fn log(&self, run_id: Uuid, entry: LogEntry) {
        self.publish(RunEvent::Log { run_id, entry });
    }

    fn finish(&self, run_id: Uuid, status: RunStatus) {
        self.publish(RunEvent::Finished { run_id, status });
    }
}

// ---------------------------------------------------------------------------
// RunLogStream
// ---------------------------------------------------------------------------

/// Ordered log entries for one run, ending at the run's terminal state.
pub struct RunLogStream {
    run_id: Uuid,
    rx: flume::Receiver<RunEvent>,
    status: Option<RunStatus>,
}

impl RunLogStream {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next log entry for this run, or `None` once the run has finished (or
    /// the bus is gone).
    pub async fn next(&mut self) -> Option<LogEntry> {
        if self.status.is_some() {
            return None;
        }
        while let Ok(event) = self.rx.recv_async().await {
            match event {
                RunEvent::Log { run_id, entry } if run_id == self.run_id => return Some(entry),
                RunEvent::Finished { run_id, status } if run_id == self.run_id => {
                    self.status = Some(status);
                    return None;
                }
                _ => {}
            }
        }
        None
    }

    /// Terminal status, available once [`next`](Self::next) has returned `None`.
    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    /// Drain every remaining entry until the run finishes.
    pub async fn collect(mut self) -> (Vec<LogEntry>, Option<RunStatus>) {
        let mut entries = Vec::new();
        while let Some(entry) = self.next().await {
            entries.push(entry);
        }
        (entries, self.status)
    }
}
