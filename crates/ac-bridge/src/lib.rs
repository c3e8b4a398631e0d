//! Bridge layer between the orchestration core and whatever streams run
//! progress to the outside world.
//!
//! - [`protocol`]: the run event wire shape
//! - [`event_bus`]: flume-backed fan-out, the [`event_bus::LogSink`] port, and
//!   per-run log streams

pub mod event_bus;
pub mod protocol;
