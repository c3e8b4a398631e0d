//! Run execution: decision tracing, the per-run pipeline, and the
//! bounded-concurrency task queue that drives it.

pub mod pipeline;
pub mod queue;
pub mod trace;
