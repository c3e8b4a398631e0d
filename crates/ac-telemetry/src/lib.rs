//! Logging setup for conduit binaries and tests.
//!
//! Library crates only emit `tracing` events; this crate installs the global
//! subscriber. Output goes to stderr so stdout stays free for run output.

pub mod logging;
