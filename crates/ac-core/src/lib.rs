//! Core domain types and collaborator ports for the agent-conduit engine.
//!
//! - [`types`]: runs, tasks, messages, decision traces, log entries
//! - [`config`]: TOML configuration with validation
//! - [`storage`]: the persistence port and an in-memory implementation
//! - [`cost`]: model pricing and the cost-tracker port

pub mod config;
pub mod cost;
pub mod storage;
pub mod types;
