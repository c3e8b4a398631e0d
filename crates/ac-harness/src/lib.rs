//! Harness: provider adapters and the reliability layer around them.
//!
//! This crate sits between run execution and external AI providers:
//! - [`provider`]: the uniform adapter contract plus scripted and stub adapters
//! - [`http`]: an adapter for OpenAI-compatible chat-completion endpoints
//! - [`registry`]: named adapters and the fallback chain
//! - [`circuit_breaker`]: per-provider breakers shared across tasks
//! - [`retry`]: retry with backoff and cross-provider fallback

pub mod circuit_breaker;
pub mod http;
pub mod provider;
pub mod registry;
pub mod retry;
