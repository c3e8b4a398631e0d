//! Model pricing and the cost/budget collaborator.
//!
//! The orchestration core never keeps a budget ledger of its own: it reports
//! confirmed spend to a [`CostTracker`] and nothing else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::PricingEntry;

// ---------------------------------------------------------------------------
// Model Pricing
// ---------------------------------------------------------------------------

/// Per-model pricing in USD per 1M tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub input_cost_per_1m: f64,
    pub output_cost_per_1m: f64,
}

impl ModelPricing {
    /// Calculate cost for a request with the given token counts.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_1m
    }
}

impl From<&PricingEntry> for ModelPricing {
    fn from(entry: &PricingEntry) -> Self {
        Self {
            model: entry.model.clone(),
            input_cost_per_1m: entry.input_per_million,
            output_cost_per_1m: entry.output_per_million,
        }
    }
}

/// Lookup table from model name to pricing.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from config entries. Later entries override earlier ones.
    pub fn from_entries(entries: &[PricingEntry]) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(ModelPricing::from(entry));
        }
        table
    }

    pub fn insert(&mut self, pricing: ModelPricing) {
        self.models.insert(pricing.model.clone(), pricing);
    }

    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Cost of a request, or `0.0` when the model is not priced.
    pub fn cost_for(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.get(model)
            .map(|p| p.calculate_cost(input_tokens, output_tokens))
            .unwrap_or(0.0)
    }
}

// ---------------------------------------------------------------------------
// CostTracker
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CostError {
    #[error("cost tracker unavailable: {0}")]
    Unavailable(String),
}

/// Records confirmed spend per organization. Must tolerate concurrent calls.
#[async_trait]
pub trait CostTracker: Send + Sync {
    async fn track_cost(&self, org_id: Uuid, cost_estimate: f64) -> Result<(), CostError>;
}

/// In-process tracker with per-org atomic accumulation.
#[derive(Clone, Default)]
pub struct InMemoryCostTracker {
    totals: Arc<DashMap<Uuid, f64>>,
    calls: Arc<AtomicU64>,
}

impl InMemoryCostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_for(&self, org_id: Uuid) -> f64 {
        self.totals.get(&org_id).map(|v| *v).unwrap_or(0.0)
    }

    /// Number of `track_cost` invocations so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CostTracker for InMemoryCostTracker {
    async fn track_cost(&self, org_id: Uuid, cost_estimate: f64) -> Result<(), CostError> {
        // The entry guard holds the shard lock, so the add is atomic per org.
        *self.totals.entry(org_id).or_insert(0.0) += cost_estimate;
        self.calls.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(org_id = %org_id, cost = cost_estimate, "cost tracked");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
