use std::collections::HashMap;
use std::sync::Arc;

use ac_agents::pipeline::RunPipeline;
use ac_agents::queue::TaskQueue;
use ac_bridge::event_bus::EventBus;
use ac_bridge::protocol::RunEvent;
use ac_core::config::Config;
use ac_core::cost::{InMemoryCostTracker, PricingTable};
use ac_core::storage::{InMemoryStorage, Storage};
use ac_core::types::{LogLevel, Organization, Run, RunStatus, Task};
use ac_harness::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use ac_harness::registry::ProviderRegistry;
use ac_harness::retry::{RetryOrchestrator, RetryPolicy};
use ac_telemetry::logging;
use anyhow::Context;
use tracing::{info, warn};
use uuid::Uuid;

/// Run the `run` subcommand: one run per goal, live log output, then a
/// summary table and the circuit breaker snapshot.
pub async fn run(
    mut config: Config,
    concurrency: Option<usize>,
    mode: &str,
    goals: &[String],
) -> anyhow::Result<()> {
    if let Some(concurrency) = concurrency {
        config.queue.concurrency = concurrency;
    }
    config.validate().context("invalid configuration")?;
    logging::init_from_config("conduit", &config.logging);

    let registry = ProviderRegistry::from_config(&config)
        .context("failed to bootstrap providers")?;
    info!(providers = ?registry.names(), default_provider = registry.default_provider(), "providers ready");

    let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::from_config(
        &config.circuit_breaker,
        &config.retry,
    ));
    let orchestrator = Arc::new(RetryOrchestrator::new(
        Arc::new(registry),
        Arc::new(breakers),
        RetryPolicy::from_config(&config.retry),
    ));

    let storage = Arc::new(InMemoryStorage::new());
    let tracker = InMemoryCostTracker::new();
    let bus = EventBus::new();
    let pipeline = RunPipeline::new(
        storage.clone(),
        Arc::clone(&orchestrator),
        Arc::new(tracker.clone()),
        Arc::new(bus.clone()),
    )
    .with_pricing(PricingTable::from_entries(&config.pricing));
    let queue = TaskQueue::new(Arc::new(pipeline), config.queue.concurrency);

    let org = Organization::new("local");
    let org_id = org.id;
    storage.insert_org(org).await;
    let project_id = Uuid::new_v4();

    // Subscribe before enqueueing so no event is missed.
    let events = bus.subscribe();
    let mut labels: HashMap<Uuid, usize> = HashMap::new();
    for (idx, goal) in goals.iter().enumerate() {
        let run = storage
            .create_run(Run::new(project_id, org_id, goal.clone()))
            .await
            .context("failed to create run")?;
        labels.insert(run.id, idx + 1);
        queue.enqueue(Task::new(&run, goal.clone(), mode));
    }

    let mut remaining = labels.len();
    while remaining > 0 {
        tokio::select! {
            event = events.recv_async() => {
                let Ok(event) = event else { break };
                let label = labels.get(&event.run_id()).copied().unwrap_or_default();
                match event {
                    RunEvent::Log { entry, .. } => {
                        println!("[run {label}] {:<7} {}", level_label(entry.level), entry.message);
                    }
                    RunEvent::Finished { status, .. } => {
                        println!("[run {label}] finished: {status}");
                        remaining -= 1;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, cancelling runs");
                for run_id in labels.keys() {
                    queue.cancel(*run_id).await;
                }
            }
        }
    }
    queue.wait_idle().await;

    let runs = storage.runs().await;
    println!();
    println!("{:<5} {:<10} {:<12} {:<16} {:>10}  detail", "run", "status", "provider", "model", "cost");
    println!("{}", "-".repeat(72));
    for run in &runs {
        let label = labels.get(&run.id).copied().unwrap_or_default();
        let detail = match run.status {
            RunStatus::Completed => run.output.clone().unwrap_or_default(),
            _ => run.error.clone().unwrap_or_default(),
        };
        println!(
            "{:<5} {:<10} {:<12} {:<16} {:>10.6}  {}",
            label,
            run.status.to_string(),
            run.provider.as_deref().unwrap_or("-"),
            run.model.as_deref().unwrap_or("-"),
            run.cost_estimate,
            truncate(&detail, 60),
        );
    }
    println!("total cost: {:.6}", tracker.total_for(org_id));

    println!();
    println!("circuit breakers:");
    let status = serde_json::to_string_pretty(&orchestrator.get_circuit_status())
        .context("failed to render circuit status")?;
    println!("{status}");

    let unfinished = runs
        .iter()
        .filter(|r| r.status != RunStatus::Completed)
        .count();
    if unfinished > 0 {
        anyhow::bail!("{unfinished} of {} run(s) did not complete", runs.len());
    }
    Ok(())
}

fn level_label(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "info",
        LogLevel::Warning => "warning",
        LogLevel::Success => "success",
        LogLevel::Error => "error",
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.chars().count() <= max_chars {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
