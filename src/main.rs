use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::fmt;

use aleph_fsm::exchanges::PaperExchange;
use aleph_fsm::registry::{collect_results, StrategyDeps, StrategyLaunch, StrategyRegistry};
use aleph_fsm::{EngineConfig, Exchange};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    // 1. Config, read first so the log filter can come from it
    let (config, fallback) = match std::env::var("ALEPH_FSM_CONFIG") {
        Ok(path) => {
            let path = PathBuf::from(path);
            let config = EngineConfig::load(&path).with_context(|| format!("loading {}", path.display()))?;
            (config, None)
        }
        Err(_) => EngineConfig::load_default(),
    };

    // 2. Logger
    fmt()
        .with_env_filter(config.engine.log_filter())
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 AlephFSM starting (paper mode)...");
    match fallback {
        Some(e) => tracing::warn!("⚠️ No usable config.toml ({}), using defaults", e),
        None => tracing::info!("📋 Config loaded ({} strategies)", config.strategies.len()),
    }

    // 3. Paper venues
    let mut venues: HashMap<String, Arc<dyn Exchange>> = HashMap::new();
    for venue in &config.venues {
        let paper = PaperExchange::from_config(venue);
        tracing::info!("📡 paper venue {} ({} seeded quotes)", venue.name, venue.quotes.len());
        venues.insert(venue.name.clone(), Arc::new(paper));
    }
    let deps = StrategyDeps::from_config(&config, venues);

    // 4. Strategies
    let registry = StrategyRegistry::with_builtin();
    let mut handles = Vec::with_capacity(config.strategies.len());
    for entry in &config.strategies {
        let launch = StrategyLaunch::from_entry(entry, &config.engine);
        let mut runner = registry
            .create(&entry.kind, launch, &deps)
            .with_context(|| format!("creating strategy '{}'", entry.kind))?;
        tracing::info!("▶️ launching {} ({})", runner.strategy_id(), runner.strategy_type());
        handles.push(tokio::spawn(async move { runner.run().await }));
    }

    if handles.is_empty() {
        tracing::warn!("⚠️ no strategies configured, nothing to do");
        return Ok(());
    }
    tracing::info!("⏳ {} strategies running", handles.len());

    // 5. Results
    let (results, lost) = collect_results(handles).await;
    let mut failures = lost;
    for result in &results {
        if !result.success {
            failures += 1;
        }
        println!("{}", serde_json::to_string_pretty(result)?);
    }

    if failures > 0 {
        tracing::warn!("⚠️ {} strategies did not complete successfully", failures);
    } else {
        tracing::info!("✅ all strategies completed");
    }
    Ok(())
}
