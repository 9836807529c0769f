//! Registry lookup and config-driven launches

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use aleph_fsm::exchanges::PaperExchange;
use aleph_fsm::machine::StrategyResult;
use aleph_fsm::registry::{collect_results, StrategyDeps, StrategyLaunch, StrategyRegistry};
use aleph_fsm::strategies::SimpleArbitrageConfig;
use aleph_fsm::{EngineConfig, Error, Exchange};
use common::{fast_deps, params, venue};
use rust_decimal_macros::dec;

const ENGINE_TOML: &str = r#"
[engine]
max_execution_time_ms = 5000

[fill]
poll_interval_ms = 5
fill_timeout_ms = 50

[[venues]]
name = "venue-a"
fee_rate = 0
quotes = [{ symbol = "BTC-USD", bid = 99.9, ask = 100.0 }]

[[venues]]
name = "venue-b"
fee_rate = 0
quotes = [{ symbol = "BTC-USD", bid = 100.6, ask = 100.7 }]

[[strategies]]
type = "simple_arbitrage"
id = "arb-from-config"
max_execution_time_ms = 2000
[strategies.params]
venue_a = "venue-a"
venue_b = "venue-b"
symbol = "BTC-USD"
quantity = 2
fee_rate_a = 0
fee_rate_b = 0
"#;

#[test]
fn test_builtin_names_are_sorted() {
    let registry = StrategyRegistry::with_builtin();
    assert_eq!(
        registry.names(),
        vec!["futures_spread", "market_maker", "simple_arbitrage", "spot_futures_hedge"]
    );
    assert!(registry.contains("market_maker"));
    assert!(!registry.contains("grid"));
}

#[test]
fn test_unknown_name_is_config_error() {
    let registry = StrategyRegistry::with_builtin();
    let deps = fast_deps(&[]);
    let err = registry
        .create("grid", StrategyLaunch::new("g-1"), &deps)
        .err()
        .expect("unknown type");
    assert!(matches!(err, Error::Config(msg) if msg.contains("grid")));
}

#[test]
fn test_bad_params_fail_construction() {
    let registry = StrategyRegistry::with_builtin();
    let a = venue("venue-a");
    let deps = fast_deps(&[&a]);

    // Missing required fields
    let launch = StrategyLaunch::new("arb-bad").with_params(params("symbol = \"BTC-USD\""));
    assert!(matches!(
        registry.create("simple_arbitrage", launch, &deps),
        Err(Error::Config(_))
    ));

    // Venue not wired into deps
    let launch = StrategyLaunch::new("arb-missing").with_params(params(
        r#"
        venue_a = "venue-a"
        venue_b = "nowhere"
        symbol = "BTC-USD"
        quantity = 1
        "#,
    ));
    assert!(matches!(
        registry.create("simple_arbitrage", launch, &deps),
        Err(Error::Config(msg)) if msg.contains("nowhere")
    ));
}

#[test]
fn test_launch_params_fill_defaults() {
    let launch = StrategyLaunch::new("arb-defaults").with_params(params(
        r#"
        venue_a = "venue-a"
        venue_b = "venue-b"
        symbol = "BTC-USD"
        quantity = 1.5
        "#,
    ));
    let cfg: SimpleArbitrageConfig = launch.params().unwrap();
    assert_eq!(cfg.quantity, dec!(1.5));
    assert_eq!(cfg.min_profit_bps, dec!(10));
    assert_eq!(cfg.max_scans, None);
}

fn config_deps(config: &EngineConfig) -> StrategyDeps {
    let venues: HashMap<String, Arc<dyn Exchange>> = config
        .venues
        .iter()
        .map(|v| {
            let venue: Arc<dyn Exchange> = Arc::new(PaperExchange::from_config(v));
            (v.name.clone(), venue)
        })
        .collect();
    StrategyDeps::from_config(config, venues)
}

#[tokio::test]
async fn test_config_entry_runs_through_registry() {
    let config = EngineConfig::parse(ENGINE_TOML).unwrap();
    let deps = config_deps(&config);
    let registry = StrategyRegistry::with_builtin();

    let entry = &config.strategies[0];
    let launch = StrategyLaunch::from_entry(entry, &config.engine);
    assert_eq!(launch.max_execution_time.as_millis(), 2000);
    assert_eq!(launch.max_error_count, 5);

    let mut runner = registry.create(&entry.kind, launch, &deps).unwrap();
    assert_eq!(runner.strategy_id(), "arb-from-config");
    assert_eq!(runner.strategy_type(), "simple_arbitrage");
    assert_eq!(runner.state_name(), "ScanningOpportunities");

    let result = tokio::spawn(async move { runner.run().await })
        .await
        .unwrap()
        .unwrap();
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.realized_pnl, dec!(1.2));
    assert_eq!(result.orders_executed, 2);
}

#[tokio::test]
async fn test_failed_runs_do_not_drop_later_results() {
    let config = EngineConfig::parse(ENGINE_TOML).unwrap();
    let deps = config_deps(&config);
    let registry = StrategyRegistry::with_builtin();
    let entry = &config.strategies[0];
    let mut runner = registry
        .create(&entry.kind, StrategyLaunch::from_entry(entry, &config.engine), &deps)
        .unwrap();

    let handles: Vec<tokio::task::JoinHandle<aleph_fsm::Result<StrategyResult>>> = vec![
        tokio::spawn(async { Err(Error::AlreadyFinished) }),
        tokio::spawn(async {
            if true {
                panic!("strategy task blew up");
            }
            Err(Error::AlreadyFinished)
        }),
        tokio::spawn(async move { runner.run().await }),
    ];

    let (results, lost) = collect_results(handles).await;
    assert_eq!(lost, 2);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].strategy_id, "arb-from-config");
    assert!(results[0].success);
}
