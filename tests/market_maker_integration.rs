//! Market maker quoting against a paper venue

mod common;

use std::time::Duration;

use aleph_fsm::core::{Side, Symbol};
use aleph_fsm::machine::{MetricExtension, StrategyMetrics};
use aleph_fsm::strategies::{MarketMakerConfig, MarketMakerState, MarketMakerStrategy};
use aleph_fsm::StrategyMachine;
use common::{fast_deps, launch, step_until, venue};
use rust_decimal_macros::dec;

fn config() -> MarketMakerConfig {
    let mut cfg = MarketMakerConfig::new("mm", "ETH-USD", dec!(1), dec!(2));
    cfg.levels = 1;
    cfg.max_cycles = 1;
    cfg.quote_ttl_ms = 60_000;
    cfg.requote_threshold_bps = dec!(50);
    cfg.monitor_interval_ms = 10;
    cfg
}

#[tokio::test]
async fn test_fill_then_flatten_on_exit() {
    let mm_venue = venue("mm");
    mm_venue.set_quote("ETH-USD", dec!(3000), dec!(3000.2));
    let deps = fast_deps(&[&mm_venue]);
    let mut mm = MarketMakerStrategy::new(launch("mm-fill", Duration::from_secs(10)), &deps, config()).unwrap();

    let quoting = step_until(&mut mm, 5, |m| {
        m.context().state() == MarketMakerState::MonitoringOrders
    })
    .await;
    assert!(quoting);
    assert_eq!(mm.resting_orders().len(), 2);
    // 20bps default vol before the window fills: 10 + 0.5 * 20 = 20bps wide
    let bid = mm
        .resting_orders()
        .iter()
        .find(|o| o.side == Side::Buy)
        .and_then(|o| o.price);
    assert_eq!(bid, Some(dec!(2997.0999)));

    // Market trades through our bid
    mm_venue.set_quote("ETH-USD", dec!(2996), dec!(2997));
    let result = mm.run_cycle().await.unwrap();

    assert!(result.success, "{:?}", result.error);
    let StrategyMetrics::MarketMaking(metrics) = &result.metrics else {
        panic!("wrong metrics family");
    };
    assert_eq!(metrics.fills, 2);
    assert_eq!(metrics.buy_volume, dec!(1));
    assert_eq!(metrics.sell_volume, dec!(1));
    assert!(metrics.flattened);
    assert_eq!(metrics.final_inventory, dec!(0));
    assert_eq!(result.orders_executed, 2);
    assert_eq!(result.realized_pnl, dec!(-1.0999));
    assert!(matches!(result.extension, Some(MetricExtension::RealizedVolatility { .. })));

    assert_eq!(mm_venue.open_orders(), 0);
    assert_eq!(mm_venue.position_quantity(&Symbol::new("ETH-USD")), dec!(0));
}

#[tokio::test]
async fn test_deadline_pulls_resting_quotes() {
    let mm_venue = venue("mm");
    mm_venue.set_quote("ETH-USD", dec!(3000), dec!(3000.2));
    let deps = fast_deps(&[&mm_venue]);
    let mut cfg = config();
    cfg.quote_ttl_ms = 40;
    let mut mm = MarketMakerStrategy::new(launch("mm-timeout", Duration::from_millis(300)), &deps, cfg).unwrap();

    let result = mm.run_cycle().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.final_state, "Error");
    let StrategyMetrics::MarketMaking(metrics) = &result.metrics else {
        panic!("wrong metrics family");
    };
    assert_eq!(metrics.fills, 0);
    assert!(metrics.requotes >= 1);
    assert!(metrics.quotes_placed >= 4);
    assert!(mm.resting_orders().is_empty());
    assert_eq!(mm_venue.open_orders(), 0);
}

#[tokio::test]
async fn test_long_inventory_skews_next_ladder() {
    let mm_venue = venue("mm");
    mm_venue.set_quote("ETH-USD", dec!(3000), dec!(3000.2));
    let deps = fast_deps(&[&mm_venue]);
    let mut cfg = config();
    cfg.max_cycles = 2;
    cfg.flatten_on_exit = false;
    let mut mm = MarketMakerStrategy::new(launch("mm-skew", Duration::from_secs(10)), &deps, cfg).unwrap();

    step_until(&mut mm, 5, |m| m.context().state() == MarketMakerState::MonitoringOrders).await;
    mm_venue.set_quote("ETH-USD", dec!(2996), dec!(2997));
    let requoted = step_until(&mut mm, 10, |m| {
        m.context().state() == MarketMakerState::MonitoringOrders && m.metrics().cycles == 1
    })
    .await;
    assert!(requoted);
    assert_eq!(mm.inventory(), dec!(1));

    // Half the cap long: bids halve, asks grow by half
    let bid = mm.resting_orders().iter().find(|o| o.side == Side::Buy);
    let ask = mm.resting_orders().iter().find(|o| o.side == Side::Sell);
    assert_eq!(bid.map(|o| o.quantity), Some(dec!(0.5)));
    assert_eq!(ask.map(|o| o.quantity), Some(dec!(1.5)));

    mm.context().cancel_handle().cancel();
    let result = mm.run_cycle().await.unwrap();
    assert_eq!(result.final_state, "Cancelled");
    assert_eq!(mm_venue.open_orders(), 0);
}
