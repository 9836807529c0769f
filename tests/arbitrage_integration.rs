//! Simple arbitrage end to end against paper venues

mod common;

use std::time::Duration;

use aleph_fsm::core::{ExchangeError, Orderbook, PriceLevel, Severity, Symbol};
use aleph_fsm::exchanges::Operation;
use aleph_fsm::machine::{MetricExtension, StrategyMetrics, UnwindOutcome};
use aleph_fsm::strategies::{SimpleArbitrageConfig, SimpleArbitrageState, SimpleArbitrageStrategy};
use aleph_fsm::{Error, StrategyMachine};
use common::{arbitrage_venues, fast_deps, launch, step_until};
use rust_decimal_macros::dec;

fn config() -> SimpleArbitrageConfig {
    let mut cfg = SimpleArbitrageConfig::new("venue-a", "venue-b", "BTC-USD", dec!(10));
    cfg.fee_rate_a = dec!(0.0001);
    cfg.fee_rate_b = dec!(0.0001);
    cfg
}

#[tokio::test]
async fn test_profit_is_sell_minus_buy_less_fees() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    let deps = fast_deps(&[&a, &b]);
    let mut arb =
        SimpleArbitrageStrategy::new(launch("arb-a", Duration::from_secs(5)), &deps, config()).unwrap();

    let result = arb.run_cycle().await.unwrap();

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.final_state, "Completed");
    assert_eq!(result.orders_executed, 2);
    assert_eq!(result.realized_pnl, dec!(6));
    assert_eq!(result.fees, dec!(0.2006));
    assert_eq!(result.net_pnl(), dec!(5.7994));

    let StrategyMetrics::Arbitrage(metrics) = &result.metrics else {
        panic!("wrong metrics family");
    };
    assert_eq!(metrics.net_profit, Some(dec!(5.7994)));
    assert_eq!(metrics.matched_quantity, dec!(10));
    assert_eq!(metrics.buy_venue.as_deref(), Some("venue-a"));
    assert_eq!(metrics.sell_venue.as_deref(), Some("venue-b"));

    let symbol = Symbol::new("BTC-USD");
    assert_eq!(a.position_quantity(&symbol), dec!(10));
    assert_eq!(b.position_quantity(&symbol), dec!(-10));
}

#[tokio::test]
async fn test_sell_failure_after_buy_is_escalated_not_retried() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    b.fail_next(
        Operation::PlaceMarket,
        ExchangeError::InsufficientBalance("no BTC to sell".into()),
    );
    let deps = fast_deps(&[&a, &b]);
    let mut arb =
        SimpleArbitrageStrategy::new(launch("arb-d", Duration::from_secs(5)), &deps, config()).unwrap();

    let result = arb.run_cycle().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.final_state, "Error");
    assert_eq!(result.error_severity, Some(Severity::Escalation));
    let escalation = result.escalation.expect("escalation recorded");
    assert_eq!(escalation.filled_leg, "venue-a:BTC-USD");
    assert_eq!(escalation.failed_leg, "venue-b:BTC-USD");
    assert_eq!(escalation.exposure_quantity, dec!(10));
    assert_eq!(escalation.unwind, UnwindOutcome::NotAttempted);

    // One placement attempt on the sell venue, and the buy is left standing
    assert_eq!(b.call_count(Operation::PlaceMarket), 1);
    assert_eq!(a.position_quantity(&Symbol::new("BTC-USD")), dec!(10));
}

#[tokio::test]
async fn test_scan_budget_completes_without_trading() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    b.set_quote("BTC-USD", dec!(99.95), dec!(100.05));
    let deps = fast_deps(&[&a, &b]);
    let mut cfg = config();
    cfg.max_scans = Some(3);
    cfg.scan_interval_ms = 1;
    let mut arb = SimpleArbitrageStrategy::new(launch("arb-idle", Duration::from_secs(5)), &deps, cfg).unwrap();

    let result = arb.run_cycle().await.unwrap();

    assert!(result.success);
    assert_eq!(result.orders_executed, 0);
    assert_eq!(a.call_count(Operation::PlaceMarket), 0);
    assert_eq!(arb.metrics().opportunities_scanned, 3);
}

#[tokio::test]
async fn test_size_capped_to_top_of_book() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    let deps = fast_deps(&[&a, &b]);
    let mut cfg = config();
    cfg.quantity = dec!(150);
    let mut arb = SimpleArbitrageStrategy::new(launch("arb-cap", Duration::from_secs(5)), &deps, cfg).unwrap();

    let result = arb.run_cycle().await.unwrap();

    assert!(result.success, "{:?}", result.error);
    let StrategyMetrics::Arbitrage(metrics) = &result.metrics else {
        panic!("wrong metrics family");
    };
    assert_eq!(metrics.matched_quantity, dec!(100));
}

#[tokio::test]
async fn test_thin_book_sends_back_to_scanning() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    // 5 lots at the touch, the rest 100bps away
    a.set_orderbook(Orderbook {
        symbol: Symbol::new("BTC-USD"),
        bids: vec![PriceLevel::new(dec!(99.9), dec!(100))],
        asks: vec![
            PriceLevel::new(dec!(100), dec!(5)),
            PriceLevel::new(dec!(101), dec!(100)),
        ],
        timestamp: 0,
    });
    let deps = fast_deps(&[&a, &b]);
    let mut cfg = config();
    cfg.max_scans = Some(2);
    cfg.scan_interval_ms = 1;
    let mut arb = SimpleArbitrageStrategy::new(launch("arb-thin", Duration::from_secs(5)), &deps, cfg).unwrap();

    let result = arb.run_cycle().await.unwrap();

    assert!(result.success);
    assert_eq!(result.orders_executed, 0);
    assert_eq!(arb.metrics().validation_failures, 2);
    assert_eq!(a.call_count(Operation::PlaceMarket), 0);
}

#[tokio::test]
async fn test_stalled_venue_hits_deadline() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    a.set_latency(Duration::from_millis(1100));
    b.set_latency(Duration::from_millis(1100));
    let deps = fast_deps(&[&a, &b]);
    let mut arb =
        SimpleArbitrageStrategy::new(launch("arb-c", Duration::from_millis(1000)), &deps, config()).unwrap();

    let result = arb.run_cycle().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.final_state, "Error");
    assert!(result.execution_time_ms >= 1000);
    assert_eq!(a.call_count(Operation::PlaceMarket), 0);
}

#[tokio::test]
async fn test_result_is_emitted_once() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    let deps = fast_deps(&[&a, &b]);
    let mut arb =
        SimpleArbitrageStrategy::new(launch("arb-once", Duration::from_secs(5)), &deps, config()).unwrap();

    arb.run_cycle().await.unwrap();
    assert!(matches!(arb.run_cycle().await, Err(Error::AlreadyFinished)));
}

#[tokio::test]
async fn test_deadline_between_legs_escalates_open_buy() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    let deps = fast_deps(&[&a, &b]);
    let mut arb =
        SimpleArbitrageStrategy::new(launch("arb-late", Duration::from_millis(300)), &deps, config()).unwrap();

    let ready = step_until(&mut arb, 10, |m| {
        m.context().state() == SimpleArbitrageState::ExecutingBuySide
    })
    .await;
    assert!(ready);

    // The buy fills, but only after the deadline
    a.set_latency(Duration::from_millis(350));
    let result = arb.run_cycle().await.unwrap();

    assert!(!result.success);
    assert_eq!(result.final_state, "Error");
    assert_eq!(result.error_severity, Some(Severity::Escalation));
    let escalation = result.escalation.expect("open buy escalated");
    assert_eq!(escalation.filled_leg, "venue-a:BTC-USD");
    assert_eq!(escalation.failed_leg, "venue-b:BTC-USD");
    assert_eq!(escalation.exposure_quantity, dec!(10));
    assert_eq!(escalation.unwind, UnwindOutcome::NotAttempted);
    assert!(escalation.reason.contains("timed out"));
    assert_eq!(
        result.extension,
        Some(MetricExtension::ResidualExposure {
            leg: "venue-a:BTC-USD".into(),
            quantity: dec!(10),
        })
    );

    assert_eq!(b.call_count(Operation::PlaceMarket), 0);
    assert_eq!(a.position_quantity(&Symbol::new("BTC-USD")), dec!(10));
}

#[tokio::test]
async fn test_cancel_between_legs_escalates_open_buy() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    let deps = fast_deps(&[&a, &b]);
    let mut arb =
        SimpleArbitrageStrategy::new(launch("arb-cancel", Duration::from_secs(5)), &deps, config()).unwrap();

    let bought = step_until(&mut arb, 10, |m| {
        m.context().state() == SimpleArbitrageState::ExecutingSellSide
    })
    .await;
    assert!(bought);

    arb.context().cancel_handle().cancel();
    let result = arb.run_cycle().await.unwrap();

    assert_eq!(result.final_state, "Cancelled");
    assert!(result.escalated());
    assert_eq!(result.error_severity, Some(Severity::Escalation));
    let escalation = result.escalation.expect("open buy escalated");
    assert_eq!(escalation.filled_leg, "venue-a:BTC-USD");
    assert_eq!(escalation.exposure_quantity, dec!(10));
    assert!(matches!(result.extension, Some(MetricExtension::ResidualExposure { .. })));
    assert_eq!(b.call_count(Operation::PlaceMarket), 0);
}

#[tokio::test]
async fn test_completed_arbitrage_reports_no_residual() {
    let (a, b) = arbitrage_venues(dec!(0.0001));
    let deps = fast_deps(&[&a, &b]);
    let mut arb =
        SimpleArbitrageStrategy::new(launch("arb-flat", Duration::from_secs(5)), &deps, config()).unwrap();

    let result = arb.run_cycle().await.unwrap();
    assert!(result.success);
    assert!(result.escalation.is_none());
    assert!(result.extension.is_none());
}
