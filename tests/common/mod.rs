//! Common test utilities and fixtures

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use aleph_fsm::core::config::{FillConfig, RetryConfig};
use aleph_fsm::exchanges::PaperExchange;
use aleph_fsm::registry::{StrategyDeps, StrategyLaunch};
use aleph_fsm::{Exchange, StrategyMachine};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Paper venue with no fees and no random walk.
pub fn venue(name: &str) -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(name, Decimal::ZERO))
}

pub fn venue_with_fee(name: &str, fee_rate: Decimal) -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(name, fee_rate))
}

/// Deps with short retry delays and fill timeouts so tests stay fast.
pub fn fast_deps(venues: &[&Arc<PaperExchange>]) -> StrategyDeps {
    let mut deps = StrategyDeps::new(Default::default());
    for venue in venues {
        let venue: Arc<dyn Exchange> = (*venue).clone();
        deps = deps.with_venue(venue);
    }
    deps.retry = RetryConfig {
        max_retries: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_factor: 2.0,
        jitter: false,
    };
    deps.fill = FillConfig {
        poll_interval_ms: 5,
        fill_timeout_ms: 50,
    };
    deps
}

pub fn launch(id: &str, max_execution: Duration) -> StrategyLaunch {
    StrategyLaunch::new(id).with_max_execution_time(max_execution)
}

/// Parse a TOML snippet into a strategy params table.
pub fn params(toml_src: &str) -> toml::Table {
    toml::from_str(toml_src).expect("valid params toml")
}

/// Step until `done` holds or `max_steps` run out. Returns whether it held.
pub async fn step_until<M, F>(machine: &mut M, max_steps: usize, done: F) -> bool
where
    M: StrategyMachine,
    F: Fn(&M) -> bool,
{
    for _ in 0..max_steps {
        if done(machine) {
            return true;
        }
        if !machine.step().await.expect("step") {
            return done(machine);
        }
    }
    done(machine)
}

/// BTC spot and perp venues quoted around 50,000 with a ~10bps basis.
pub fn hedge_venues() -> (Arc<PaperExchange>, Arc<PaperExchange>) {
    let spot = venue("spot");
    spot.set_quote("BTC-USDT", dec!(49999), dec!(50000));
    let perp = venue("perp");
    perp.set_quote("BTC-PERP", dec!(50050), dec!(50051));
    (spot, perp)
}

/// Same symbol on two venues with venue B richer by ~60bps.
pub fn arbitrage_venues(fee_rate: Decimal) -> (Arc<PaperExchange>, Arc<PaperExchange>) {
    let a = venue_with_fee("venue-a", fee_rate);
    a.set_quote("BTC-USD", dec!(99.9), dec!(100));
    let b = venue_with_fee("venue-b", fee_rate);
    b.set_quote("BTC-USD", dec!(100.6), dec!(100.7));
    (a, b)
}
