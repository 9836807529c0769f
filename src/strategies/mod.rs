//! Trading strategies - concrete state machines and the components they share

pub mod futures_spread;
pub mod market_maker;
pub mod simple_arbitrage;
pub mod spot_futures_hedge;

use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::core::{Error, Exchange, Order, Result, Side, Symbol};
use crate::execution::{FillDelta, FillLedger, MarketData, OrderExecutor, OrderIntent};
use crate::machine::{
    Escalation, MetricExtension, StrategyContext, StrategyState, UnwindOutcome, UnwindPolicy,
};
use crate::registry::StrategyDeps;
use crate::risk::RiskGuard;

pub use futures_spread::{FuturesSpreadConfig, FuturesSpreadState, FuturesSpreadStrategy};
pub use market_maker::{MarketMakerConfig, MarketMakerState, MarketMakerStrategy};
pub use simple_arbitrage::{SimpleArbitrageConfig, SimpleArbitrageState, SimpleArbitrageStrategy};
pub use spot_futures_hedge::{
    SpotFuturesHedgeConfig, SpotFuturesHedgeState, SpotFuturesHedgeStrategy,
};

/// One instrument on one venue.
#[derive(Clone)]
pub struct Leg {
    pub venue: Arc<dyn Exchange>,
    pub symbol: Symbol,
}

impl Leg {
    pub fn new(venue: Arc<dyn Exchange>, symbol: impl Into<Symbol>) -> Self {
        Self {
            venue,
            symbol: symbol.into(),
        }
    }

    pub fn from_deps(deps: &StrategyDeps, venue: &str, symbol: &str) -> Result<Self> {
        Ok(Self::new(deps.venue(venue)?, symbol))
    }

    pub fn venue_name(&self) -> &str {
        self.venue.name()
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.venue.name(), self.symbol)
    }

    pub fn market(&self, side: Side, quantity: Decimal) -> OrderIntent {
        OrderIntent::market(self.symbol.clone(), side, quantity)
    }
}

impl std::fmt::Debug for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Execution, market data, risk and fill accounting composed into one
/// per-instance bundle.
#[derive(Debug, Clone)]
pub struct Toolkit {
    pub orders: OrderExecutor,
    pub market: MarketData,
    pub risk: RiskGuard,
    pub ledger: FillLedger,
}

impl Toolkit {
    /// Order retries are cut at `deadline`.
    pub fn new(deps: &StrategyDeps, deadline: Option<Instant>) -> Self {
        Self {
            orders: OrderExecutor::new(deps.retry.clone(), &deps.fill).with_deadline(deadline),
            market: MarketData::new(deps.market_data.clone()),
            risk: RiskGuard::new(deps.risk.clone()),
            ledger: FillLedger::new(),
        }
    }

    /// Book whatever part of `order` has not been booked yet.
    pub fn book(&mut self, order: &Order) -> Option<FillDelta> {
        let delta = self.ledger.absorb(order)?;
        self.risk.apply_fill(
            &delta.venue,
            &delta.symbol,
            delta.side,
            delta.quantity,
            delta.price,
            delta.fee,
        );
        Some(delta)
    }

    /// Signed position this instance holds on `leg`.
    pub fn open_quantity(&self, leg: &Leg) -> Decimal {
        self.risk.inventory().quantity(leg.venue_name(), &leg.symbol)
    }

    pub fn orders_executed(&self) -> u32 {
        self.ledger.orders_filled() as u32
    }

    pub fn check_order(&self, leg: &Leg, side: Side, quantity: Decimal, price: Decimal) -> Result<()> {
        self.risk
            .check_order(leg.venue_name(), &leg.symbol, side, quantity, price, Decimal::ZERO)?;
        Ok(())
    }

    /// Risk-check, place, wait up to `wait`, cancel any unfilled remainder and
    /// book the fills. The returned order carries the venue's final view.
    pub async fn execute_leg(
        &mut self,
        leg: &Leg,
        intent: &OrderIntent,
        reference_price: Decimal,
        wait: Duration,
    ) -> Result<Order> {
        self.check_order(leg, intent.side, intent.quantity, reference_price)?;
        let mut order = self.orders.execute(leg.venue.as_ref(), intent, wait).await?;
        self.settle(leg, &mut order).await;
        Ok(order)
    }

    /// Cancel the unfilled remainder of `order` (best effort) and book its fills.
    pub async fn settle(&mut self, leg: &Leg, order: &mut Order) {
        if !order.status.is_terminal() {
            if let Err(e) = self.orders.cancel_order(leg.venue.as_ref(), order).await {
                tracing::warn!("⚠️ cancel of {} on {} failed: {}", order.id, leg.label(), e);
            }
        }
        self.book(order);
    }
}

/// Handle "first leg filled, second leg failed".
///
/// With [`UnwindPolicy::AutoUnwind`] the filled exposure is reversed with a
/// market order. Either way the returned record is escalated.
pub(crate) async fn resolve_broken_pair(
    tk: &mut Toolkit,
    filled_leg: &Leg,
    exposure: Decimal,
    failed_leg: &Leg,
    reason: String,
    policy: UnwindPolicy,
    wait: Duration,
) -> Escalation {
    error!(
        "🚨 {} filled {} but {} failed: {}",
        filled_leg.label(),
        exposure,
        failed_leg.label(),
        reason
    );

    let unwind = match policy {
        UnwindPolicy::Escalate => UnwindOutcome::NotAttempted,
        UnwindPolicy::AutoUnwind if exposure.is_zero() => UnwindOutcome::NotAttempted,
        UnwindPolicy::AutoUnwind => {
            let side = if exposure.is_sign_positive() {
                Side::Sell
            } else {
                Side::Buy
            };
            let intent = filled_leg.market(side, exposure.abs());
            match tk.orders.execute(filled_leg.venue.as_ref(), &intent, wait).await {
                Ok(mut order) => {
                    tk.settle(filled_leg, &mut order).await;
                    if order.filled_quantity.is_zero() {
                        UnwindOutcome::Failed {
                            reason: format!("unwind order {} did not fill", order.id),
                        }
                    } else {
                        info!("♻️ unwound {} {} on {}", side, order.filled_quantity, filled_leg.label());
                        UnwindOutcome::Unwound {
                            order_id: order.id.clone(),
                            quantity: order.filled_quantity,
                            price: order.average_price.unwrap_or(Decimal::ZERO),
                        }
                    }
                }
                Err(e) => UnwindOutcome::Failed {
                    reason: e.to_string(),
                },
            }
        }
    };

    Escalation {
        filled_leg: filled_leg.label(),
        failed_leg: failed_leg.label(),
        exposure_quantity: exposure,
        reason,
        unwind,
    }
}

/// The one open leg of a pair whose partner is flat: `(open, flat, quantity)`.
pub(crate) fn stranded_leg<'a>(tk: &Toolkit, first: &'a Leg, second: &'a Leg) -> Option<(&'a Leg, &'a Leg, Decimal)> {
    let (first_open, second_open) = (tk.open_quantity(first), tk.open_quantity(second));
    match (is_dust(first_open), is_dust(second_open)) {
        (false, true) => Some((first, second, first_open)),
        (true, false) => Some((second, first, second_open)),
        _ => None,
    }
}

/// Escalate a pair left with one leg open by a forced Error or Cancelled.
///
/// May run past the deadline, so the unwind gets a full fill wait rather
/// than what is left of the instance budget.
pub(crate) async fn escalate_stranded<S: StrategyState>(
    tk: &mut Toolkit,
    ctx: &mut StrategyContext<S>,
    first: &Leg,
    second: &Leg,
    policy: UnwindPolicy,
) -> Option<Escalation> {
    let state = ctx.state();
    if state != S::ERROR && state != S::CANCELLED {
        return None;
    }
    let (open, flat, exposure) = stranded_leg(tk, first, second)?;
    let (open, flat) = (open.clone(), flat.clone());

    let cause = ctx.last_error().unwrap_or("cancel requested");
    let reason = format!("{} entered {} with one leg open: {}", ctx.strategy_id(), state.name(), cause);
    let wait = tk.orders.fill_timeout();
    let escalation = resolve_broken_pair(tk, &open, exposure, &flat, reason, policy, wait).await;
    ctx.record_error(&partial_execution_error(&escalation));
    Some(escalation)
}

pub(crate) fn partial_execution_error(escalation: &Escalation) -> Error {
    Error::PartialExecution {
        filled_leg: escalation.filled_leg.clone(),
        failed_leg: escalation.failed_leg.clone(),
        exposure: escalation.exposure_quantity,
        reason: escalation.reason.clone(),
    }
}

/// Minimal fresh quote check shared by monitoring states.
pub(crate) async fn mid_of(tk: &Toolkit, leg: &Leg) -> Result<Decimal> {
    Ok(tk.market.quote(leg.venue.as_ref(), &leg.symbol).await?.mid())
}

/// Quantities this small count as flat.
pub(crate) fn is_dust(quantity: Decimal) -> bool {
    quantity.abs() < Decimal::new(1, 8)
}

/// Sleep for `wanted`, never past the instance deadline.
pub(crate) async fn pause<S: StrategyState>(ctx: &StrategyContext<S>, wanted: Duration) {
    let bounded = ctx.bounded(wanted);
    if !bounded.is_zero() {
        tokio::time::sleep(bounded).await;
    }
}

/// Market order flattening a signed open quantity. `None` when already flat.
///
/// Reduce-only, so it skips the pre-trade risk check.
pub(crate) async fn close_leg(
    orders: &OrderExecutor,
    leg: &Leg,
    open_quantity: Decimal,
    wait: Duration,
) -> Option<Result<Order>> {
    if is_dust(open_quantity) {
        return None;
    }
    let side = if open_quantity.is_sign_positive() {
        Side::Sell
    } else {
        Side::Buy
    };
    let intent = leg.market(side, open_quantity.abs());
    Some(orders.execute(leg.venue.as_ref(), &intent, wait).await)
}

/// First leg still carrying a position, if any.
pub(crate) fn residual_extension(tk: &Toolkit, legs: &[&Leg]) -> Option<MetricExtension> {
    legs.iter().find_map(|leg| {
        let quantity = tk.open_quantity(leg);
        (!is_dust(quantity)).then(|| MetricExtension::ResidualExposure {
            leg: leg.label(),
            quantity,
        })
    })
}

/// Flatten both legs concurrently, re-sending residuals up to `attempts`
/// times. Returns the signed quantities still open afterwards.
pub(crate) async fn close_pair(
    tk: &mut Toolkit,
    first: &Leg,
    second: &Leg,
    wait: Duration,
    attempts: u32,
) -> (Decimal, Decimal) {
    for _ in 0..attempts {
        let (first_open, second_open) = (tk.open_quantity(first), tk.open_quantity(second));
        if is_dust(first_open) && is_dust(second_open) {
            break;
        }

        let (first_res, second_res) = tokio::join!(
            close_leg(&tk.orders, first, first_open, wait),
            close_leg(&tk.orders, second, second_open, wait),
        );
        for (leg, result) in [(first, first_res), (second, second_res)] {
            match result {
                Some(Ok(mut order)) => tk.settle(leg, &mut order).await,
                Some(Err(e)) => tracing::warn!("⚠️ close of {} failed: {}", leg.label(), e),
                None => {}
            }
        }
    }

    (tk.open_quantity(first), tk.open_quantity(second))
}

/// Judge the result of [`close_pair`]: flat is fine, one stranded leg is an
/// escalation, two open legs is a plain execution failure.
pub(crate) fn closing_verdict(
    first: &Leg,
    second: &Leg,
    residual: (Decimal, Decimal),
    attempts: u32,
) -> std::result::Result<(), (Option<Escalation>, Error)> {
    match (is_dust(residual.0), is_dust(residual.1)) {
        (true, true) => Ok(()),
        (false, false) => Err((
            None,
            Error::OrderExecution {
                venue: first.venue_name().to_string(),
                symbol: first.symbol.to_string(),
                attempts,
                retryable: true,
                reason: format!("{} and {} still open after close", first.label(), second.label()),
            },
        )),
        (first_flat, _) => {
            let (open_leg, closed_leg, exposure) = if first_flat {
                (second, first, residual.1)
            } else {
                (first, second, residual.0)
            };
            let escalation = Escalation {
                filled_leg: open_leg.label(),
                failed_leg: closed_leg.label(),
                exposure_quantity: exposure,
                reason: format!("{} could not be closed", open_leg.label()),
                unwind: UnwindOutcome::NotAttempted,
            };
            let err = partial_execution_error(&escalation);
            Err((Some(escalation), err))
        }
    }
}
