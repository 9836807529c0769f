//! Two-venue arbitrage: buy where the ask is low, sell where the bid is high.
//!
//! ```text
//! ScanningOpportunities -> OpportunityDetected -> ValidatingOpportunity -> ExecutingBuySide
//!          ^                                              |
//!          +------------------ rejected -----------------+
//! ExecutingBuySide -> ExecutingSellSide -> MonitoringExecution -> ProfitRealized -> Completed
//! ```
//!
//! Legs are sequenced: the sell goes out the moment the buy fills, with no
//! re-validation. A sell failure after the buy filled is escalated, never
//! unwound or retried here.

use async_trait::async_trait;
use futures::future::join;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::{bps_change, Error, Order, Quote, Result, Severity, Side, BPS};
use crate::execution::validate_orderbook_depth;
use crate::machine::{
    ArbitrageMetrics, Escalation, MetricExtension, StrategyContext, StrategyMachine,
    StrategyMetrics, StrategyOutcome, StrategyState, UnwindPolicy,
};
use crate::registry::{StrategyDeps, StrategyLaunch};
use crate::strategies::{
    escalate_stranded, is_dust, partial_execution_error, pause, resolve_broken_pair, Leg, Toolkit,
};

pub const STRATEGY_TYPE: &str = "simple_arbitrage";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimpleArbitrageState {
    ScanningOpportunities,
    OpportunityDetected,
    ValidatingOpportunity,
    ExecutingBuySide,
    ExecutingSellSide,
    MonitoringExecution,
    ProfitRealized,
    Completed,
    Error,
    Cancelled,
}

impl StrategyState for SimpleArbitrageState {
    const INITIAL: Self = Self::ScanningOpportunities;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const CANCELLED: Self = Self::Cancelled;

    fn name(self) -> &'static str {
        match self {
            Self::ScanningOpportunities => "ScanningOpportunities",
            Self::OpportunityDetected => "OpportunityDetected",
            Self::ValidatingOpportunity => "ValidatingOpportunity",
            Self::ExecutingBuySide => "ExecutingBuySide",
            Self::ExecutingSellSide => "ExecutingSellSide",
            Self::MonitoringExecution => "MonitoringExecution",
            Self::ProfitRealized => "ProfitRealized",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            Self::ScanningOpportunities => &[Self::OpportunityDetected, Self::Completed],
            Self::OpportunityDetected => &[Self::ValidatingOpportunity],
            Self::ValidatingOpportunity => &[Self::ExecutingBuySide, Self::ScanningOpportunities],
            Self::ExecutingBuySide => &[Self::ExecutingSellSide],
            Self::ExecutingSellSide => &[Self::MonitoringExecution],
            Self::MonitoringExecution => &[Self::ProfitRealized],
            Self::ProfitRealized => &[Self::Completed],
            Self::Completed | Self::Error | Self::Cancelled => &[],
        }
    }

    fn all() -> &'static [Self] {
        &[
            Self::ScanningOpportunities,
            Self::OpportunityDetected,
            Self::ValidatingOpportunity,
            Self::ExecutingBuySide,
            Self::ExecutingSellSide,
            Self::MonitoringExecution,
            Self::ProfitRealized,
            Self::Completed,
            Self::Error,
            Self::Cancelled,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleArbitrageConfig {
    pub venue_a: String,
    pub venue_b: String,
    pub symbol: String,
    /// Upper bound on trade size; top-of-book size may cap it further
    pub quantity: Decimal,
    #[serde(default = "default_min_profit_bps")]
    pub min_profit_bps: Decimal,
    /// Taker fee rates used to estimate profit (0.001 = 10bps)
    #[serde(default = "default_fee_rate")]
    pub fee_rate_a: Decimal,
    #[serde(default = "default_fee_rate")]
    pub fee_rate_b: Decimal,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: Decimal,
    #[serde(default = "default_interval_ms")]
    pub scan_interval_ms: u64,
    /// Complete without trading once this many scans have run
    #[serde(default)]
    pub max_scans: Option<u32>,
}

fn default_min_profit_bps() -> Decimal {
    Decimal::from(10)
}
fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3)
}
fn default_max_slippage_bps() -> Decimal {
    Decimal::from(10)
}
fn default_interval_ms() -> u64 {
    100
}

impl SimpleArbitrageConfig {
    pub fn new(venue_a: &str, venue_b: &str, symbol: &str, quantity: Decimal) -> Self {
        Self {
            venue_a: venue_a.into(),
            venue_b: venue_b.into(),
            symbol: symbol.into(),
            quantity,
            min_profit_bps: default_min_profit_bps(),
            fee_rate_a: default_fee_rate(),
            fee_rate_b: default_fee_rate(),
            max_slippage_bps: default_max_slippage_bps(),
            scan_interval_ms: default_interval_ms(),
            max_scans: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.venue_a == self.venue_b {
            return Err(Error::Config("arbitrage needs two distinct venues".into()));
        }
        if self.quantity <= Decimal::ZERO {
            return Err(Error::Config("quantity must be positive".into()));
        }
        Ok(())
    }
}

/// A priced, sized cross-venue opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opportunity {
    /// Buy on venue A (and sell on B) when true
    pub buy_on_a: bool,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub quantity: Decimal,
    pub expected_profit_bps: Decimal,
}

/// Profit of buying at `buy_price` and selling at `sell_price`, net of both
/// taker fees, in bps of the buy price.
pub fn expected_profit_bps(
    buy_price: Decimal,
    sell_price: Decimal,
    buy_fee_rate: Decimal,
    sell_fee_rate: Decimal,
) -> Decimal {
    bps_change(buy_price, sell_price) - (buy_fee_rate + sell_fee_rate) * BPS
}

/// `(sell - buy) * qty - fees`
pub fn net_profit(
    buy_price: Decimal,
    sell_price: Decimal,
    quantity: Decimal,
    buy_fee: Decimal,
    sell_fee: Decimal,
) -> Decimal {
    (sell_price - buy_price) * quantity - buy_fee - sell_fee
}

fn quote_is_valid(q: &Quote) -> bool {
    q.bid > Decimal::ZERO && q.ask > Decimal::ZERO && q.bid < q.ask
}

/// Best qualifying opportunity across both directions, if any.
pub fn find_opportunity(config: &SimpleArbitrageConfig, a: &Quote, b: &Quote) -> Option<Opportunity> {
    if !quote_is_valid(a) || !quote_is_valid(b) {
        return None;
    }

    let candidate = |buy_on_a: bool| {
        let (buy, sell, buy_fee, sell_fee) = if buy_on_a {
            (a, b, config.fee_rate_a, config.fee_rate_b)
        } else {
            (b, a, config.fee_rate_b, config.fee_rate_a)
        };
        let profit = expected_profit_bps(buy.ask, sell.bid, buy_fee, sell_fee);
        let quantity = config.quantity.min(buy.ask_size).min(sell.bid_size);
        Opportunity {
            buy_on_a,
            buy_price: buy.ask,
            sell_price: sell.bid,
            quantity,
            expected_profit_bps: profit,
        }
    };

    [candidate(true), candidate(false)]
        .into_iter()
        .filter(|o| o.expected_profit_bps >= config.min_profit_bps && !is_dust(o.quantity))
        .max_by(|x, y| x.expected_profit_bps.cmp(&y.expected_profit_bps))
}

pub struct SimpleArbitrageStrategy {
    ctx: StrategyContext<SimpleArbitrageState>,
    config: SimpleArbitrageConfig,
    leg_a: Leg,
    leg_b: Leg,
    tk: Toolkit,
    opportunity: Option<Opportunity>,
    buy_order: Option<Order>,
    sell_order: Option<Order>,
    metrics: ArbitrageMetrics,
    escalation: Option<Escalation>,
}

impl SimpleArbitrageStrategy {
    pub fn new(launch: StrategyLaunch, deps: &StrategyDeps, config: SimpleArbitrageConfig) -> Result<Self> {
        config.validate()?;
        let leg_a = Leg::from_deps(deps, &config.venue_a, &config.symbol)?;
        let leg_b = Leg::from_deps(deps, &config.venue_b, &config.symbol)?;

        let ctx = StrategyContext::new(STRATEGY_TYPE, launch.context_settings(deps.transition_sla));
        let tk = Toolkit::new(deps, ctx.deadline());

        Ok(Self {
            ctx,
            config,
            leg_a,
            leg_b,
            tk,
            opportunity: None,
            buy_order: None,
            sell_order: None,
            metrics: ArbitrageMetrics::default(),
            escalation: None,
        })
    }

    pub fn create(launch: StrategyLaunch, deps: &StrategyDeps) -> Result<Self> {
        let config = launch.params()?;
        Self::new(launch, deps, config)
    }

    pub fn metrics(&self) -> &ArbitrageMetrics {
        &self.metrics
    }

    pub fn opportunity(&self) -> Option<&Opportunity> {
        self.opportunity.as_ref()
    }

    /// (buy leg, sell leg) of the current opportunity.
    fn legs(&self) -> Result<(Leg, Leg)> {
        let opp = self
            .opportunity
            .ok_or_else(|| Error::Strategy("no opportunity selected".into()))?;
        Ok(if opp.buy_on_a {
            (self.leg_a.clone(), self.leg_b.clone())
        } else {
            (self.leg_b.clone(), self.leg_a.clone())
        })
    }

    fn fee_rates(&self, buy_on_a: bool) -> (Decimal, Decimal) {
        if buy_on_a {
            (self.config.fee_rate_a, self.config.fee_rate_b)
        } else {
            (self.config.fee_rate_b, self.config.fee_rate_a)
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.scan_interval_ms)
    }

    fn fill_wait(&self) -> Duration {
        self.ctx.bounded(self.tk.orders.fill_timeout())
    }

    async fn scan(&mut self) -> Result<()> {
        if let Some(max) = self.config.max_scans {
            if self.metrics.opportunities_scanned >= max {
                info!(strategy_id = %self.ctx.strategy_id(), "no executable opportunity in {} scans", max);
                return self
                    .ctx
                    .transition_to(SimpleArbitrageState::Completed, "scan budget exhausted");
            }
        }
        self.metrics.opportunities_scanned += 1;
        let (a, b) = tokio::join!(
            self.tk.market.quote(self.leg_a.venue.as_ref(), &self.leg_a.symbol),
            self.tk.market.quote(self.leg_b.venue.as_ref(), &self.leg_b.symbol),
        );
        let found = match (a, b) {
            (Ok(a), Ok(b)) => find_opportunity(&self.config, &a, &b),
            (Err(e), _) | (_, Err(e)) => {
                self.ctx.tolerate(e)?;
                None
            }
        };

        if let Some(opp) = found {
            self.opportunity = Some(opp);
            self.metrics.opportunities_detected += 1;
            return self
                .ctx
                .transition_to(SimpleArbitrageState::OpportunityDetected, "profitable spread");
        }

        pause(&self.ctx, self.interval()).await;
        Ok(())
    }

    fn detected(&mut self) -> Result<()> {
        let (buy, sell) = self.legs()?;
        let opp = self
            .opportunity
            .ok_or_else(|| Error::Strategy("no opportunity selected".into()))?;
        self.metrics.buy_venue = Some(buy.venue_name().to_string());
        self.metrics.sell_venue = Some(sell.venue_name().to_string());
        self.metrics.expected_profit_bps = Some(opp.expected_profit_bps.round_dp(4));
        info!(
            strategy_id = %self.ctx.strategy_id(),
            "🚨 ARB {} buy {}@{} sell {}@{} size {} ({:.2}bps net)",
            buy.symbol,
            buy.venue_name(),
            opp.buy_price,
            sell.venue_name(),
            opp.sell_price,
            opp.quantity,
            opp.expected_profit_bps
        );
        self.ctx
            .transition_to(SimpleArbitrageState::ValidatingOpportunity, "opportunity recorded")
    }

    async fn validate(&mut self) -> Result<()> {
        self.tk.risk.check_execution_time(self.ctx.execution_time())?;
        match self.revalidate().await {
            Ok(()) => self
                .ctx
                .transition_to(SimpleArbitrageState::ExecutingBuySide, "opportunity validated"),
            Err(e) if e.severity() == Severity::Recoverable => {
                self.metrics.validation_failures += 1;
                debug!(strategy_id = %self.ctx.strategy_id(), "validation failed: {}", e);
                self.opportunity = None;
                self.ctx
                    .transition_to(SimpleArbitrageState::ScanningOpportunities, "validation failed")
            }
            Err(e) => Err(e),
        }
    }

    /// Re-price both legs against book depth and re-run the profit test.
    async fn revalidate(&mut self) -> Result<()> {
        let mut opp = self
            .opportunity
            .ok_or_else(|| Error::Strategy("no opportunity selected".into()))?;
        let (buy, sell) = self.legs()?;

        let (buy_book, sell_book) = join(
            self.tk.market.orderbook(buy.venue.as_ref(), &buy.symbol),
            self.tk.market.orderbook(sell.venue.as_ref(), &sell.symbol),
        )
        .await;
        let buy_fill = validate_orderbook_depth(&buy_book?, Side::Buy, opp.quantity, self.config.max_slippage_bps)?;
        let sell_fill =
            validate_orderbook_depth(&sell_book?, Side::Sell, opp.quantity, self.config.max_slippage_bps)?;

        let (buy_fee, sell_fee) = self.fee_rates(opp.buy_on_a);
        let profit = expected_profit_bps(buy_fill.vwap, sell_fill.vwap, buy_fee, sell_fee);
        if profit < self.config.min_profit_bps {
            return Err(Error::MarketData(format!(
                "profit {:.2}bps at depth below {}",
                profit, self.config.min_profit_bps
            )));
        }

        self.tk.check_order(&buy, Side::Buy, opp.quantity, buy_fill.vwap)?;
        self.tk.check_order(&sell, Side::Sell, opp.quantity, sell_fill.vwap)?;

        opp.buy_price = buy_fill.vwap;
        opp.sell_price = sell_fill.vwap;
        opp.expected_profit_bps = profit;
        self.opportunity = Some(opp);
        self.metrics.expected_profit_bps = Some(profit.round_dp(4));
        Ok(())
    }

    async fn execute_buy(&mut self) -> Result<()> {
        let (buy, _) = self.legs()?;
        let opp = self
            .opportunity
            .ok_or_else(|| Error::Strategy("no opportunity selected".into()))?;
        let intent = buy.market(Side::Buy, opp.quantity);
        let wait = self.fill_wait();
        let order = self
            .ctx
            .recorder_mut()
            .time_async("buy_leg", self.tk.execute_leg(&buy, &intent, opp.buy_price, wait))
            .await?;

        if order.filled_quantity.is_zero() {
            // Nothing filled, nothing exposed
            return Err(Error::OrderExecution {
                venue: buy.venue_name().to_string(),
                symbol: buy.symbol.to_string(),
                attempts: 1,
                retryable: false,
                reason: format!("buy order {} did not fill", order.id),
            });
        }
        self.metrics.buy_price = order.average_price;
        self.buy_order = Some(order);
        self.ctx
            .transition_to(SimpleArbitrageState::ExecutingSellSide, "buy leg filled")
    }

    async fn execute_sell(&mut self) -> Result<()> {
        let (buy, sell) = self.legs()?;
        let bought = self
            .buy_order
            .as_ref()
            .map(|o| o.filled_quantity)
            .unwrap_or(Decimal::ZERO);
        let reference = self.opportunity.map(|o| o.sell_price).unwrap_or(Decimal::ZERO);

        let intent = sell.market(Side::Sell, bought);
        let wait = self.fill_wait();
        let placed = self
            .ctx
            .recorder_mut()
            .time_async("sell_leg", self.tk.execute_leg(&sell, &intent, reference, wait))
            .await;

        let (sold, failure) = match placed {
            Ok(order) => {
                let sold = order.filled_quantity;
                self.metrics.sell_price = order.average_price;
                self.sell_order = Some(order);
                let short = bought - sold;
                let failure = (!is_dust(short)).then(|| format!("sell leg filled {sold} of {bought}"));
                (sold, failure)
            }
            Err(e) => (Decimal::ZERO, Some(e.to_string())),
        };

        if let Some(reason) = failure {
            let exposure = self.tk.open_quantity(&buy);
            warn!(
                strategy_id = %self.ctx.strategy_id(),
                "⚠️ sell leg short by {} after buy of {}",
                bought - sold,
                bought
            );
            let escalation = resolve_broken_pair(
                &mut self.tk,
                &buy,
                exposure,
                &sell,
                reason,
                UnwindPolicy::Escalate,
                wait,
            )
            .await;
            let err = partial_execution_error(&escalation);
            self.escalation = Some(escalation);
            return Err(err);
        }

        self.ctx
            .transition_to(SimpleArbitrageState::MonitoringExecution, "sell leg filled")
    }

    /// Re-read both orders from their venues and book any late fill reports.
    async fn monitor(&mut self) -> Result<()> {
        let (buy, sell) = self.legs()?;
        let (Some(buy_order), Some(sell_order)) = (self.buy_order.clone(), self.sell_order.clone()) else {
            return Err(Error::Strategy("execution monitor without both orders".into()));
        };

        let (buy_latest, sell_latest) = tokio::join!(
            buy.venue.get_order_status(&buy_order.symbol, &buy_order.id),
            sell.venue.get_order_status(&sell_order.symbol, &sell_order.id),
        );
        for (latest, slot) in [(buy_latest, &mut self.buy_order), (sell_latest, &mut self.sell_order)] {
            match (latest, slot.as_mut()) {
                (Ok(update), Some(order)) => order.update_from(&update),
                (Err(e), _) => debug!("status re-read failed: {}", e),
                _ => {}
            }
        }
        if let Some(order) = &self.buy_order {
            self.tk.book(order);
        }
        if let Some(order) = &self.sell_order {
            self.tk.book(order);
        }

        let matched = match (&self.buy_order, &self.sell_order) {
            (Some(b), Some(s)) => b.filled_quantity.min(s.filled_quantity),
            _ => Decimal::ZERO,
        };
        self.metrics.matched_quantity = matched;
        self.ctx
            .transition_to(SimpleArbitrageState::ProfitRealized, "both legs confirmed")
    }

    fn realize(&mut self) -> Result<()> {
        let (Some(buy), Some(sell)) = (&self.buy_order, &self.sell_order) else {
            return Err(Error::Strategy("profit realization without both orders".into()));
        };
        let profit = net_profit(
            buy.average_price.unwrap_or(Decimal::ZERO),
            sell.average_price.unwrap_or(Decimal::ZERO),
            self.metrics.matched_quantity,
            buy.fee,
            sell.fee,
        );
        self.metrics.net_profit = Some(profit);
        info!(
            strategy_id = %self.ctx.strategy_id(),
            "💰 arbitrage realized {} on {} matched",
            profit,
            self.metrics.matched_quantity
        );
        self.ctx
            .transition_to(SimpleArbitrageState::Completed, "profit booked")
    }

    /// Bought but unsold quantity, reported on the leg carrying more of it.
    fn unmatched_extension(&self) -> Option<MetricExtension> {
        let (a, b) = (self.tk.open_quantity(&self.leg_a), self.tk.open_quantity(&self.leg_b));
        let net = a + b;
        if is_dust(net) {
            return None;
        }
        let leg = if a.abs() >= b.abs() { &self.leg_a } else { &self.leg_b };
        Some(MetricExtension::ResidualExposure {
            leg: leg.label(),
            quantity: net,
        })
    }

    /// Gross round-trip PnL on the matched quantity.
    fn gross_pnl(&self) -> Decimal {
        match (&self.buy_order, &self.sell_order) {
            (Some(b), Some(s)) => {
                let (Some(buy_px), Some(sell_px)) = (b.average_price, s.average_price) else {
                    return Decimal::ZERO;
                };
                (sell_px - buy_px) * self.metrics.matched_quantity
            }
            _ => Decimal::ZERO,
        }
    }
}

#[async_trait]
impl StrategyMachine for SimpleArbitrageStrategy {
    type State = SimpleArbitrageState;

    fn context(&self) -> &StrategyContext<Self::State> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut StrategyContext<Self::State> {
        &mut self.ctx
    }

    async fn handle(&mut self, state: Self::State) -> Result<()> {
        match state {
            SimpleArbitrageState::ScanningOpportunities => self.scan().await,
            SimpleArbitrageState::OpportunityDetected => self.detected(),
            SimpleArbitrageState::ValidatingOpportunity => self.validate().await,
            SimpleArbitrageState::ExecutingBuySide => self.execute_buy().await,
            SimpleArbitrageState::ExecutingSellSide => self.execute_sell().await,
            SimpleArbitrageState::MonitoringExecution => self.monitor().await,
            SimpleArbitrageState::ProfitRealized => self.realize(),
            SimpleArbitrageState::Completed
            | SimpleArbitrageState::Error
            | SimpleArbitrageState::Cancelled => Ok(()),
        }
    }

    /// A deadline or cancel between the two legs leaves the buy open.
    async fn on_terminal(&mut self) {
        if self.escalation.is_some() {
            return;
        }
        self.escalation = escalate_stranded(
            &mut self.tk,
            &mut self.ctx,
            &self.leg_a,
            &self.leg_b,
            UnwindPolicy::Escalate,
        )
        .await;
    }

    fn outcome(&self) -> StrategyOutcome {
        // The two legs sit on different venues, so inventory never nets them
        StrategyOutcome {
            realized_pnl: self.gross_pnl(),
            unrealized_pnl: Decimal::ZERO,
            fees: self.tk.risk.fees(),
            orders_executed: self.tk.orders_executed(),
            metrics: StrategyMetrics::Arbitrage(self.metrics.clone()),
            extension: self.unmatched_extension(),
            escalation: self.escalation.clone(),
        }
    }
}
