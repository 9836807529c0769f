//! Futures/Futures Spread - calendar or cross-venue spread between two
//! futures: short the rich leg, long the cheap one, close on convergence.
//!
//! ```text
//! ScanningSpreads -> SpreadDetected -> ValidatingOpportunity -> OpeningLongLeg
//!        ^                                     |
//!        +------------- rejected --------------+
//! OpeningLongLeg -> OpeningShortLeg -> MonitoringSpread <-> AdjustingPositions
//! MonitoringSpread -> ClosingSpread -> Completed
//! ```

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::{bps_change, Error, Quote, Result, Severity, Side};
use crate::execution::{spread_bps, validate_orderbook_depth};
use crate::machine::{
    Escalation, ExitReason, SpreadDirection, SpreadMetrics, StrategyContext, StrategyMachine,
    StrategyMetrics, StrategyOutcome, StrategyState, UnwindPolicy,
};
use crate::registry::{StrategyDeps, StrategyLaunch};
use crate::strategies::{
    close_pair, closing_verdict, escalate_stranded, is_dust, mid_of, partial_execution_error, pause,
    residual_extension, resolve_broken_pair, Leg, Toolkit,
};

pub const STRATEGY_TYPE: &str = "futures_spread";

const CLOSE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuturesSpreadState {
    ScanningSpreads,
    SpreadDetected,
    ValidatingOpportunity,
    OpeningLongLeg,
    OpeningShortLeg,
    MonitoringSpread,
    AdjustingPositions,
    ClosingSpread,
    Completed,
    Error,
    Cancelled,
}

impl StrategyState for FuturesSpreadState {
    const INITIAL: Self = Self::ScanningSpreads;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const CANCELLED: Self = Self::Cancelled;

    fn name(self) -> &'static str {
        match self {
            Self::ScanningSpreads => "ScanningSpreads",
            Self::SpreadDetected => "SpreadDetected",
            Self::ValidatingOpportunity => "ValidatingOpportunity",
            Self::OpeningLongLeg => "OpeningLongLeg",
            Self::OpeningShortLeg => "OpeningShortLeg",
            Self::MonitoringSpread => "MonitoringSpread",
            Self::AdjustingPositions => "AdjustingPositions",
            Self::ClosingSpread => "ClosingSpread",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            // Completed only when a scan budget is configured and spent
            Self::ScanningSpreads => &[Self::SpreadDetected, Self::Completed],
            Self::SpreadDetected => &[Self::ValidatingOpportunity],
            Self::ValidatingOpportunity => &[Self::OpeningLongLeg, Self::ScanningSpreads],
            Self::OpeningLongLeg => &[Self::OpeningShortLeg],
            Self::OpeningShortLeg => &[Self::MonitoringSpread],
            Self::MonitoringSpread => &[Self::AdjustingPositions, Self::ClosingSpread],
            Self::AdjustingPositions => &[Self::MonitoringSpread],
            Self::ClosingSpread => &[Self::Completed],
            Self::Completed | Self::Error | Self::Cancelled => &[],
        }
    }

    fn all() -> &'static [Self] {
        &[
            Self::ScanningSpreads,
            Self::SpreadDetected,
            Self::ValidatingOpportunity,
            Self::OpeningLongLeg,
            Self::OpeningShortLeg,
            Self::MonitoringSpread,
            Self::AdjustingPositions,
            Self::ClosingSpread,
            Self::Completed,
            Self::Error,
            Self::Cancelled,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuturesSpreadConfig {
    pub near_venue: String,
    pub near_symbol: String,
    pub far_venue: String,
    pub far_symbol: String,
    /// Contracts per leg
    pub quantity: Decimal,
    #[serde(default = "default_min_spread_bps")]
    pub min_spread_bps: Decimal,
    /// Close when the spread widens this far beyond entry
    #[serde(default = "default_stop_loss_bps")]
    pub stop_loss_bps: Decimal,
    #[serde(default = "default_max_holding_ms")]
    pub max_holding_ms: u64,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: Decimal,
    /// Tolerated |long - short| / long before adjusting
    #[serde(default = "default_leg_mismatch_tolerance")]
    pub leg_mismatch_tolerance: Decimal,
    #[serde(default = "default_interval_ms")]
    pub scan_interval_ms: u64,
    /// Complete without trading once this many scans have run
    #[serde(default)]
    pub max_scans: Option<u32>,
    #[serde(default)]
    pub unwind_policy: UnwindPolicy,
}

fn default_min_spread_bps() -> Decimal {
    Decimal::from(20)
}
fn default_stop_loss_bps() -> Decimal {
    Decimal::from(50)
}
fn default_max_holding_ms() -> u64 {
    30_000
}
fn default_max_slippage_bps() -> Decimal {
    Decimal::from(10)
}
fn default_leg_mismatch_tolerance() -> Decimal {
    Decimal::new(1, 2)
}
fn default_interval_ms() -> u64 {
    100
}

impl FuturesSpreadConfig {
    pub fn new(near_venue: &str, near_symbol: &str, far_venue: &str, far_symbol: &str, quantity: Decimal) -> Self {
        Self {
            near_venue: near_venue.into(),
            near_symbol: near_symbol.into(),
            far_venue: far_venue.into(),
            far_symbol: far_symbol.into(),
            quantity,
            min_spread_bps: default_min_spread_bps(),
            stop_loss_bps: default_stop_loss_bps(),
            max_holding_ms: default_max_holding_ms(),
            max_slippage_bps: default_max_slippage_bps(),
            leg_mismatch_tolerance: default_leg_mismatch_tolerance(),
            scan_interval_ms: default_interval_ms(),
            max_scans: None,
            unwind_policy: UnwindPolicy::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(Error::Config("quantity must be positive".into()));
        }
        if self.min_spread_bps <= Decimal::ZERO {
            return Err(Error::Config("min_spread_bps must be positive".into()));
        }
        Ok(())
    }
}

/// Mid-to-mid spread between the two contracts.
pub fn quote_spread_bps(near: &Quote, far: &Quote) -> Decimal {
    spread_bps(near.mid(), far.mid())
}

/// Spread capturable by crossing both books in `direction`.
pub fn executable_spread_bps(near: &Quote, far: &Quote, direction: SpreadDirection) -> Decimal {
    match direction {
        // Buy near at ask, sell far at bid
        SpreadDirection::LongNearShortFar => bps_change(near.ask, far.bid),
        // Sell near at bid, buy far at ask
        SpreadDirection::ShortNearLongFar => bps_change(far.ask, near.bid),
    }
}

pub fn is_profitable(spread_bps: Decimal, min_spread_bps: Decimal) -> bool {
    spread_bps.abs() >= min_spread_bps
}

/// Spread move since entry, signed so that positive is against the position.
///
/// Long near / short far gains as the far premium shrinks, so a rise hurts.
/// Short near / long far is the mirror image.
pub fn adverse_move_bps(direction: SpreadDirection, entry_bps: Decimal, current_bps: Decimal) -> Decimal {
    match direction {
        SpreadDirection::LongNearShortFar => current_bps - entry_bps,
        SpreadDirection::ShortNearLongFar => entry_bps - current_bps,
    }
}

/// Exit decision for an open spread.
///
/// Converged once the spread is inside half the entry threshold or has
/// crossed through zero in the position's favour.
pub fn spread_exit(
    config: &FuturesSpreadConfig,
    direction: SpreadDirection,
    entry_bps: Decimal,
    current_bps: Decimal,
    held: Duration,
) -> Option<ExitReason> {
    let band = config.min_spread_bps / Decimal::TWO;
    let converged = match direction {
        SpreadDirection::LongNearShortFar => current_bps < band,
        SpreadDirection::ShortNearLongFar => current_bps > -band,
    };
    if converged {
        Some(ExitReason::Convergence)
    } else if adverse_move_bps(direction, entry_bps, current_bps) >= config.stop_loss_bps {
        Some(ExitReason::StopLoss)
    } else if held >= Duration::from_millis(config.max_holding_ms) {
        Some(ExitReason::MaxHoldingTime)
    } else {
        None
    }
}

pub struct FuturesSpreadStrategy {
    ctx: StrategyContext<FuturesSpreadState>,
    config: FuturesSpreadConfig,
    near: Leg,
    far: Leg,
    tk: Toolkit,
    candidate_bps: Decimal,
    direction: Option<SpreadDirection>,
    long_reference: Decimal,
    short_reference: Decimal,
    entered_at: Option<Instant>,
    metrics: SpreadMetrics,
    escalation: Option<Escalation>,
}

impl FuturesSpreadStrategy {
    pub fn new(launch: StrategyLaunch, deps: &StrategyDeps, config: FuturesSpreadConfig) -> Result<Self> {
        config.validate()?;
        let near = Leg::from_deps(deps, &config.near_venue, &config.near_symbol)?;
        let far = Leg::from_deps(deps, &config.far_venue, &config.far_symbol)?;

        let ctx = StrategyContext::new(STRATEGY_TYPE, launch.context_settings(deps.transition_sla));
        let tk = Toolkit::new(deps, ctx.deadline());

        Ok(Self {
            ctx,
            config,
            near,
            far,
            tk,
            candidate_bps: Decimal::ZERO,
            direction: None,
            long_reference: Decimal::ZERO,
            short_reference: Decimal::ZERO,
            entered_at: None,
            metrics: SpreadMetrics::default(),
            escalation: None,
        })
    }

    pub fn create(launch: StrategyLaunch, deps: &StrategyDeps) -> Result<Self> {
        let config = launch.params()?;
        Self::new(launch, deps, config)
    }

    pub fn metrics(&self) -> &SpreadMetrics {
        &self.metrics
    }

    /// (long leg, short leg) for the chosen direction.
    fn legs(&self) -> (&Leg, &Leg) {
        match self.direction {
            Some(SpreadDirection::ShortNearLongFar) => (&self.far, &self.near),
            _ => (&self.near, &self.far),
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.scan_interval_ms)
    }

    fn fill_wait(&self) -> Duration {
        self.ctx.bounded(self.tk.orders.fill_timeout())
    }

    fn refresh_quantities(&mut self) {
        let (long, short) = self.legs();
        let (long_qty, short_qty) = (self.tk.open_quantity(long), self.tk.open_quantity(short));
        self.metrics.long_quantity = long_qty;
        self.metrics.short_quantity = short_qty;
    }

    async fn quotes(&self) -> Result<(Quote, Quote)> {
        let (near, far) = tokio::join!(
            self.tk.market.quote(self.near.venue.as_ref(), &self.near.symbol),
            self.tk.market.quote(self.far.venue.as_ref(), &self.far.symbol),
        );
        Ok((near?, far?))
    }

    async fn scan(&mut self) -> Result<()> {
        if let Some(max) = self.config.max_scans {
            if self.metrics.scans >= max {
                info!(strategy_id = %self.ctx.strategy_id(), "no tradable spread in {} scans", max);
                return self
                    .ctx
                    .transition_to(FuturesSpreadState::Completed, "scan budget exhausted");
            }
        }
        self.metrics.scans += 1;
        let (near, far) = match self.quotes().await {
            Ok(q) => q,
            Err(e) => {
                self.ctx.tolerate(e)?;
                pause(&self.ctx, self.interval()).await;
                return Ok(());
            }
        };

        let spread = quote_spread_bps(&near, &far);
        if is_profitable(spread, self.config.min_spread_bps) {
            self.candidate_bps = spread;
            return self
                .ctx
                .transition_to(FuturesSpreadState::SpreadDetected, "spread above threshold");
        }

        debug!(strategy_id = %self.ctx.strategy_id(), "spread {:.2}bps below threshold", spread);
        pause(&self.ctx, self.interval()).await;
        Ok(())
    }

    fn detect(&mut self) -> Result<()> {
        // Far rich: short far, long near. Near rich: the reverse.
        let direction = if self.candidate_bps > Decimal::ZERO {
            SpreadDirection::LongNearShortFar
        } else {
            SpreadDirection::ShortNearLongFar
        };
        self.direction = Some(direction);
        self.metrics.direction = Some(direction);
        info!(
            strategy_id = %self.ctx.strategy_id(),
            "🔍 spread {:.2}bps, {:?}",
            self.candidate_bps,
            direction
        );
        self.ctx
            .transition_to(FuturesSpreadState::ValidatingOpportunity, "direction chosen")
    }

    async fn validate(&mut self) -> Result<()> {
        self.tk.risk.check_execution_time(self.ctx.execution_time())?;
        match self.check_opportunity().await {
            Ok(()) => self
                .ctx
                .transition_to(FuturesSpreadState::OpeningLongLeg, "opportunity validated"),
            Err(e) if e.severity() == Severity::Recoverable => {
                self.metrics.validation_failures += 1;
                debug!(strategy_id = %self.ctx.strategy_id(), "validation failed: {}", e);
                self.direction = None;
                self.ctx
                    .transition_to(FuturesSpreadState::ScanningSpreads, "validation failed")
            }
            Err(e) => Err(e),
        }
    }

    async fn check_opportunity(&mut self) -> Result<()> {
        let direction = self
            .direction
            .ok_or_else(|| Error::Strategy("no spread direction".into()))?;
        let (near, far) = self.quotes().await?;

        let executable = executable_spread_bps(&near, &far, direction);
        if executable < self.config.min_spread_bps {
            return Err(Error::MarketData(format!(
                "executable spread {:.2}bps below {}",
                executable, self.config.min_spread_bps
            )));
        }

        let qty = self.config.quantity;
        let (long, short) = self.legs();
        let (long_book, short_book) = tokio::join!(
            self.tk.market.orderbook(long.venue.as_ref(), &long.symbol),
            self.tk.market.orderbook(short.venue.as_ref(), &short.symbol),
        );
        let long_fill = validate_orderbook_depth(&long_book?, Side::Buy, qty, self.config.max_slippage_bps)?;
        let short_fill = validate_orderbook_depth(&short_book?, Side::Sell, qty, self.config.max_slippage_bps)?;

        self.tk.check_order(long, Side::Buy, qty, long_fill.vwap)?;
        self.tk.check_order(short, Side::Sell, qty, short_fill.vwap)?;

        self.long_reference = long_fill.vwap;
        self.short_reference = short_fill.vwap;
        self.metrics.entry_spread_bps = Some(quote_spread_bps(&near, &far).round_dp(4));
        Ok(())
    }

    async fn open_long(&mut self) -> Result<()> {
        let (long, _) = self.legs();
        let long = long.clone();
        let intent = long.market(Side::Buy, self.config.quantity);
        let wait = self.fill_wait();
        let order = self
            .ctx
            .recorder_mut()
            .time_async(
                "open_long",
                self.tk.execute_leg(&long, &intent, self.long_reference, wait),
            )
            .await?;

        if order.filled_quantity.is_zero() {
            return Err(Error::OrderExecution {
                venue: long.venue_name().to_string(),
                symbol: long.symbol.to_string(),
                attempts: 1,
                retryable: false,
                reason: format!("long leg order {} did not fill", order.id),
            });
        }
        self.refresh_quantities();
        self.ctx
            .transition_to(FuturesSpreadState::OpeningShortLeg, "long leg filled")
    }

    async fn open_short(&mut self) -> Result<()> {
        let (long, short) = self.legs();
        let (long, short) = (long.clone(), short.clone());
        let long_qty = self.tk.open_quantity(&long);

        let intent = short.market(Side::Sell, long_qty.abs());
        let wait = self.fill_wait();
        let placed = self
            .ctx
            .recorder_mut()
            .time_async(
                "open_short",
                self.tk.execute_leg(&short, &intent, self.short_reference, wait),
            )
            .await;

        let failure = match placed {
            Ok(order) if !order.filled_quantity.is_zero() => None,
            Ok(order) => Some(format!("short leg order {} did not fill", order.id)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            let escalation = resolve_broken_pair(
                &mut self.tk,
                &long,
                long_qty,
                &short,
                reason,
                self.config.unwind_policy,
                wait,
            )
            .await;
            let err = partial_execution_error(&escalation);
            self.escalation = Some(escalation);
            self.refresh_quantities();
            return Err(err);
        }

        self.refresh_quantities();
        self.entered_at = Some(Instant::now());
        self.ctx
            .transition_to(FuturesSpreadState::MonitoringSpread, "spread open")
    }

    fn leg_mismatch(&self) -> Decimal {
        let long = self.metrics.long_quantity.abs();
        if long.is_zero() {
            return Decimal::ZERO;
        }
        (long - self.metrics.short_quantity.abs()).abs() / long
    }

    async fn monitor(&mut self) -> Result<()> {
        let (near_mid, far_mid) = tokio::join!(mid_of(&self.tk, &self.near), mid_of(&self.tk, &self.far));
        let (near_mid, far_mid) = match (near_mid, far_mid) {
            (Ok(n), Ok(f)) => (n, f),
            (Err(e), _) | (_, Err(e)) => {
                self.ctx.tolerate(e)?;
                pause(&self.ctx, self.interval()).await;
                return Ok(());
            }
        };
        self.tk
            .risk
            .mark_to_market(self.near.venue_name(), &self.near.symbol, near_mid);
        self.tk
            .risk
            .mark_to_market(self.far.venue_name(), &self.far.symbol, far_mid);

        self.refresh_quantities();
        if self.leg_mismatch() > self.config.leg_mismatch_tolerance {
            return self
                .ctx
                .transition_to(FuturesSpreadState::AdjustingPositions, "leg size mismatch");
        }

        let current = spread_bps(near_mid, far_mid);
        self.metrics.exit_spread_bps = Some(current.round_dp(4));
        let entry = self.metrics.entry_spread_bps.unwrap_or(current);
        let held = self.entered_at.map(|t| t.elapsed()).unwrap_or_default();
        let direction = self
            .direction
            .ok_or_else(|| Error::Strategy("open spread without a direction".into()))?;
        if let Some(reason) = spread_exit(&self.config, direction, entry, current, held) {
            self.metrics.exit_reason = Some(reason);
            return self
                .ctx
                .transition_to(FuturesSpreadState::ClosingSpread, "exit condition");
        }

        pause(&self.ctx, self.interval()).await;
        Ok(())
    }

    async fn adjust(&mut self) -> Result<()> {
        let (long, short) = self.legs();
        let (long, short) = (long.clone(), short.clone());
        let gap = self.tk.open_quantity(&long).abs() - self.tk.open_quantity(&short).abs();

        if !is_dust(gap) {
            // Short leg too small: sell more. Too big: buy some back.
            let side = if gap > Decimal::ZERO { Side::Sell } else { Side::Buy };
            let reference = mid_of(&self.tk, &short).await?;
            let intent = short.market(side, gap.abs());
            let wait = self.fill_wait();
            self.ctx
                .recorder_mut()
                .time_async("adjust", self.tk.execute_leg(&short, &intent, reference, wait))
                .await?;
        }

        self.metrics.adjustments += 1;
        self.refresh_quantities();
        self.ctx
            .transition_to(FuturesSpreadState::MonitoringSpread, "legs adjusted")
    }

    async fn close(&mut self) -> Result<()> {
        let wait = self.fill_wait();
        let residual = self
            .ctx
            .recorder_mut()
            .time_async(
                "close_spread",
                close_pair(&mut self.tk, &self.near, &self.far, wait, CLOSE_ATTEMPTS),
            )
            .await;
        self.refresh_quantities();

        match closing_verdict(&self.near, &self.far, residual, CLOSE_ATTEMPTS) {
            Ok(()) => self
                .ctx
                .transition_to(FuturesSpreadState::Completed, "spread closed"),
            Err((escalation, err)) => {
                self.escalation = escalation;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl StrategyMachine for FuturesSpreadStrategy {
    type State = FuturesSpreadState;

    fn context(&self) -> &StrategyContext<Self::State> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut StrategyContext<Self::State> {
        &mut self.ctx
    }

    async fn handle(&mut self, state: Self::State) -> Result<()> {
        match state {
            FuturesSpreadState::ScanningSpreads => self.scan().await,
            FuturesSpreadState::SpreadDetected => self.detect(),
            FuturesSpreadState::ValidatingOpportunity => self.validate().await,
            FuturesSpreadState::OpeningLongLeg => self.open_long().await,
            FuturesSpreadState::OpeningShortLeg => self.open_short().await,
            FuturesSpreadState::MonitoringSpread => self.monitor().await,
            FuturesSpreadState::AdjustingPositions => self.adjust().await,
            FuturesSpreadState::ClosingSpread => self.close().await,
            FuturesSpreadState::Completed | FuturesSpreadState::Error | FuturesSpreadState::Cancelled => Ok(()),
        }
    }

    /// A deadline or cancel between the two opens strands the first leg.
    async fn on_terminal(&mut self) {
        if self.escalation.is_some() {
            return;
        }
        self.escalation = escalate_stranded(
            &mut self.tk,
            &mut self.ctx,
            &self.near,
            &self.far,
            self.config.unwind_policy,
        )
        .await;
        self.refresh_quantities();
    }

    fn outcome(&self) -> StrategyOutcome {
        StrategyOutcome {
            realized_pnl: self.tk.risk.realized_pnl(),
            unrealized_pnl: self.tk.risk.unrealized_pnl(),
            fees: self.tk.risk.fees(),
            orders_executed: self.tk.orders_executed(),
            metrics: StrategyMetrics::Spread(self.metrics.clone()),
            extension: residual_extension(&self.tk, &[&self.near, &self.far]),
            escalation: self.escalation.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::reachable_states;
    use rust_decimal_macros::dec;

    fn quote(bid: Decimal, ask: Decimal) -> Quote {
        Quote {
            bid,
            ask,
            bid_size: dec!(10),
            ask_size: dec!(10),
            timestamp: 0,
        }
    }

    #[test]
    fn test_profitability_uses_absolute_spread() {
        assert!(is_profitable(dec!(25), dec!(20)));
        assert!(is_profitable(dec!(-25), dec!(20)));
        assert!(!is_profitable(dec!(19.9), dec!(20)));
    }

    #[test]
    fn test_executable_spread_crosses_books() {
        let near = quote(dec!(99.9), dec!(100.1));
        let far = quote(dec!(100.5), dec!(100.7));
        assert_eq!(quote_spread_bps(&near, &far), dec!(60));

        let executable = executable_spread_bps(&near, &far, SpreadDirection::LongNearShortFar);
        assert!(executable > dec!(39) && executable < dec!(40));
        assert!(executable_spread_bps(&near, &far, SpreadDirection::ShortNearLongFar) < Decimal::ZERO);
    }

    #[test]
    fn test_exit_on_convergence_stop_and_holding() {
        let cfg = FuturesSpreadConfig::new("a", "BTC-0329", "a", "BTC-0628", dec!(1));
        let long_near = SpreadDirection::LongNearShortFar;
        assert_eq!(
            spread_exit(&cfg, long_near, dec!(40), dec!(9), Duration::ZERO),
            Some(ExitReason::Convergence)
        );
        assert_eq!(
            spread_exit(&cfg, long_near, dec!(40), dec!(95), Duration::ZERO),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(spread_exit(&cfg, long_near, dec!(40), dec!(30), Duration::ZERO), None);
        assert_eq!(
            spread_exit(&cfg, long_near, dec!(40), dec!(30), Duration::from_secs(60)),
            Some(ExitReason::MaxHoldingTime)
        );
    }

    #[test]
    fn test_sign_flip_in_favour_is_not_a_stop() {
        let cfg = FuturesSpreadConfig::new("a", "BTC-0329", "a", "BTC-0628", dec!(1));
        // Far premium of 50bps turned into a 120bps discount: a large gain
        assert_eq!(
            spread_exit(&cfg, SpreadDirection::LongNearShortFar, dec!(50), dec!(-120), Duration::ZERO),
            Some(ExitReason::Convergence)
        );
        assert_eq!(
            adverse_move_bps(SpreadDirection::LongNearShortFar, dec!(50), dec!(-120)),
            dec!(-170)
        );
    }

    #[test]
    fn test_short_near_stops_when_discount_widens() {
        let cfg = FuturesSpreadConfig::new("a", "BTC-0329", "a", "BTC-0628", dec!(1));
        let short_near = SpreadDirection::ShortNearLongFar;
        assert_eq!(
            spread_exit(&cfg, short_near, dec!(-40), dec!(-95), Duration::ZERO),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(spread_exit(&cfg, short_near, dec!(-40), dec!(-30), Duration::ZERO), None);
        assert_eq!(
            spread_exit(&cfg, short_near, dec!(-40), dec!(60), Duration::ZERO),
            Some(ExitReason::Convergence)
        );
        // Moving further into a discount it is already short is a loss,
        // moving towards zero is a gain
        assert!(adverse_move_bps(short_near, dec!(-40), dec!(-95)) > Decimal::ZERO);
        assert!(adverse_move_bps(short_near, dec!(-40), dec!(-30)) < Decimal::ZERO);
    }

    #[test]
    fn test_validation_can_return_to_scanning() {
        assert!(FuturesSpreadState::ValidatingOpportunity
            .can_transition_to(FuturesSpreadState::ScanningSpreads));
        assert!(!FuturesSpreadState::OpeningShortLeg
            .can_transition_to(FuturesSpreadState::ScanningSpreads));
        assert_eq!(
            reachable_states::<FuturesSpreadState>().len(),
            FuturesSpreadState::all().len()
        );
    }
}
