//! Spot/Futures Hedge - long spot, short futures, held delta-neutral
//!
//! ```text
//! AnalyzingMarket -> OpeningSpot -> OpeningFuturesHedge -> MonitoringPositions
//!                                                          |  ^
//!                                                          v  |
//!                                                       Rebalancing
//! MonitoringPositions -> ClosingPositions -> Completed
//! ```

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::core::{bps_change, Error, Result, Side, BPS};
use crate::execution::validate_orderbook_depth;
use crate::machine::{
    Escalation, ExitReason, HedgeMetrics, StrategyContext, StrategyMachine, StrategyMetrics,
    StrategyOutcome, StrategyState, UnwindPolicy,
};
use crate::registry::{StrategyDeps, StrategyLaunch};
use crate::risk::{RiskError, RiskGuard};
use crate::strategies::{
    close_pair, closing_verdict, escalate_stranded, is_dust, mid_of, partial_execution_error, pause,
    residual_extension, resolve_broken_pair, Leg, Toolkit,
};

pub const STRATEGY_TYPE: &str = "spot_futures_hedge";

const CLOSE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpotFuturesHedgeState {
    AnalyzingMarket,
    OpeningSpot,
    OpeningFuturesHedge,
    MonitoringPositions,
    Rebalancing,
    ClosingPositions,
    Completed,
    Error,
    Cancelled,
}

impl StrategyState for SpotFuturesHedgeState {
    const INITIAL: Self = Self::AnalyzingMarket;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const CANCELLED: Self = Self::Cancelled;

    fn name(self) -> &'static str {
        match self {
            Self::AnalyzingMarket => "AnalyzingMarket",
            Self::OpeningSpot => "OpeningSpot",
            Self::OpeningFuturesHedge => "OpeningFuturesHedge",
            Self::MonitoringPositions => "MonitoringPositions",
            Self::Rebalancing => "Rebalancing",
            Self::ClosingPositions => "ClosingPositions",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            Self::AnalyzingMarket => &[Self::OpeningSpot],
            Self::OpeningSpot => &[Self::OpeningFuturesHedge],
            Self::OpeningFuturesHedge => &[Self::MonitoringPositions],
            Self::MonitoringPositions => &[Self::Rebalancing, Self::ClosingPositions],
            Self::Rebalancing => &[Self::MonitoringPositions],
            Self::ClosingPositions => &[Self::Completed],
            Self::Completed | Self::Error | Self::Cancelled => &[],
        }
    }

    fn all() -> &'static [Self] {
        &[
            Self::AnalyzingMarket,
            Self::OpeningSpot,
            Self::OpeningFuturesHedge,
            Self::MonitoringPositions,
            Self::Rebalancing,
            Self::ClosingPositions,
            Self::Completed,
            Self::Error,
            Self::Cancelled,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotFuturesHedgeConfig {
    pub spot_venue: String,
    pub spot_symbol: String,
    pub futures_venue: String,
    pub futures_symbol: String,
    /// Spot notional to hedge, in quote currency
    pub target_notional: Decimal,
    #[serde(default = "default_target_hedge_ratio")]
    pub target_hedge_ratio: Decimal,
    /// Overrides `risk.max_hedge_drift` when set
    #[serde(default)]
    pub max_hedge_drift: Option<Decimal>,
    /// Entry window for (futures - spot) / spot
    #[serde(default = "default_min_entry_basis_bps")]
    pub min_entry_basis_bps: Decimal,
    #[serde(default = "default_max_entry_basis_bps")]
    pub max_entry_basis_bps: Decimal,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: Decimal,
    #[serde(default = "default_profit_target_bps")]
    pub profit_target_bps: Decimal,
    #[serde(default = "default_stop_loss_bps")]
    pub stop_loss_bps: Decimal,
    #[serde(default = "default_max_holding_ms")]
    pub max_holding_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_max_rebalance_attempts")]
    pub max_rebalance_attempts: u32,
    #[serde(default)]
    pub unwind_policy: UnwindPolicy,
}

fn default_target_hedge_ratio() -> Decimal {
    Decimal::ONE
}
fn default_min_entry_basis_bps() -> Decimal {
    Decimal::from(-100)
}
fn default_max_entry_basis_bps() -> Decimal {
    Decimal::from(100)
}
fn default_max_slippage_bps() -> Decimal {
    Decimal::from(10)
}
fn default_profit_target_bps() -> Decimal {
    Decimal::from(20)
}
fn default_stop_loss_bps() -> Decimal {
    Decimal::from(50)
}
fn default_max_holding_ms() -> u64 {
    30_000
}
fn default_interval_ms() -> u64 {
    100
}
fn default_max_rebalance_attempts() -> u32 {
    3
}

impl SpotFuturesHedgeConfig {
    pub fn new(
        spot_venue: &str,
        spot_symbol: &str,
        futures_venue: &str,
        futures_symbol: &str,
        target_notional: Decimal,
    ) -> Self {
        Self {
            spot_venue: spot_venue.into(),
            spot_symbol: spot_symbol.into(),
            futures_venue: futures_venue.into(),
            futures_symbol: futures_symbol.into(),
            target_notional,
            target_hedge_ratio: default_target_hedge_ratio(),
            max_hedge_drift: None,
            min_entry_basis_bps: default_min_entry_basis_bps(),
            max_entry_basis_bps: default_max_entry_basis_bps(),
            max_slippage_bps: default_max_slippage_bps(),
            profit_target_bps: default_profit_target_bps(),
            stop_loss_bps: default_stop_loss_bps(),
            max_holding_ms: default_max_holding_ms(),
            monitor_interval_ms: default_interval_ms(),
            max_rebalance_attempts: default_max_rebalance_attempts(),
            unwind_policy: UnwindPolicy::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.target_notional <= Decimal::ZERO {
            return Err(Error::Config("target_notional must be positive".into()));
        }
        if self.target_hedge_ratio <= Decimal::ZERO {
            return Err(Error::Config("target_hedge_ratio must be positive".into()));
        }
        if self.min_entry_basis_bps > self.max_entry_basis_bps {
            return Err(Error::Config("min_entry_basis_bps above max_entry_basis_bps".into()));
        }
        Ok(())
    }
}

/// Exit decision for an open hedge; PnL thresholds are bps of target notional.
pub fn should_exit(
    config: &SpotFuturesHedgeConfig,
    pnl: Decimal,
    held: Duration,
) -> Option<ExitReason> {
    let pnl_bps = pnl / config.target_notional * BPS;
    if pnl_bps >= config.profit_target_bps {
        Some(ExitReason::ProfitTarget)
    } else if pnl_bps <= -config.stop_loss_bps {
        Some(ExitReason::StopLoss)
    } else if held >= Duration::from_millis(config.max_holding_ms) {
        Some(ExitReason::MaxHoldingTime)
    } else {
        None
    }
}

pub struct SpotFuturesHedgeStrategy {
    ctx: StrategyContext<SpotFuturesHedgeState>,
    config: SpotFuturesHedgeConfig,
    spot: Leg,
    futures: Leg,
    tk: Toolkit,
    planned_quantity: Decimal,
    spot_reference: Decimal,
    entered_at: Option<Instant>,
    rebalance_attempts: u32,
    metrics: HedgeMetrics,
    escalation: Option<Escalation>,
}

impl SpotFuturesHedgeStrategy {
    pub fn new(
        launch: StrategyLaunch,
        deps: &StrategyDeps,
        config: SpotFuturesHedgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let spot = Leg::from_deps(deps, &config.spot_venue, &config.spot_symbol)?;
        let futures = Leg::from_deps(deps, &config.futures_venue, &config.futures_symbol)?;

        let mut limits = deps.risk.clone();
        if let Some(drift) = config.max_hedge_drift {
            limits.max_hedge_drift = drift;
        }
        let ctx = StrategyContext::new(STRATEGY_TYPE, launch.context_settings(deps.transition_sla));
        let mut tk = Toolkit::new(deps, ctx.deadline());
        tk.risk = RiskGuard::new(limits);

        Ok(Self {
            ctx,
            metrics: HedgeMetrics {
                target_hedge_ratio: config.target_hedge_ratio,
                ..HedgeMetrics::default()
            },
            config,
            spot,
            futures,
            tk,
            planned_quantity: Decimal::ZERO,
            spot_reference: Decimal::ZERO,
            entered_at: None,
            rebalance_attempts: 0,
            escalation: None,
        })
    }

    /// Registry constructor: config comes from the launch params.
    pub fn create(launch: StrategyLaunch, deps: &StrategyDeps) -> Result<Self> {
        let config = launch.params()?;
        Self::new(launch, deps, config)
    }

    pub fn metrics(&self) -> &HedgeMetrics {
        &self.metrics
    }

    pub fn spot_quantity(&self) -> Decimal {
        self.tk.open_quantity(&self.spot)
    }

    pub fn futures_quantity(&self) -> Decimal {
        self.tk.open_quantity(&self.futures)
    }

    pub fn hedge_ratio(&self) -> Decimal {
        RiskGuard::hedge_ratio(self.spot_quantity(), self.futures_quantity())
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.monitor_interval_ms)
    }

    fn fill_wait(&self) -> Duration {
        self.ctx.bounded(self.tk.orders.fill_timeout())
    }

    fn refresh_quantities(&mut self) {
        self.metrics.spot_quantity = self.spot_quantity();
        self.metrics.futures_quantity = self.futures_quantity();
    }

    async fn analyze_market(&mut self) -> Result<()> {
        self.tk.risk.check_execution_time(self.ctx.execution_time())?;

        let (spot_quote, futures_quote) = tokio::join!(
            self.tk.market.quote(self.spot.venue.as_ref(), &self.spot.symbol),
            self.tk.market.quote(self.futures.venue.as_ref(), &self.futures.symbol),
        );
        let (spot_quote, futures_quote) = match (spot_quote, futures_quote) {
            (Ok(s), Ok(f)) => (s, f),
            (Err(e), _) | (_, Err(e)) => {
                self.ctx.tolerate(e)?;
                pause(&self.ctx, self.interval()).await;
                return Ok(());
            }
        };

        let basis_bps = bps_change(spot_quote.mid(), futures_quote.mid());
        if basis_bps < self.config.min_entry_basis_bps || basis_bps > self.config.max_entry_basis_bps {
            debug!(strategy_id = %self.ctx.strategy_id(), "basis {:.2}bps outside entry window", basis_bps);
            pause(&self.ctx, self.interval()).await;
            return Ok(());
        }

        let quantity = (self.config.target_notional / spot_quote.ask).round_dp(8);
        let book = match self.tk.market.orderbook(self.spot.venue.as_ref(), &self.spot.symbol).await {
            Ok(book) => book,
            Err(e) => {
                self.ctx.tolerate(e)?;
                pause(&self.ctx, self.interval()).await;
                return Ok(());
            }
        };
        if let Err(e) = validate_orderbook_depth(&book, Side::Buy, quantity, self.config.max_slippage_bps) {
            self.ctx.tolerate(e)?;
            pause(&self.ctx, self.interval()).await;
            return Ok(());
        }
        self.tk.check_order(&self.spot, Side::Buy, quantity, spot_quote.ask)?;

        self.planned_quantity = quantity;
        self.spot_reference = spot_quote.ask;
        self.metrics.entry_basis_bps = Some(basis_bps.round_dp(4));
        info!(
            strategy_id = %self.ctx.strategy_id(),
            "📊 hedge entry: basis {:.2}bps, {} {}",
            basis_bps,
            quantity,
            self.spot.symbol
        );
        self.ctx
            .transition_to(SpotFuturesHedgeState::OpeningSpot, "basis inside entry window")
    }

    async fn open_spot(&mut self) -> Result<()> {
        let intent = self.spot.market(Side::Buy, self.planned_quantity);
        let wait = self.fill_wait();
        let order = self
            .ctx
            .recorder_mut()
            .time_async(
                "open_spot",
                self.tk.execute_leg(&self.spot, &intent, self.spot_reference, wait),
            )
            .await?;

        if order.filled_quantity.is_zero() {
            return Err(Error::OrderExecution {
                venue: self.spot.venue_name().to_string(),
                symbol: self.spot.symbol.to_string(),
                attempts: 1,
                retryable: false,
                reason: format!("spot order {} did not fill", order.id),
            });
        }
        self.refresh_quantities();
        self.ctx
            .transition_to(SpotFuturesHedgeState::OpeningFuturesHedge, "spot leg filled")
    }

    async fn open_hedge(&mut self) -> Result<()> {
        let spot_qty = self.spot_quantity();
        let hedge_qty = (spot_qty.abs() * self.config.target_hedge_ratio).round_dp(8);
        let reference = match mid_of(&self.tk, &self.futures).await {
            Ok(mid) => mid,
            Err(_) => self.spot_reference,
        };

        let intent = self.futures.market(Side::Sell, hedge_qty);
        let wait = self.fill_wait();
        let placed = self
            .ctx
            .recorder_mut()
            .time_async(
                "open_hedge",
                self.tk.execute_leg(&self.futures, &intent, reference, wait),
            )
            .await;

        let failure = match placed {
            Ok(order) if !order.filled_quantity.is_zero() => None,
            Ok(order) => Some(format!("hedge order {} did not fill", order.id)),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            return Err(self.escalate(reason).await);
        }

        self.refresh_quantities();
        self.entered_at = Some(Instant::now());
        info!(
            strategy_id = %self.ctx.strategy_id(),
            "🛡️ hedge open: spot {} / futures {} (ratio {})",
            self.metrics.spot_quantity,
            self.metrics.futures_quantity,
            self.hedge_ratio().round_dp(4)
        );
        self.ctx
            .transition_to(SpotFuturesHedgeState::MonitoringPositions, "hedge leg filled")
    }

    async fn escalate(&mut self, reason: String) -> Error {
        let exposure = self.spot_quantity();
        let wait = self.fill_wait();
        let escalation = resolve_broken_pair(
            &mut self.tk,
            &self.spot,
            exposure,
            &self.futures,
            reason,
            self.config.unwind_policy,
            wait,
        )
        .await;
        let err = partial_execution_error(&escalation);
        self.escalation = Some(escalation);
        self.refresh_quantities();
        err
    }

    async fn monitor(&mut self) -> Result<()> {
        let (spot_mid, futures_mid) =
            tokio::join!(mid_of(&self.tk, &self.spot), mid_of(&self.tk, &self.futures));
        match (spot_mid, futures_mid) {
            (Ok(spot_mid), Ok(futures_mid)) => {
                self.tk
                    .risk
                    .mark_to_market(self.spot.venue_name(), &self.spot.symbol, spot_mid);
                self.tk
                    .risk
                    .mark_to_market(self.futures.venue_name(), &self.futures.symbol, futures_mid);
                self.metrics.exit_basis_bps = Some(bps_change(spot_mid, futures_mid).round_dp(4));
            }
            (Err(e), _) | (_, Err(e)) => {
                self.ctx.tolerate(e)?;
                pause(&self.ctx, self.interval()).await;
                return Ok(());
            }
        }

        let ratio = self.hedge_ratio();
        let drift = RiskGuard::hedge_ratio_drift(ratio, self.config.target_hedge_ratio);
        self.metrics.max_drift = self.metrics.max_drift.max(drift);

        if self.tk.risk.needs_rebalance(ratio, self.config.target_hedge_ratio) {
            info!(
                strategy_id = %self.ctx.strategy_id(),
                "⚖️ hedge ratio {} drifted {} from target",
                ratio.round_dp(4),
                drift.round_dp(4)
            );
            self.rebalance_attempts = 0;
            return self
                .ctx
                .transition_to(SpotFuturesHedgeState::Rebalancing, "hedge ratio drift");
        }

        let held = self.entered_at.map(|t| t.elapsed()).unwrap_or_default();
        if let Some(reason) = should_exit(&self.config, self.tk.risk.daily_pnl(), held) {
            self.metrics.exit_reason = Some(reason);
            return self
                .ctx
                .transition_to(SpotFuturesHedgeState::ClosingPositions, "exit condition");
        }

        pause(&self.ctx, self.interval()).await;
        Ok(())
    }

    async fn rebalance(&mut self) -> Result<()> {
        let target = (self.spot_quantity().abs() * self.config.target_hedge_ratio).round_dp(8);
        let current = self.futures_quantity().abs();
        let gap = target - current;

        if !is_dust(gap) {
            // Short more futures when under-hedged, buy some back when over
            let side = if gap > Decimal::ZERO { Side::Sell } else { Side::Buy };
            let reference = mid_of(&self.tk, &self.futures).await?;
            let intent = self.futures.market(side, gap.abs());
            let wait = self.fill_wait();
            self.ctx
                .recorder_mut()
                .time_async(
                    "rebalance",
                    self.tk.execute_leg(&self.futures, &intent, reference, wait),
                )
                .await?;
        }

        self.rebalance_attempts += 1;
        self.refresh_quantities();
        let drift = RiskGuard::hedge_ratio_drift(self.hedge_ratio(), self.config.target_hedge_ratio);
        self.metrics.rebalances += 1;
        self.metrics.post_rebalance_drift = Some(drift);

        if !self.tk.risk.needs_rebalance(self.hedge_ratio(), self.config.target_hedge_ratio) {
            return self
                .ctx
                .transition_to(SpotFuturesHedgeState::MonitoringPositions, "hedge ratio restored");
        }
        if self.rebalance_attempts >= self.config.max_rebalance_attempts {
            return Err(RiskError::HedgeDrift {
                drift,
                tolerance: self.tk.risk.limits().max_hedge_drift,
            }
            .into());
        }
        Ok(())
    }

    async fn close_positions(&mut self) -> Result<()> {
        let wait = self.fill_wait();
        let residual = self
            .ctx
            .recorder_mut()
            .time_async(
                "close_hedge",
                close_pair(&mut self.tk, &self.spot, &self.futures, wait, CLOSE_ATTEMPTS),
            )
            .await;
        self.refresh_quantities();

        match closing_verdict(&self.spot, &self.futures, residual, CLOSE_ATTEMPTS) {
            Ok(()) => self
                .ctx
                .transition_to(SpotFuturesHedgeState::Completed, "positions closed"),
            Err((escalation, err)) => {
                self.escalation = escalation;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl StrategyMachine for SpotFuturesHedgeStrategy {
    type State = SpotFuturesHedgeState;

    fn context(&self) -> &StrategyContext<Self::State> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut StrategyContext<Self::State> {
        &mut self.ctx
    }

    async fn handle(&mut self, state: Self::State) -> Result<()> {
        match state {
            SpotFuturesHedgeState::AnalyzingMarket => self.analyze_market().await,
            SpotFuturesHedgeState::OpeningSpot => self.open_spot().await,
            SpotFuturesHedgeState::OpeningFuturesHedge => self.open_hedge().await,
            SpotFuturesHedgeState::MonitoringPositions => self.monitor().await,
            SpotFuturesHedgeState::Rebalancing => self.rebalance().await,
            SpotFuturesHedgeState::ClosingPositions => self.close_positions().await,
            SpotFuturesHedgeState::Completed
            | SpotFuturesHedgeState::Error
            | SpotFuturesHedgeState::Cancelled => Ok(()),
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
            &self.spot,
            &self.futures,
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
            metrics: StrategyMetrics::Hedge(self.metrics.clone()),
            extension: residual_extension(&self.tk, &[&self.spot, &self.futures]),
            escalation: self.escalation.clone(),
        }
    }
}
