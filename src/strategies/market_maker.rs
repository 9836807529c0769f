//! Single-venue market maker: quote a ladder around a skewed mid, manage the
//! inventory that fills leave behind.
//!
//! ```text
//! Idle -> CalculatingSpreads -> PlacingOrders -> MonitoringOrders <-> AdjustingSpreads
//!                                                      |                  |
//!                                                      v                  v
//!                                                 OrderFilled <-----------+
//! OrderFilled -> InventoryManagement -> Idle | Completed
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::{bps_change, Error, Order, Result, Side, BPS};
use crate::execution::{OrderIntent, VolatilityTracker};
use crate::machine::{
    MarketMakingMetrics, MetricExtension, StrategyContext, StrategyMachine, StrategyMetrics,
    StrategyOutcome, StrategyState,
};
use crate::registry::{StrategyDeps, StrategyLaunch};
use crate::risk::RiskError;
use crate::strategies::{close_leg, is_dust, pause, Leg, Toolkit};

pub const STRATEGY_TYPE: &str = "market_maker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketMakerState {
    Idle,
    CalculatingSpreads,
    PlacingOrders,
    MonitoringOrders,
    AdjustingSpreads,
    OrderFilled,
    InventoryManagement,
    Completed,
    Error,
    Cancelled,
}

impl StrategyState for MarketMakerState {
    const INITIAL: Self = Self::Idle;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const CANCELLED: Self = Self::Cancelled;

    fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::CalculatingSpreads => "CalculatingSpreads",
            Self::PlacingOrders => "PlacingOrders",
            Self::MonitoringOrders => "MonitoringOrders",
            Self::AdjustingSpreads => "AdjustingSpreads",
            Self::OrderFilled => "OrderFilled",
            Self::InventoryManagement => "InventoryManagement",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Cancelled => "Cancelled",
        }
    }

    fn successors(self) -> &'static [Self] {
        match self {
            Self::Idle => &[Self::CalculatingSpreads, Self::Completed],
            Self::CalculatingSpreads => &[Self::PlacingOrders],
            Self::PlacingOrders => &[Self::MonitoringOrders],
            Self::MonitoringOrders => &[Self::AdjustingSpreads, Self::OrderFilled],
            Self::AdjustingSpreads => &[Self::MonitoringOrders, Self::OrderFilled],
            Self::OrderFilled => &[Self::InventoryManagement],
            Self::InventoryManagement => &[Self::Idle, Self::Completed],
            Self::Completed | Self::Error | Self::Cancelled => &[],
        }
    }

    fn all() -> &'static [Self] {
        &[
            Self::Idle,
            Self::CalculatingSpreads,
            Self::PlacingOrders,
            Self::MonitoringOrders,
            Self::AdjustingSpreads,
            Self::OrderFilled,
            Self::InventoryManagement,
            Self::Completed,
            Self::Error,
            Self::Cancelled,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketMakerConfig {
    pub venue: String,
    pub symbol: String,
    /// Size of the innermost level on each side
    pub order_size: Decimal,
    /// Absolute inventory at which the accumulating side stops quoting
    pub max_inventory: Decimal,
    #[serde(default = "default_base_spread_bps")]
    pub base_spread_bps: Decimal,
    #[serde(default = "default_min_spread_bps")]
    pub min_spread_bps: Decimal,
    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: Decimal,
    /// Spread added per bp of realized volatility
    #[serde(default = "default_volatility_multiplier")]
    pub volatility_multiplier: Decimal,
    /// Spread widening and reservation shift at full inventory, in bps
    #[serde(default = "default_inventory_skew_bps")]
    pub inventory_skew_bps: Decimal,
    #[serde(default = "default_levels")]
    pub levels: u32,
    #[serde(default = "default_level_spacing_bps")]
    pub level_spacing_bps: Decimal,
    /// Geometric size decay per level (0.5 halves each level)
    #[serde(default = "default_size_decay")]
    pub size_decay: Decimal,
    /// Requote once the mid moves this far from the quoted mid
    #[serde(default = "default_requote_threshold_bps")]
    pub requote_threshold_bps: Decimal,
    #[serde(default = "default_quote_ttl_ms")]
    pub quote_ttl_ms: u64,
    #[serde(default = "default_interval_ms")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_volatility_window")]
    pub volatility_window: usize,
    /// Fill cycles before completing
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
    /// Flatten inventory with a market order before completing
    #[serde(default = "default_flatten_on_exit")]
    pub flatten_on_exit: bool,
}

fn default_base_spread_bps() -> Decimal {
    Decimal::from(10)
}
fn default_min_spread_bps() -> Decimal {
    Decimal::from(4)
}
fn default_max_spread_bps() -> Decimal {
    Decimal::from(100)
}
fn default_volatility_multiplier() -> Decimal {
    Decimal::new(5, 1)
}
fn default_inventory_skew_bps() -> Decimal {
    Decimal::from(5)
}
fn default_levels() -> u32 {
    3
}
fn default_level_spacing_bps() -> Decimal {
    Decimal::from(5)
}
fn default_size_decay() -> Decimal {
    Decimal::new(5, 1)
}
fn default_requote_threshold_bps() -> Decimal {
    Decimal::from(5)
}
fn default_quote_ttl_ms() -> u64 {
    3_000
}
fn default_interval_ms() -> u64 {
    100
}
fn default_volatility_window() -> usize {
    50
}
fn default_max_cycles() -> u32 {
    10
}
fn default_flatten_on_exit() -> bool {
    true
}

impl MarketMakerConfig {
    pub fn new(venue: &str, symbol: &str, order_size: Decimal, max_inventory: Decimal) -> Self {
        Self {
            venue: venue.into(),
            symbol: symbol.into(),
            order_size,
            max_inventory,
            base_spread_bps: default_base_spread_bps(),
            min_spread_bps: default_min_spread_bps(),
            max_spread_bps: default_max_spread_bps(),
            volatility_multiplier: default_volatility_multiplier(),
            inventory_skew_bps: default_inventory_skew_bps(),
            levels: default_levels(),
            level_spacing_bps: default_level_spacing_bps(),
            size_decay: default_size_decay(),
            requote_threshold_bps: default_requote_threshold_bps(),
            quote_ttl_ms: default_quote_ttl_ms(),
            monitor_interval_ms: default_interval_ms(),
            volatility_window: default_volatility_window(),
            max_cycles: default_max_cycles(),
            flatten_on_exit: default_flatten_on_exit(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.order_size <= Decimal::ZERO || self.max_inventory <= Decimal::ZERO {
            return Err(Error::Config("order_size and max_inventory must be positive".into()));
        }
        if self.min_spread_bps > self.max_spread_bps {
            return Err(Error::Config("min_spread_bps above max_spread_bps".into()));
        }
        if self.levels == 0 {
            return Err(Error::Config("levels must be at least 1".into()));
        }
        if self.size_decay <= Decimal::ZERO || self.size_decay > Decimal::ONE {
            return Err(Error::Config("size_decay must be in (0, 1]".into()));
        }
        Ok(())
    }
}

/// One resting quote in the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteLevel {
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Inventory as a fraction of the cap, clamped to [-1, 1].
pub fn inventory_ratio(inventory: Decimal, max_inventory: Decimal) -> Decimal {
    if max_inventory <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (inventory / max_inventory).clamp(-Decimal::ONE, Decimal::ONE)
}

/// Signed inventory beyond the cap, zero while inside it.
pub fn inventory_excess(inventory: Decimal, max_inventory: Decimal) -> Decimal {
    if inventory > max_inventory {
        inventory - max_inventory
    } else if inventory < -max_inventory {
        inventory + max_inventory
    } else {
        Decimal::ZERO
    }
}

/// Full quoted spread: base + volatility term + inventory term, clamped.
pub fn quote_spread_bps(config: &MarketMakerConfig, volatility_bps: Decimal, inventory_ratio: Decimal) -> Decimal {
    let raw = config.base_spread_bps
        + config.volatility_multiplier * volatility_bps
        + config.inventory_skew_bps * inventory_ratio.abs();
    raw.clamp(config.min_spread_bps, config.max_spread_bps)
}

/// Mid shifted away from inventory: long inventory lowers both quotes.
pub fn reservation_price(mid: Decimal, inventory_ratio: Decimal, skew_bps: Decimal) -> Decimal {
    mid * (Decimal::ONE - inventory_ratio * skew_bps / BPS)
}

/// Build the quote ladder around `reservation`.
///
/// Sizes decay geometrically per level. The side that would grow inventory
/// is scaled down by the inventory ratio, the side that reduces it is scaled
/// up, and the growing side disappears entirely at the cap.
pub fn build_ladder(
    config: &MarketMakerConfig,
    reservation: Decimal,
    spread_bps: Decimal,
    inventory_ratio: Decimal,
) -> Vec<QuoteLevel> {
    let bid_scale = (Decimal::ONE - inventory_ratio).clamp(Decimal::ZERO, Decimal::TWO);
    let ask_scale = (Decimal::ONE + inventory_ratio).clamp(Decimal::ZERO, Decimal::TWO);

    let mut ladder = Vec::with_capacity(config.levels as usize * 2);
    let mut size = config.order_size;
    for level in 0..config.levels {
        let half = spread_bps / Decimal::TWO + config.level_spacing_bps * Decimal::from(level);
        let offset = half / BPS;

        let bid_qty = (size * bid_scale).round_dp(8);
        if !is_dust(bid_qty) {
            ladder.push(QuoteLevel {
                side: Side::Buy,
                price: (reservation * (Decimal::ONE - offset)).round_dp(8),
                quantity: bid_qty,
            });
        }
        let ask_qty = (size * ask_scale).round_dp(8);
        if !is_dust(ask_qty) {
            ladder.push(QuoteLevel {
                side: Side::Sell,
                price: (reservation * (Decimal::ONE + offset)).round_dp(8),
                quantity: ask_qty,
            });
        }
        size *= config.size_decay;
    }
    ladder
}

pub struct MarketMakerStrategy {
    ctx: StrategyContext<MarketMakerState>,
    config: MarketMakerConfig,
    leg: Leg,
    tk: Toolkit,
    volatility: VolatilityTracker,
    ladder: Vec<QuoteLevel>,
    resting: Vec<Order>,
    quoted_mid: Decimal,
    quoted_at: Option<Instant>,
    metrics: MarketMakingMetrics,
}

impl MarketMakerStrategy {
    pub fn new(launch: StrategyLaunch, deps: &StrategyDeps, config: MarketMakerConfig) -> Result<Self> {
        config.validate()?;
        let leg = Leg::from_deps(deps, &config.venue, &config.symbol)?;

        let ctx = StrategyContext::new(STRATEGY_TYPE, launch.context_settings(deps.transition_sla));
        let tk = Toolkit::new(deps, ctx.deadline());

        Ok(Self {
            ctx,
            volatility: VolatilityTracker::new(config.volatility_window),
            config,
            leg,
            tk,
            ladder: Vec::new(),
            resting: Vec::new(),
            quoted_mid: Decimal::ZERO,
            quoted_at: None,
            metrics: MarketMakingMetrics::default(),
        })
    }

    pub fn create(launch: StrategyLaunch, deps: &StrategyDeps) -> Result<Self> {
        let config = launch.params()?;
        Self::new(launch, deps, config)
    }

    pub fn metrics(&self) -> &MarketMakingMetrics {
        &self.metrics
    }

    pub fn inventory(&self) -> Decimal {
        self.tk.open_quantity(&self.leg)
    }

    /// Orders currently resting on the venue.
    pub fn resting_orders(&self) -> &[Order] {
        &self.resting
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.config.monitor_interval_ms)
    }

    fn fill_wait(&self) -> Duration {
        self.ctx.bounded(self.tk.orders.fill_timeout())
    }

    fn record_fill(&mut self, order: &Order) -> bool {
        let Some(delta) = self.tk.book(order) else {
            return false;
        };
        self.metrics.fills += 1;
        match delta.side {
            Side::Buy => self.metrics.buy_volume += delta.quantity,
            Side::Sell => self.metrics.sell_volume += delta.quantity,
        }
        debug!(
            strategy_id = %self.ctx.strategy_id(),
            "fill {} {} @ {} ({})",
            delta.side,
            delta.quantity,
            delta.price,
            delta.order_id
        );
        true
    }

    /// Refresh every resting quote from the venue. Returns whether any filled.
    async fn poll_resting(&mut self) -> Result<bool> {
        let venue = self.leg.venue.clone();
        let polls = join_all(
            self.resting
                .iter()
                .map(|order| venue.get_order_status(&order.symbol, &order.id)),
        )
        .await;

        let mut latest = Vec::with_capacity(polls.len());
        for (order, poll) in self.resting.iter().zip(polls) {
            match poll {
                Ok(update) => {
                    let mut order = order.clone();
                    order.update_from(&update);
                    latest.push(order);
                }
                Err(e) => {
                    warn!("⚠️ status poll for {} on {} failed: {}", order.id, self.leg.label(), e);
                    latest.push(order.clone());
                }
            }
        }

        let mut filled = false;
        for order in &latest {
            filled |= self.record_fill(order);
        }
        latest.retain(|o| !o.status.is_terminal());
        self.resting = latest;
        Ok(filled)
    }

    /// Cancel every resting quote concurrently and book whatever filled first.
    async fn cancel_all(&mut self) -> bool {
        if self.resting.is_empty() {
            return false;
        }
        let venue = self.leg.venue.clone();
        let orders = std::mem::take(&mut self.resting);
        let cancels = join_all(
            orders
                .iter()
                .map(|order| venue.cancel_order(&order.symbol, &order.id)),
        )
        .await;

        let mut filled = false;
        for (mut order, cancel) in orders.into_iter().zip(cancels) {
            match cancel {
                Ok(latest) => order.update_from(&latest),
                Err(e) => warn!("⚠️ cancel of {} on {} failed: {}", order.id, self.leg.label(), e),
            }
            filled |= self.record_fill(&order);
        }
        filled
    }

    /// Fresh quote, volatility sample and inventory-aware ladder.
    async fn compute_ladder(&mut self) -> Result<Decimal> {
        let quote = self.tk.market.quote(self.leg.venue.as_ref(), &self.leg.symbol).await?;
        let mid = quote.mid();
        self.volatility.push(mid);
        self.tk.risk.mark_to_market(self.leg.venue_name(), &self.leg.symbol, mid);

        let ratio = inventory_ratio(self.inventory(), self.config.max_inventory);
        let vol = self.volatility.realized_vol_bps();
        let spread = quote_spread_bps(&self.config, vol, ratio);
        let reservation = reservation_price(mid, ratio, self.config.inventory_skew_bps);

        self.ladder = build_ladder(&self.config, reservation, spread, ratio);
        self.metrics.last_spread_bps = spread;
        debug!(
            strategy_id = %self.ctx.strategy_id(),
            "mid {} vol {}bps inv {} -> spread {}bps around {}",
            mid,
            vol,
            ratio.round_dp(4),
            spread,
            reservation.round_dp(8)
        );
        Ok(mid)
    }

    /// Place the current ladder. Levels the risk guard rejects are skipped.
    async fn place_ladder(&mut self, mid: Decimal) -> Result<()> {
        let ladder = std::mem::take(&mut self.ladder);
        let mut placed = 0u32;

        for level in &ladder {
            match self.tk.check_order(&self.leg, level.side, level.quantity, level.price) {
                Ok(()) => {}
                Err(Error::RiskLimit(RiskError::TradingHalted(reason))) => {
                    return Err(RiskError::TradingHalted(reason).into());
                }
                Err(e) => {
                    debug!(strategy_id = %self.ctx.strategy_id(), "skip {} level @ {}: {}", level.side, level.price, e);
                    continue;
                }
            }

            let intent = OrderIntent::limit(self.leg.symbol.clone(), level.side, level.quantity, level.price);
            let order = self
                .ctx
                .recorder_mut()
                .time_async(
                    "place_quote",
                    self.tk.orders.place_order_with_retry(self.leg.venue.as_ref(), &intent),
                )
                .await?;
            placed += 1;
            self.resting.push(order);
        }

        self.metrics.quotes_placed += placed;
        self.quoted_mid = mid;
        self.quoted_at = Some(Instant::now());
        info!(
            strategy_id = %self.ctx.strategy_id(),
            "📊 quoting {} levels on {} around {} ({}bps)",
            placed,
            self.leg.label(),
            mid,
            self.metrics.last_spread_bps
        );
        Ok(())
    }

    fn idle(&mut self) -> Result<()> {
        if self.metrics.cycles >= self.config.max_cycles {
            return self
                .ctx
                .transition_to(MarketMakerState::Completed, "cycle budget spent");
        }
        if let Some(reason) = self.tk.risk.halt_reason() {
            return Err(RiskError::TradingHalted(reason.to_string()).into());
        }
        self.ctx
            .transition_to(MarketMakerState::CalculatingSpreads, "new cycle")
    }

    async fn calculate(&mut self) -> Result<()> {
        self.tk.risk.check_execution_time(self.ctx.execution_time())?;
        match self.compute_ladder().await {
            Ok(mid) => {
                self.quoted_mid = mid;
                self.ctx
                    .transition_to(MarketMakerState::PlacingOrders, "ladder computed")
            }
            Err(e) => {
                self.ctx.tolerate(e)?;
                pause(&self.ctx, self.interval()).await;
                Ok(())
            }
        }
    }

    async fn place(&mut self) -> Result<()> {
        self.place_ladder(self.quoted_mid).await?;
        self.ctx
            .transition_to(MarketMakerState::MonitoringOrders, "quotes placed")
    }

    fn needs_requote(&self, mid: Decimal) -> bool {
        let moved = bps_change(self.quoted_mid, mid).abs() > self.config.requote_threshold_bps;
        let stale = self
            .quoted_at
            .map(|t| t.elapsed() >= Duration::from_millis(self.config.quote_ttl_ms))
            .unwrap_or(true);
        moved || stale
    }

    async fn monitor(&mut self) -> Result<()> {
        if self.poll_resting().await? {
            return self
                .ctx
                .transition_to(MarketMakerState::OrderFilled, "quote filled");
        }

        match self.tk.market.quote(self.leg.venue.as_ref(), &self.leg.symbol).await {
            Ok(quote) => {
                let mid = quote.mid();
                self.volatility.push(mid);
                if self.needs_requote(mid) {
                    return self
                        .ctx
                        .transition_to(MarketMakerState::AdjustingSpreads, "mid moved or quotes aged");
                }
            }
            Err(e) => self.ctx.tolerate(e)?,
        }

        pause(&self.ctx, self.interval()).await;
        Ok(())
    }

    async fn adjust(&mut self) -> Result<()> {
        if self.cancel_all().await {
            return self
                .ctx
                .transition_to(MarketMakerState::OrderFilled, "filled while requoting");
        }
        self.metrics.requotes += 1;

        let mid = match self.compute_ladder().await {
            Ok(mid) => mid,
            Err(e) => {
                // Nothing resting; retry the requote next step
                self.ctx.tolerate(e)?;
                pause(&self.ctx, self.interval()).await;
                return Ok(());
            }
        };
        self.place_ladder(mid).await?;
        self.ctx
            .transition_to(MarketMakerState::MonitoringOrders, "requoted")
    }

    async fn order_filled(&mut self) -> Result<()> {
        // Pull the rest of the ladder; it was priced for the old inventory
        self.cancel_all().await;
        info!(
            strategy_id = %self.ctx.strategy_id(),
            "💰 inventory {} after {} fills",
            self.inventory(),
            self.metrics.fills
        );
        self.ctx
            .transition_to(MarketMakerState::InventoryManagement, "ladder pulled")
    }

    /// Market order reducing inventory by `excess` (signed like the inventory).
    async fn reduce(&mut self, excess: Decimal) -> Result<()> {
        let wait = self.fill_wait();
        let closing = self
            .ctx
            .recorder_mut()
            .time_async("flatten", close_leg(&self.tk.orders, &self.leg, excess, wait))
            .await;
        if let Some(result) = closing {
            let mut order = result?;
            if let Err(e) = self.tk.orders.cancel_order(self.leg.venue.as_ref(), &mut order).await {
                warn!("⚠️ cancel of {} on {} failed: {}", order.id, self.leg.label(), e);
            }
            self.record_fill(&order);
        }
        Ok(())
    }

    async fn manage_inventory(&mut self) -> Result<()> {
        let inventory = self.inventory();
        let excess = inventory_excess(inventory, self.config.max_inventory);
        if !is_dust(excess) {
            warn!(
                strategy_id = %self.ctx.strategy_id(),
                "⚖️ inventory {} above cap {}, reducing {}",
                inventory,
                self.config.max_inventory,
                excess
            );
            self.reduce(excess).await?;
        }

        self.metrics.cycles += 1;
        if self.metrics.cycles < self.config.max_cycles {
            return self.ctx.transition_to(MarketMakerState::Idle, "cycle done");
        }

        if self.config.flatten_on_exit {
            let remaining = self.inventory();
            if !is_dust(remaining) {
                self.reduce(remaining).await?;
            }
            self.metrics.flattened = is_dust(self.inventory());
        }
        self.ctx
            .transition_to(MarketMakerState::Completed, "cycle budget spent")
    }
}

#[async_trait]
impl StrategyMachine for MarketMakerStrategy {
    type State = MarketMakerState;

    fn context(&self) -> &StrategyContext<Self::State> {
        &self.ctx
    }

    fn context_mut(&mut self) -> &mut StrategyContext<Self::State> {
        &mut self.ctx
    }

    async fn handle(&mut self, state: Self::State) -> Result<()> {
        match state {
            MarketMakerState::Idle => self.idle(),
            MarketMakerState::CalculatingSpreads => self.calculate().await,
            MarketMakerState::PlacingOrders => self.place().await,
            MarketMakerState::MonitoringOrders => self.monitor().await,
            MarketMakerState::AdjustingSpreads => self.adjust().await,
            MarketMakerState::OrderFilled => self.order_filled().await,
            MarketMakerState::InventoryManagement => self.manage_inventory().await,
            MarketMakerState::Completed | MarketMakerState::Error | MarketMakerState::Cancelled => Ok(()),
        }
    }

    async fn on_terminal(&mut self) {
        // Never leave quotes behind, whatever ended the run
        if !self.resting.is_empty() {
            let count = self.resting.len();
            self.cancel_all().await;
            info!(strategy_id = %self.ctx.strategy_id(), "🛑 cancelled {} resting quotes", count);
        }
        self.metrics.final_inventory = self.inventory();
    }

    fn outcome(&self) -> StrategyOutcome {
        let mut metrics = self.metrics.clone();
        metrics.final_inventory = self.inventory();
        StrategyOutcome {
            realized_pnl: self.tk.risk.realized_pnl(),
            unrealized_pnl: self.tk.risk.unrealized_pnl(),
            fees: self.tk.risk.fees(),
            orders_executed: self.tk.orders_executed(),
            metrics: StrategyMetrics::MarketMaking(metrics),
            extension: Some(MetricExtension::RealizedVolatility {
                bps: self.volatility.realized_vol_bps(),
            }),
            escalation: None,
        }
    }
}
