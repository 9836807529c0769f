//! Strategy results, typed per-family metrics and escalation records

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core::Severity;
use crate::perf::PerformanceSummary;

/// What to do when the second leg of a pair fails after the first filled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindPolicy {
    /// Stop and leave the filled leg for manual handling
    #[default]
    Escalate,
    /// Reverse the filled leg with a market order, then escalate
    AutoUnwind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnwindOutcome {
    NotAttempted,
    Unwound {
        order_id: String,
        quantity: Decimal,
        price: Decimal,
    },
    Failed {
        reason: String,
    },
}

/// One-leg-filled condition handed to a human or an unwind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Escalation {
    pub filled_leg: String,
    pub failed_leg: String,
    /// Signed open quantity on the filled leg (positive = long)
    pub exposure_quantity: Decimal,
    pub reason: String,
    pub unwind: UnwindOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    MaxHoldingTime,
    Convergence,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HedgeMetrics {
    pub entry_basis_bps: Option<Decimal>,
    pub exit_basis_bps: Option<Decimal>,
    pub spot_quantity: Decimal,
    pub futures_quantity: Decimal,
    pub target_hedge_ratio: Decimal,
    pub max_drift: Decimal,
    /// Drift measured after the most recent rebalance
    pub post_rebalance_drift: Option<Decimal>,
    pub rebalances: u32,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpreadDirection {
    /// Long near, short far
    LongNearShortFar,
    /// Short near, long far
    ShortNearLongFar,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpreadMetrics {
    pub scans: u32,
    pub validation_failures: u32,
    pub direction: Option<SpreadDirection>,
    pub entry_spread_bps: Option<Decimal>,
    pub exit_spread_bps: Option<Decimal>,
    pub long_quantity: Decimal,
    pub short_quantity: Decimal,
    pub adjustments: u32,
    pub exit_reason: Option<ExitReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketMakingMetrics {
    pub cycles: u32,
    pub quotes_placed: u32,
    pub requotes: u32,
    pub fills: u32,
    pub buy_volume: Decimal,
    pub sell_volume: Decimal,
    pub final_inventory: Decimal,
    pub last_spread_bps: Decimal,
    pub flattened: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArbitrageMetrics {
    pub opportunities_scanned: u32,
    pub opportunities_detected: u32,
    pub validation_failures: u32,
    pub buy_venue: Option<String>,
    pub sell_venue: Option<String>,
    pub expected_profit_bps: Option<Decimal>,
    pub buy_price: Option<Decimal>,
    pub sell_price: Option<Decimal>,
    pub matched_quantity: Decimal,
    pub net_profit: Option<Decimal>,
}

/// Strategy-specific metrics, one typed record per family.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyMetrics {
    Hedge(HedgeMetrics),
    Spread(SpreadMetrics),
    MarketMaking(MarketMakingMetrics),
    Arbitrage(ArbitrageMetrics),
}

/// Optional extras that only some runs produce.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricExtension {
    RealizedVolatility { bps: Decimal },
    /// Signed quantity left open on a leg at termination
    ResidualExposure { leg: String, quantity: Decimal },
}

/// What a machine reports about itself when it terminates.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees: Decimal,
    pub orders_executed: u32,
    pub metrics: StrategyMetrics,
    pub extension: Option<MetricExtension>,
    pub escalation: Option<Escalation>,
}

/// Immutable summary emitted exactly once per instance.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyResult {
    pub strategy_id: String,
    pub strategy_type: String,
    pub success: bool,
    pub final_state: String,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub fees: Decimal,
    pub orders_executed: u32,
    pub state_transitions: u32,
    pub execution_time_ms: u64,
    pub error: Option<String>,
    pub error_severity: Option<Severity>,
    pub escalation: Option<Escalation>,
    pub metrics: StrategyMetrics,
    pub extension: Option<MetricExtension>,
    pub performance: PerformanceSummary,
}

impl StrategyResult {
    pub fn escalated(&self) -> bool {
        self.escalation.is_some()
    }

    /// Realized PnL net of fees.
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.fees
    }
}
