//! Risk Guard - hard limits checked before any capital commitment.
//!
//! One guard per strategy instance. It is mutated only by its owning
//! state machine, so no locking is needed.

pub mod inventory;

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

use crate::core::config::RiskLimits;
use crate::core::{Side, Symbol};

pub use inventory::{Inventory, InventoryPosition};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskError {
    #[error("order value {value} exceeds max {limit}")]
    OrderTooLarge { value: Decimal, limit: Decimal },

    #[error("{symbol} position value {projected} would exceed max {limit}")]
    PositionLimit {
        symbol: Symbol,
        projected: Decimal,
        limit: Decimal,
    },

    #[error("projected daily pnl {projected} breaches loss limit -{limit}")]
    DailyLossLimit { projected: Decimal, limit: Decimal },

    #[error("execution time {elapsed_ms}ms exceeds ceiling {limit_ms}ms")]
    ExecutionTime { elapsed_ms: u64, limit_ms: u64 },

    #[error("slippage {slippage_bps}bps exceeds max {limit_bps}bps")]
    Slippage {
        slippage_bps: Decimal,
        limit_bps: Decimal,
    },

    #[error("hedge ratio drift {drift} exceeds tolerance {tolerance}")]
    HedgeDrift { drift: Decimal, tolerance: Decimal },

    #[error("trading halted: {0}")]
    TradingHalted(String),
}

impl RiskError {
    /// Rejections that may clear up on their own as the market moves.
    pub fn is_transient(&self) -> bool {
        matches!(self, RiskError::Slippage { .. })
    }
}

/// Risk Guard - enforces limits and keeps the instance's inventory.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    limits: RiskLimits,
    inventory: Inventory,
    halted: Option<String>,
}

impl RiskGuard {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            inventory: Inventory::new(),
            halted: None,
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Check a prospective order.
    ///
    /// `potential_loss` is the worst-case loss the caller attributes to this
    /// order (fees, expected slippage); it is added to the daily projection.
    pub fn check_order(
        &self,
        venue: &str,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        potential_loss: Decimal,
    ) -> Result<(), RiskError> {
        if let Some(reason) = &self.halted {
            return Err(RiskError::TradingHalted(reason.clone()));
        }

        let value = quantity.abs() * price;
        if value > self.limits.max_order_value {
            return Err(RiskError::OrderTooLarge {
                value,
                limit: self.limits.max_order_value,
            });
        }

        let projected_qty = self.inventory.quantity(venue, symbol) + side.sign() * quantity.abs();
        let projected = projected_qty.abs() * price;
        if projected > self.limits.max_position_value {
            return Err(RiskError::PositionLimit {
                symbol: symbol.clone(),
                projected,
                limit: self.limits.max_position_value,
            });
        }

        let projected_pnl = self.daily_pnl() - potential_loss.abs();
        if projected_pnl < -self.limits.max_daily_loss {
            return Err(RiskError::DailyLossLimit {
                projected: projected_pnl,
                limit: self.limits.max_daily_loss,
            });
        }

        Ok(())
    }

    pub fn check_execution_time(&self, elapsed: Duration) -> Result<(), RiskError> {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms > self.limits.max_execution_time_ms {
            return Err(RiskError::ExecutionTime {
                elapsed_ms,
                limit_ms: self.limits.max_execution_time_ms,
            });
        }
        Ok(())
    }

    /// Book a confirmed fill. Returns the PnL it realized (before fees).
    pub fn apply_fill(
        &mut self,
        venue: &str,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Decimal {
        let realized = self
            .inventory
            .apply_fill(venue, symbol, side, quantity, price, fee);
        self.inventory.mark(venue, symbol, price);
        self.check_circuit_breaker();
        realized
    }

    pub fn mark_to_market(&mut self, venue: &str, symbol: &Symbol, mid: Decimal) {
        self.inventory.mark(venue, symbol, mid);
        self.check_circuit_breaker();
    }

    /// Realized net of fees plus unrealized.
    pub fn daily_pnl(&self) -> Decimal {
        self.realized_pnl() - self.inventory.fees() + self.inventory.unrealized_pnl()
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.inventory.realized_pnl()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.inventory.unrealized_pnl()
    }

    pub fn fees(&self) -> Decimal {
        self.inventory.fees()
    }

    fn check_circuit_breaker(&mut self) {
        if self.halted.is_some() {
            return;
        }
        let pnl = self.daily_pnl();
        if pnl <= -self.limits.max_daily_loss {
            let reason = format!(
                "daily loss {} reached limit {}",
                pnl, self.limits.max_daily_loss
            );
            error!("🛑 Circuit breaker tripped: {}", reason);
            self.halted = Some(reason);
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Halt reason, if the breaker has tripped.
    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Hedge-instrument quantity relative to the primary quantity.
    pub fn hedge_ratio(primary_quantity: Decimal, hedge_quantity: Decimal) -> Decimal {
        if primary_quantity.is_zero() {
            return Decimal::ZERO;
        }
        hedge_quantity.abs() / primary_quantity.abs()
    }

    pub fn hedge_ratio_drift(current_ratio: Decimal, target_ratio: Decimal) -> Decimal {
        (current_ratio - target_ratio).abs()
    }

    /// True when drift exceeds the configured tolerance.
    pub fn needs_rebalance(&self, current_ratio: Decimal, target_ratio: Decimal) -> bool {
        Self::hedge_ratio_drift(current_ratio, target_ratio) > self.limits.max_hedge_drift
    }

    pub fn check_drift(&self, current_ratio: Decimal, target_ratio: Decimal) -> Result<(), RiskError> {
        let drift = Self::hedge_ratio_drift(current_ratio, target_ratio);
        if drift > self.limits.max_hedge_drift {
            return Err(RiskError::HedgeDrift {
                drift,
                tolerance: self.limits.max_hedge_drift,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_value: dec!(100000),
            max_order_value: dec!(50000),
            max_daily_loss: dec!(1000),
            max_execution_time_ms: 1_000,
            max_hedge_drift: dec!(0.05),
        }
    }

    #[test]
    fn test_order_too_large() {
        let guard = RiskGuard::new(limits());
        let sym = Symbol::new("BTCUSDT");

        // 10 * 50000 = $500k > $50k limit
        let result = guard.check_order("spot", &sym, Side::Buy, dec!(10), dec!(50000), Decimal::ZERO);
        assert!(matches!(result, Err(RiskError::OrderTooLarge { .. })));
    }

    #[test]
    fn test_position_limit_uses_projected_inventory() {
        let mut guard = RiskGuard::new(limits());
        let sym = Symbol::new("BTCUSDT");
        guard.apply_fill("spot", &sym, Side::Buy, dec!(1.5), dec!(50000), Decimal::ZERO);

        let result = guard.check_order("spot", &sym, Side::Buy, dec!(0.6), dec!(50000), Decimal::ZERO);
        assert!(matches!(result, Err(RiskError::PositionLimit { .. })));

        // Reducing the position is fine
        assert!(guard
            .check_order("spot", &sym, Side::Sell, dec!(0.6), dec!(50000), Decimal::ZERO)
            .is_ok());
    }

    #[test]
    fn test_daily_loss_projection_and_breaker() {
        let mut guard = RiskGuard::new(limits());
        let sym = Symbol::new("ETHUSDT");
        guard.apply_fill("spot", &sym, Side::Buy, dec!(10), dec!(100), Decimal::ZERO);
        guard.apply_fill("spot", &sym, Side::Sell, dec!(10), dec!(40), Decimal::ZERO);
        assert_eq!(guard.realized_pnl(), dec!(-600));

        let result = guard.check_order("spot", &sym, Side::Buy, dec!(1), dec!(40), dec!(500));
        assert!(matches!(result, Err(RiskError::DailyLossLimit { .. })));
        assert!(!guard.is_halted());

        guard.apply_fill("spot", &sym, Side::Buy, dec!(10), dec!(100), Decimal::ZERO);
        guard.apply_fill("spot", &sym, Side::Sell, dec!(10), dec!(60), Decimal::ZERO);
        assert!(guard.is_halted());
        let result = guard.check_order("spot", &sym, Side::Buy, dec!(0.1), dec!(60), Decimal::ZERO);
        assert!(matches!(result, Err(RiskError::TradingHalted(_))));
    }

    #[test]
    fn test_execution_time_ceiling() {
        let guard = RiskGuard::new(limits());
        assert!(guard.check_execution_time(Duration::from_millis(500)).is_ok());
        assert!(guard.check_execution_time(Duration::from_millis(1500)).is_err());
    }

    #[test]
    fn test_hedge_drift_detection() {
        let guard = RiskGuard::new(limits());
        // 10 BTC spot hedged with -9 BTC futures
        let ratio = RiskGuard::hedge_ratio(dec!(10), dec!(-9.0));
        assert_eq!(ratio, dec!(0.9));
        assert_eq!(RiskGuard::hedge_ratio_drift(ratio, dec!(1.0)), dec!(0.1));
        assert!(guard.needs_rebalance(ratio, dec!(1.0)));
        assert!(!guard.needs_rebalance(dec!(0.97), dec!(1.0)));
        assert!(guard.check_drift(ratio, dec!(1.0)).is_err());
    }
}
