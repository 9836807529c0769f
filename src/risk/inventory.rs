//! Inventory tracking per venue and symbol.
//!
//! Positions change only in response to confirmed fills.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;

use crate::core::{Side, Symbol};

/// Signed position in a single (venue, symbol).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InventoryPosition {
    /// Net quantity (positive = long, negative = short).
    pub quantity: Decimal,
    /// Volume-weighted average entry price.
    pub average_cost: Decimal,
    /// Realized PnL from closed quantity, before fees.
    pub realized_pnl: Decimal,
    /// Total fees paid.
    pub fees: Decimal,
    /// Latest mark used for unrealized PnL.
    pub last_mark: Option<Decimal>,
}

impl InventoryPosition {
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        match self.last_mark {
            Some(mark) if !self.is_flat() => (mark - self.average_cost) * self.quantity,
            _ => Decimal::ZERO,
        }
    }

    pub fn notional(&self, price: Decimal) -> Decimal {
        self.quantity.abs() * price
    }

    /// Apply a fill; returns the PnL realized by this fill (before fees).
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal, fee: Decimal) -> Decimal {
        if quantity.is_zero() {
            return Decimal::ZERO;
        }

        self.fees += fee;
        let delta = side.sign() * quantity;
        let old = self.quantity;
        let new = old + delta;
        let mut realized = Decimal::ZERO;

        if old.is_zero() {
            self.average_cost = price;
        } else if old.is_sign_positive() == delta.is_sign_positive() {
            // Adding to the position
            let total = old.abs() + quantity;
            self.average_cost = (old.abs() * self.average_cost + quantity * price) / total;
        } else {
            // Reducing or reversing
            let closed = quantity.min(old.abs());
            realized = if old.is_sign_positive() {
                (price - self.average_cost) * closed
            } else {
                (self.average_cost - price) * closed
            };
            self.realized_pnl += realized;

            if !new.is_zero() && new.is_sign_positive() != old.is_sign_positive() {
                self.average_cost = price;
            }
        }

        self.quantity = new;
        if self.is_flat() {
            self.average_cost = Decimal::ZERO;
        }
        realized
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InventoryKey {
    venue: String,
    symbol: Symbol,
}

/// All positions owned by one strategy instance.
#[derive(Debug, Default, Clone)]
pub struct Inventory {
    positions: HashMap<InventoryKey, InventoryPosition>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(venue: &str, symbol: &Symbol) -> InventoryKey {
        InventoryKey {
            venue: venue.to_string(),
            symbol: symbol.clone(),
        }
    }

    pub fn position(&self, venue: &str, symbol: &Symbol) -> Option<&InventoryPosition> {
        self.positions.get(&Self::key(venue, symbol))
    }

    /// Signed quantity, zero when unknown.
    pub fn quantity(&self, venue: &str, symbol: &Symbol) -> Decimal {
        self.position(venue, symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn apply_fill(
        &mut self,
        venue: &str,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        fee: Decimal,
    ) -> Decimal {
        self.positions
            .entry(Self::key(venue, symbol))
            .or_default()
            .apply_fill(side, quantity, price, fee)
    }

    pub fn mark(&mut self, venue: &str, symbol: &Symbol, mid: Decimal) {
        if let Some(position) = self.positions.get_mut(&Self::key(venue, symbol)) {
            position.last_mark = Some(mid);
        }
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl()).sum()
    }

    pub fn fees(&self) -> Decimal {
        self.positions.values().map(|p| p.fees).sum()
    }

    pub fn is_flat(&self) -> bool {
        self.positions.values().all(InventoryPosition::is_flat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_add_and_close_long() {
        let mut pos = InventoryPosition::default();
        pos.apply_fill(Side::Buy, dec!(1), dec!(100), dec!(0.1));
        pos.apply_fill(Side::Buy, dec!(1), dec!(110), dec!(0.1));
        assert_eq!(pos.average_cost, dec!(105));

        let realized = pos.apply_fill(Side::Sell, dec!(2), dec!(120), dec!(0.1));
        assert_eq!(realized, dec!(30));
        assert!(pos.is_flat());
        assert_eq!(pos.average_cost, Decimal::ZERO);
        assert_eq!(pos.fees, dec!(0.3));
    }

    #[test]
    fn test_reversal_resets_average_cost() {
        let mut pos = InventoryPosition::default();
        pos.apply_fill(Side::Sell, dec!(2), dec!(50), Decimal::ZERO);
        let realized = pos.apply_fill(Side::Buy, dec!(3), dec!(40), Decimal::ZERO);
        assert_eq!(realized, dec!(20));
        assert_eq!(pos.quantity, dec!(1));
        assert_eq!(pos.average_cost, dec!(40));
    }

    #[test]
    fn test_unrealized_uses_latest_mark() {
        let mut inv = Inventory::new();
        let sym = Symbol::new("BTCUSDT");
        inv.apply_fill("spot", &sym, Side::Buy, dec!(2), dec!(100), Decimal::ZERO);
        inv.mark("spot", &sym, dec!(103));
        assert_eq!(inv.unrealized_pnl(), dec!(6));
        assert_eq!(inv.quantity("spot", &sym), dec!(2));
        assert_eq!(inv.quantity("perp", &sym), Decimal::ZERO);
    }
}
