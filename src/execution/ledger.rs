//! Fill ledger - idempotent fill accounting
//!
//! Venues report cumulative fill quantity and fee on every status poll. The
//! ledger remembers what has already been booked per order id and hands out
//! only the increment, so polling a filled order twice never double-counts.

use rust_decimal::Decimal;
use std::collections::HashMap;

use crate::core::{Order, Side, Symbol};

/// Not-yet-booked portion of an order's fills.
#[derive(Debug, Clone, PartialEq)]
pub struct FillDelta {
    pub order_id: String,
    pub venue: String,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    /// Average price of this increment
    pub price: Decimal,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Default)]
struct Booked {
    quantity: Decimal,
    notional: Decimal,
    fee: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct FillLedger {
    booked: HashMap<String, Booked>,
}

impl FillLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book whatever part of `order` is new since the last call.
    pub fn absorb(&mut self, order: &Order) -> Option<FillDelta> {
        let avg = order.average_price?;
        let booked = self.booked.entry(order.id.clone()).or_default();

        let quantity = order.filled_quantity - booked.quantity;
        if quantity <= Decimal::ZERO {
            return None;
        }

        let notional = order.filled_quantity * avg;
        let increment_notional = notional - booked.notional;
        let fee = (order.fee - booked.fee).max(Decimal::ZERO);

        booked.quantity = order.filled_quantity;
        booked.notional = notional;
        booked.fee = booked.fee.max(order.fee);

        Some(FillDelta {
            order_id: order.id.clone(),
            venue: order.exchange.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity,
            price: increment_notional / quantity,
            fee,
        })
    }

    pub fn booked_quantity(&self, order_id: &str) -> Decimal {
        self.booked
            .get(order_id)
            .map(|b| b.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn total_fees(&self) -> Decimal {
        self.booked.values().map(|b| b.fee).sum()
    }

    /// Orders with at least one booked fill.
    pub fn orders_filled(&self) -> usize {
        self.booked.values().filter(|b| !b.quantity.is_zero()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OrderStatus, OrderType};
    use rust_decimal_macros::dec;

    fn order(filled: Decimal, avg: Decimal, fee: Decimal) -> Order {
        Order {
            id: "o-1".into(),
            symbol: Symbol::new("BTCUSDT"),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: dec!(10),
            price: Some(dec!(100)),
            status: if filled == dec!(10) {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            },
            filled_quantity: filled,
            average_price: Some(avg),
            fee,
            exchange: "alpha".into(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_repeated_polls_do_not_double_count() {
        let mut ledger = FillLedger::new();
        let filled = order(dec!(10), dec!(100), dec!(1));

        let first = ledger.absorb(&filled).unwrap();
        assert_eq!(first.quantity, dec!(10));
        assert_eq!(first.fee, dec!(1));

        assert!(ledger.absorb(&filled).is_none());
        assert!(ledger.absorb(&filled).is_none());
        assert_eq!(ledger.booked_quantity("o-1"), dec!(10));
        assert_eq!(ledger.total_fees(), dec!(1));
    }

    #[test]
    fn test_partial_fills_yield_increments() {
        let mut ledger = FillLedger::new();

        let d1 = ledger.absorb(&order(dec!(4), dec!(100), dec!(0.4))).unwrap();
        assert_eq!(d1.quantity, dec!(4));
        assert_eq!(d1.price, dec!(100));

        // 6 more at 102 moves the cumulative average to 101.2
        let d2 = ledger.absorb(&order(dec!(10), dec!(101.2), dec!(1.012))).unwrap();
        assert_eq!(d2.quantity, dec!(6));
        assert_eq!(d2.price, dec!(102));
        assert_eq!(d2.fee, dec!(0.612));
        assert_eq!(ledger.orders_filled(), 1);
    }

    #[test]
    fn test_unfilled_order_books_nothing() {
        let mut ledger = FillLedger::new();
        let mut o = order(Decimal::ZERO, dec!(100), Decimal::ZERO);
        o.average_price = None;
        assert!(ledger.absorb(&o).is_none());
        assert_eq!(ledger.orders_filled(), 0);
    }
}
