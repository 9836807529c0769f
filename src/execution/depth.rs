//! Orderbook depth and slippage validation

use rust_decimal::Decimal;

use crate::core::{Error, Orderbook, Result, Side, BPS};
use crate::risk::RiskError;

/// Outcome of walking the book for a taker order.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthCheck {
    pub vwap: Decimal,
    pub best_price: Decimal,
    /// Adverse distance of the VWAP from the best price
    pub slippage_bps: Decimal,
    pub levels_used: usize,
}

/// Walk the side a taker on `side` would consume until `quantity` is covered.
///
/// Fails with `MarketData` when the visible book cannot fill the full
/// quantity and with `RiskLimit(Slippage)` when the VWAP is too far from
/// the touch.
pub fn validate_orderbook_depth(
    book: &Orderbook,
    side: Side,
    quantity: Decimal,
    max_slippage_bps: Decimal,
) -> Result<DepthCheck> {
    if quantity <= Decimal::ZERO {
        return Err(Error::Strategy(format!("depth check for non-positive quantity {quantity}")));
    }

    let levels = book.taker_levels(side);
    let best_price = match levels.first() {
        Some(level) if level.price > Decimal::ZERO => level.price,
        _ => {
            return Err(Error::MarketData(format!(
                "{} book has no {} liquidity",
                book.symbol,
                if side == Side::Buy { "ask" } else { "bid" }
            )));
        }
    };

    let mut remaining = quantity;
    let mut notional = Decimal::ZERO;
    let mut levels_used = 0;

    for level in levels {
        if remaining <= Decimal::ZERO {
            break;
        }
        let take = remaining.min(level.quantity);
        notional += take * level.price;
        remaining -= take;
        levels_used += 1;
    }

    if remaining > Decimal::ZERO {
        return Err(Error::MarketData(format!(
            "insufficient depth on {}: {} of {} unfilled",
            book.symbol, remaining, quantity
        )));
    }

    let vwap = notional / quantity;
    let slippage_bps = match side {
        Side::Buy => (vwap - best_price) / best_price * BPS,
        Side::Sell => (best_price - vwap) / best_price * BPS,
    };

    if slippage_bps > max_slippage_bps {
        return Err(RiskError::Slippage {
            slippage_bps: slippage_bps.round_dp(4),
            limit_bps: max_slippage_bps,
        }
        .into());
    }

    Ok(DepthCheck {
        vwap,
        best_price,
        slippage_bps,
        levels_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PriceLevel, Symbol};
    use rust_decimal_macros::dec;

    fn book() -> Orderbook {
        Orderbook {
            symbol: Symbol::new("BTCUSDT"),
            bids: vec![
                PriceLevel::new(dec!(99), dec!(5)),
                PriceLevel::new(dec!(98), dec!(5)),
            ],
            asks: vec![
                PriceLevel::new(dec!(100), dec!(5)),
                PriceLevel::new(dec!(101), dec!(5)),
            ],
            timestamp: 0,
        }
    }

    #[test]
    fn test_single_level_has_no_slippage() {
        let check = validate_orderbook_depth(&book(), Side::Buy, dec!(5), dec!(10)).unwrap();
        assert_eq!(check.vwap, dec!(100));
        assert_eq!(check.slippage_bps, Decimal::ZERO);
        assert_eq!(check.levels_used, 1);
    }

    #[test]
    fn test_walks_levels_and_computes_vwap() {
        // 5 @ 100 + 5 @ 101 = 100.5 -> 50 bps
        let check = validate_orderbook_depth(&book(), Side::Buy, dec!(10), dec!(60)).unwrap();
        assert_eq!(check.vwap, dec!(100.5));
        assert_eq!(check.slippage_bps, dec!(50));
        assert_eq!(check.levels_used, 2);

        let sell = validate_orderbook_depth(&book(), Side::Sell, dec!(10), dec!(60)).unwrap();
        assert_eq!(sell.vwap, dec!(98.5));
    }

    #[test]
    fn test_rejects_excess_slippage() {
        let err = validate_orderbook_depth(&book(), Side::Buy, dec!(10), dec!(20)).unwrap_err();
        assert!(matches!(err, Error::RiskLimit(RiskError::Slippage { .. })));
    }

    #[test]
    fn test_rejects_insufficient_depth() {
        let err = validate_orderbook_depth(&book(), Side::Buy, dec!(11), dec!(1000)).unwrap_err();
        assert!(matches!(err, Error::MarketData(_)));
    }
}
