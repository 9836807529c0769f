//! Market data helpers - validated quotes, books and realized volatility

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::VecDeque;

use crate::core::config::MarketDataConfig;
use crate::core::{now_millis, Error, Exchange, Orderbook, Quote, Result, Symbol};

/// Volatility reported until enough samples have been collected.
pub const DEFAULT_VOL_BPS: Decimal = Decimal::from_parts(20, 0, 0, false, 0);
const MIN_VOL_SAMPLES: usize = 10;

/// Quote and book access with sanity and staleness checks.
#[derive(Debug, Clone)]
pub struct MarketData {
    config: MarketDataConfig,
}

impl MarketData {
    pub fn new(config: MarketDataConfig) -> Self {
        Self { config }
    }

    pub fn book_depth(&self) -> usize {
        self.config.book_depth
    }

    pub async fn quote(&self, venue: &dyn Exchange, symbol: &Symbol) -> Result<Quote> {
        let quote = venue
            .get_quote(symbol)
            .await
            .map_err(|e| Error::MarketData(format!("{} quote for {}: {}", venue.name(), symbol, e)))?;
        self.validate_quote(venue.name(), symbol, &quote, now_millis())?;
        Ok(quote)
    }

    pub async fn orderbook(&self, venue: &dyn Exchange, symbol: &Symbol) -> Result<Orderbook> {
        venue
            .get_orderbook(symbol, self.config.book_depth)
            .await
            .map_err(|e| Error::MarketData(format!("{} book for {}: {}", venue.name(), symbol, e)))
    }

    pub fn validate_quote(&self, venue: &str, symbol: &Symbol, quote: &Quote, now_ms: u64) -> Result<()> {
        if quote.bid <= Decimal::ZERO || quote.ask <= Decimal::ZERO {
            return Err(Error::MarketData(format!(
                "{venue} {symbol}: non-positive quote {}/{}",
                quote.bid, quote.ask
            )));
        }
        if quote.bid > quote.ask {
            return Err(Error::MarketData(format!(
                "{venue} {symbol}: crossed quote {}/{}",
                quote.bid, quote.ask
            )));
        }
        let age = now_ms.saturating_sub(quote.timestamp);
        if age > self.config.max_quote_age_ms {
            return Err(Error::MarketData(format!(
                "{venue} {symbol}: stale quote ({age}ms old)"
            )));
        }
        Ok(())
    }
}

impl Default for MarketData {
    fn default() -> Self {
        Self::new(MarketDataConfig::default())
    }
}

/// `(far - near) / near` in basis points.
pub fn spread_bps(near: Decimal, far: Decimal) -> Decimal {
    crate::core::bps_change(near, far)
}

/// Rolling mid-price window for realized volatility.
#[derive(Debug, Clone)]
pub struct VolatilityTracker {
    window: usize,
    mids: VecDeque<Decimal>,
}

impl VolatilityTracker {
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        Self {
            window,
            mids: VecDeque::with_capacity(window + 1),
        }
    }

    pub fn push(&mut self, mid: Decimal) {
        if mid <= Decimal::ZERO {
            return;
        }
        self.mids.push_back(mid);
        while self.mids.len() > self.window {
            self.mids.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.mids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mids.is_empty()
    }

    /// Standard deviation of successive mid returns, in bps.
    pub fn realized_vol_bps(&self) -> Decimal {
        if self.mids.len() < MIN_VOL_SAMPLES {
            return DEFAULT_VOL_BPS;
        }

        let mids: Vec<f64> = self.mids.iter().filter_map(|m| m.to_f64()).collect();
        let returns: Vec<f64> = mids
            .iter()
            .zip(mids.iter().skip(1))
            .map(|(prev, cur)| (cur - prev) / prev * 10_000.0)
            .collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;

        Decimal::from_f64(variance.sqrt())
            .map(|v| v.round_dp(4))
            .unwrap_or(DEFAULT_VOL_BPS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(bid: Decimal, ask: Decimal, ts: u64) -> Quote {
        Quote {
            bid,
            ask,
            bid_size: dec!(1),
            ask_size: dec!(1),
            timestamp: ts,
        }
    }

    #[test]
    fn test_quote_sanity_and_staleness() {
        let md = MarketData::default();
        let sym = Symbol::new("BTCUSDT");
        assert!(md.validate_quote("a", &sym, &quote(dec!(99), dec!(100), 10_000), 10_100).is_ok());
        assert!(md.validate_quote("a", &sym, &quote(dec!(101), dec!(100), 10_000), 10_100).is_err());
        assert!(md.validate_quote("a", &sym, &quote(Decimal::ZERO, dec!(100), 10_000), 10_100).is_err());

        let stale = md.validate_quote("a", &sym, &quote(dec!(99), dec!(100), 1_000), 10_000);
        assert!(matches!(stale, Err(Error::MarketData(_))));
    }

    #[test]
    fn test_volatility_defaults_until_warm() {
        let mut vol = VolatilityTracker::new(50);
        for _ in 0..5 {
            vol.push(dec!(100));
        }
        assert_eq!(vol.realized_vol_bps(), DEFAULT_VOL_BPS);
    }

    #[test]
    fn test_flat_prices_have_zero_volatility() {
        let mut vol = VolatilityTracker::new(20);
        for _ in 0..15 {
            vol.push(dec!(100));
        }
        assert_eq!(vol.realized_vol_bps(), Decimal::ZERO);
    }

    #[test]
    fn test_alternating_prices_measure_volatility() {
        let mut vol = VolatilityTracker::new(20);
        for i in 0..12 {
            vol.push(if i % 2 == 0 { dec!(100) } else { dec!(101) });
        }
        let bps = vol.realized_vol_bps();
        assert!(bps > dec!(90) && bps < dec!(110), "vol {bps}");
        assert_eq!(vol.len(), 12);
    }
}
