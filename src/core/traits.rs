//! Core traits - the engine's only boundary to the outside world

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::core::error::ExchangeError;
use crate::core::types::*;

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Exchange capability set consumed uniformly by every strategy.
///
/// Implementations own any shared resources (price caches, connection pools)
/// and must be safe to call from many strategy instances at once.
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Venue name (e.g., "binance-spot")
    fn name(&self) -> &str;

    /// Current top-of-book
    async fn get_quote(&self, symbol: &Symbol) -> ExchangeResult<Quote>;

    async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
    ) -> ExchangeResult<Order>;

    async fn place_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> ExchangeResult<Order>;

    /// Cancel an order; returns the final order state as seen by the venue.
    async fn cancel_order(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<Order>;

    async fn get_order_status(&self, symbol: &Symbol, order_id: &str) -> ExchangeResult<Order>;

    /// `None` when the account is flat in `symbol`.
    async fn get_position(&self, symbol: &Symbol) -> ExchangeResult<Option<Position>>;

    /// Orderbook snapshot limited to `depth` levels per side
    async fn get_orderbook(&self, symbol: &Symbol, depth: usize) -> ExchangeResult<Orderbook>;
}
