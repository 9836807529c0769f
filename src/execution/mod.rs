//! Execution layer - Order placement, fill tracking and market data

pub mod depth;
pub mod ledger;
pub mod market_data;
pub mod orders;
pub mod retry;

pub use depth::{validate_orderbook_depth, DepthCheck};
pub use ledger::{FillDelta, FillLedger};
pub use market_data::{spread_bps, MarketData, VolatilityTracker};
pub use orders::{OrderExecutor, OrderIntent};
pub use retry::{classify, is_retryable, ErrorClass, RetryPolicy};
