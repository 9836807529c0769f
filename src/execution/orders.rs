//! Order executor - placement with retry, fill polling, cancellation

use rust_decimal::Decimal;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::config::{FillConfig, RetryConfig};
use crate::core::{Error, Exchange, Order, OrderType, Result, Side, Symbol};
use crate::execution::retry::{is_retryable, RetryPolicy};

/// What a strategy wants placed.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
}

impl OrderIntent {
    pub fn market(symbol: Symbol, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol,
            side,
            quantity,
            order_type: OrderType::Market,
            price: None,
        }
    }

    pub fn limit(symbol: Symbol, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol,
            side,
            quantity,
            order_type: OrderType::Limit,
            price: Some(price),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderExecutor {
    policy: RetryPolicy,
    poll_interval: Duration,
    fill_timeout: Duration,
    /// Retry backoff never sleeps past this
    deadline: Option<Instant>,
}

impl OrderExecutor {
    pub fn new(retry: RetryConfig, fill: &FillConfig) -> Self {
        Self {
            policy: RetryPolicy::new(retry),
            poll_interval: Duration::from_millis(fill.poll_interval_ms.max(1)),
            fill_timeout: Duration::from_millis(fill.fill_timeout_ms),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Time left before the deadline, `None` when there is no deadline.
    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn fill_timeout(&self) -> Duration {
        self.fill_timeout
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Place an order, retrying retryable venue errors with backoff.
    ///
    /// Non-retryable errors abort on the first attempt. Backoff sleeps,
    /// venue retry-after included, are cut at the deadline, and no retry
    /// starts once it has passed.
    pub async fn place_order_with_retry(&self, venue: &dyn Exchange, intent: &OrderIntent) -> Result<Order> {
        let mut attempt: u32 = 0;

        loop {
            let placed = match (intent.order_type, intent.price) {
                (OrderType::Limit, Some(price)) => {
                    venue
                        .place_limit_order(&intent.symbol, intent.side, intent.quantity, price)
                        .await
                }
                (OrderType::Limit, None) => {
                    return Err(Error::OrderExecution {
                        venue: venue.name().to_string(),
                        symbol: intent.symbol.to_string(),
                        attempts: 0,
                        retryable: false,
                        reason: "limit order without price".into(),
                    });
                }
                (OrderType::Market, _) => {
                    venue
                        .place_market_order(&intent.symbol, intent.side, intent.quantity)
                        .await
                }
            };

            match placed {
                Ok(order) => {
                    if attempt > 0 {
                        info!("✅ {} order on {} placed after {} attempts", intent.symbol, venue.name(), attempt + 1);
                    }
                    debug!(
                        venue = venue.name(),
                        order_id = %order.id,
                        "{} {} {} {}",
                        intent.order_type,
                        intent.side,
                        intent.quantity,
                        intent.symbol
                    );
                    return Ok(order);
                }
                Err(err) => {
                    let retryable = is_retryable(&err);
                    let remaining = self.remaining();
                    let out_of_time = remaining.is_some_and(|left| left.is_zero());
                    if !self.policy.should_retry(&err, attempt) || out_of_time {
                        let reason = if out_of_time && self.policy.should_retry(&err, attempt) {
                            format!("{err} (deadline reached before retry)")
                        } else {
                            err.to_string()
                        };
                        return Err(Error::OrderExecution {
                            venue: venue.name().to_string(),
                            symbol: intent.symbol.to_string(),
                            attempts: attempt + 1,
                            retryable,
                            reason,
                        });
                    }

                    let wanted = self.policy.delay_after(&err, attempt);
                    let delay = remaining.map_or(wanted, |left| wanted.min(left));
                    warn!(
                        "⚠️ {} order on {} failed, retrying in {:?} (attempt {}/{}): {}",
                        intent.symbol,
                        venue.name(),
                        delay,
                        attempt + 1,
                        self.policy.max_retries(),
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Poll until `order` fills or `timeout` elapses.
    ///
    /// Venue reports are copied into `order` on every poll. Returns `false` on
    /// timeout or when the venue ends the order without filling it.
    pub async fn wait_for_order_fill(
        &self,
        venue: &dyn Exchange,
        order: &mut Order,
        timeout: Duration,
    ) -> Result<bool> {
        let started = Instant::now();

        loop {
            if order.is_filled() {
                return Ok(true);
            }
            if order.status.is_terminal() {
                return Ok(false);
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                debug!(order_id = %order.id, "fill wait timed out after {:?}", elapsed);
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;

            match venue.get_order_status(&order.symbol, &order.id).await {
                Ok(latest) => order.update_from(&latest),
                Err(err) if is_retryable(&err) => {
                    warn!("⚠️ status poll for {} on {} failed: {}", order.id, venue.name(), err);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Place then wait up to `timeout` for the fill.
    pub async fn execute(&self, venue: &dyn Exchange, intent: &OrderIntent, timeout: Duration) -> Result<Order> {
        let mut order = self.place_order_with_retry(venue, intent).await?;
        self.wait_for_order_fill(venue, &mut order, timeout).await?;
        Ok(order)
    }

    /// Cancel a resting order and copy the venue's final view back.
    pub async fn cancel_order(&self, venue: &dyn Exchange, order: &mut Order) -> Result<()> {
        if order.status.is_terminal() {
            return Ok(());
        }
        let latest = venue.cancel_order(&order.symbol, &order.id).await?;
        order.update_from(&latest);
        Ok(())
    }
}

impl Default for OrderExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default(), &FillConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExchangeError, OrderStatus};
    use crate::exchanges::{FillMode, Operation, PaperExchange};
    use rust_decimal_macros::dec;

    fn fast_executor() -> OrderExecutor {
        OrderExecutor::new(
            RetryConfig {
                initial_delay_ms: 1,
                max_delay_ms: 5,
                ..RetryConfig::default()
            },
            &FillConfig {
                poll_interval_ms: 5,
                fill_timeout_ms: 100,
            },
        )
    }

    fn venue() -> PaperExchange {
        let v = PaperExchange::new("alpha", dec!(0.001));
        v.set_quote("BTCUSDT", dec!(100), dec!(100.1));
        v
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let v = venue();
        v.fail_times(Operation::PlaceMarket, ExchangeError::Network("reset".into()), 2);

        let intent = OrderIntent::market(Symbol::new("BTCUSDT"), Side::Buy, dec!(1));
        let order = fast_executor().place_order_with_retry(&v, &intent).await.unwrap();
        assert!(order.is_filled());
        assert_eq!(v.call_count(Operation::PlaceMarket), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_immediately() {
        let v = venue();
        v.fail_next(
            Operation::PlaceMarket,
            ExchangeError::InsufficientBalance("USDT".into()),
        );

        let intent = OrderIntent::market(Symbol::new("BTCUSDT"), Side::Buy, dec!(1));
        let err = fast_executor().place_order_with_retry(&v, &intent).await.unwrap_err();
        match err {
            Error::OrderExecution {
                attempts, retryable, ..
            } => {
                assert_eq!(attempts, 1);
                assert!(!retryable);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(v.call_count(Operation::PlaceMarket), 1);
    }

    #[tokio::test]
    async fn test_retry_after_is_cut_at_deadline() {
        let v = venue();
        v.fail_times(
            Operation::PlaceMarket,
            ExchangeError::RateLimited {
                retry_after_ms: Some(5_000),
            },
            10,
        );
        let exec = fast_executor().with_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let started = Instant::now();
        let intent = OrderIntent::market(Symbol::new("BTCUSDT"), Side::Buy, dec!(1));
        let err = exec.place_order_with_retry(&v, &intent).await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        match err {
            Error::OrderExecution { attempts, reason, .. } => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("deadline"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(v.call_count(Operation::PlaceMarket), 2);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_attempts() {
        let v = venue();
        v.fail_times(Operation::PlaceLimit, ExchangeError::Timeout("slow".into()), 10);

        let intent = OrderIntent::limit(Symbol::new("BTCUSDT"), Side::Sell, dec!(1), dec!(101));
        let err = fast_executor().place_order_with_retry(&v, &intent).await.unwrap_err();
        assert!(matches!(
            err,
            Error::OrderExecution {
                attempts: 4,
                retryable: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_wait_for_fill_copies_venue_report() {
        let v = venue();
        let exec = fast_executor();
        let sym = Symbol::new("BTCUSDT");
        let intent = OrderIntent::limit(sym.clone(), Side::Buy, dec!(2), dec!(99.5));
        let mut order = exec.place_order_with_retry(&v, &intent).await.unwrap();
        assert_eq!(order.status, OrderStatus::Created);

        v.set_quote("BTCUSDT", dec!(99.4), dec!(99.5));
        let filled = exec
            .wait_for_order_fill(&v, &mut order, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(filled);
        assert_eq!(order.filled_quantity, dec!(2));
        assert_eq!(order.average_price, Some(dec!(99.5)));
        assert_eq!(order.fee, dec!(0.199));
    }

    #[tokio::test]
    async fn test_wait_for_fill_times_out() {
        let v = venue();
        v.set_fill_mode(FillMode::Never);
        let exec = fast_executor();
        let intent = OrderIntent::market(Symbol::new("BTCUSDT"), Side::Buy, dec!(1));
        let mut order = exec.place_order_with_retry(&v, &intent).await.unwrap();

        let filled = exec
            .wait_for_order_fill(&v, &mut order, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(!filled);
        assert!(v.call_count(Operation::OrderStatus) >= 1);

        exec.cancel_order(&v, &mut order).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }
}
