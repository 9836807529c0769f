//! Paper exchange - in-memory simulated venue
//!
//! Market orders fill against the current quote, resting limit orders fill
//! when a status poll finds the quote crossing their price. Failures, fill
//! behaviour and latency can be scripted per operation.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::core::config::VenueConfig;
use crate::core::{
    now_millis, Exchange, ExchangeError, ExchangeResult, Order, OrderStatus, OrderType, Orderbook,
    Position, PriceLevel, Quote, Side, Symbol, BPS,
};

/// Venue operations, used to script failures and count calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Quote,
    PlaceMarket,
    PlaceLimit,
    Cancel,
    OrderStatus,
    Position,
    Orderbook,
}

/// How new orders get filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillMode {
    /// Market orders and marketable limits fill in full on placement
    Immediate,
    /// Nothing ever fills
    Never,
    /// Market orders fill this fraction of their quantity and then stall
    Partial(Decimal),
}

#[derive(Debug, Clone)]
struct QuoteEntry {
    quote: Quote,
    /// Keep the stored timestamp instead of stamping reads with "now"
    pinned: bool,
}

#[derive(Debug)]
struct Inner {
    quotes: HashMap<Symbol, QuoteEntry>,
    books: HashMap<Symbol, Orderbook>,
    orders: HashMap<String, Order>,
    positions: HashMap<Symbol, Position>,
    fill_mode: FillMode,
    failures: HashMap<Operation, VecDeque<ExchangeError>>,
    calls: HashMap<Operation, u32>,
    latency: Duration,
    walk_bps: f64,
}

pub struct PaperExchange {
    name: String,
    fee_rate: Decimal,
    inner: Mutex<Inner>,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>, fee_rate: Decimal) -> Self {
        Self {
            name: name.into(),
            fee_rate,
            inner: Mutex::new(Inner {
                quotes: HashMap::new(),
                books: HashMap::new(),
                orders: HashMap::new(),
                positions: HashMap::new(),
                fill_mode: FillMode::Immediate,
                failures: HashMap::new(),
                calls: HashMap::new(),
                latency: Duration::ZERO,
                walk_bps: 0.0,
            }),
        }
    }

    pub fn from_config(cfg: &VenueConfig) -> Self {
        let venue = Self::new(cfg.name.clone(), cfg.fee_rate);
        venue.inner.lock().walk_bps = cfg.walk_bps.max(0.0);
        for seed in &cfg.quotes {
            venue.set_quote_with_size(Symbol::new(&seed.symbol), seed.bid, seed.ask, seed.size);
        }
        venue
    }

    pub fn fee_rate(&self) -> Decimal {
        self.fee_rate
    }

    pub fn set_quote(&self, symbol: impl Into<Symbol>, bid: Decimal, ask: Decimal) {
        self.set_quote_with_size(symbol, bid, ask, Decimal::ONE_HUNDRED);
    }

    pub fn set_quote_with_size(&self, symbol: impl Into<Symbol>, bid: Decimal, ask: Decimal, size: Decimal) {
        let quote = Quote {
            bid,
            ask,
            bid_size: size,
            ask_size: size,
            timestamp: now_millis(),
        };
        self.inner.lock().quotes.insert(
            symbol.into(),
            QuoteEntry {
                quote,
                pinned: false,
            },
        );
    }

    /// Store a quote verbatim, timestamp included.
    pub fn set_raw_quote(&self, symbol: impl Into<Symbol>, quote: Quote) {
        self.inner
            .lock()
            .quotes
            .insert(symbol.into(), QuoteEntry { quote, pinned: true });
    }

    pub fn set_orderbook(&self, book: Orderbook) {
        self.inner.lock().books.insert(book.symbol.clone(), book);
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.inner.lock().fill_mode = mode;
    }

    /// Simulated round-trip delay applied to every call.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// Fail the next call of `op` with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: Operation, err: ExchangeError) {
        self.fail_times(op, err, 1);
    }

    pub fn fail_times(&self, op: Operation, err: ExchangeError, times: usize) {
        let mut inner = self.inner.lock();
        let queue = inner.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    pub fn call_count(&self, op: Operation) -> u32 {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn position_quantity(&self, symbol: &Symbol) -> Decimal {
        self.inner
            .lock()
            .positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn open_orders(&self) -> usize {
        self.inner
            .lock()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    /// Orders seen by this venue, oldest first.
    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.inner.lock().orders.values().cloned().collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    /// Fill a resting order in full at its limit price.
    pub fn fill_resting(&self, order_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(order) = inner.orders.get(order_id).cloned() else {
            return false;
        };
        if order.status.is_terminal() {
            return false;
        }
        let price = order.price.unwrap_or(Decimal::ZERO);
        let qty = order.remaining();
        self.fill(&mut inner, &order.id, qty, price);
        true
    }

    fn begin(&self, op: Operation) -> (Duration, Option<ExchangeError>) {
        let mut inner = self.inner.lock();
        *inner.calls.entry(op).or_insert(0) += 1;
        let failure = inner.failures.get_mut(&op).and_then(VecDeque::pop_front);
        (inner.latency, failure)
    }

    async fn enter(&self, op: Operation) -> ExchangeResult<()> {
        let (latency, failure) = self.begin(op);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn current_quote(inner: &mut Inner, symbol: &Symbol) -> ExchangeResult<Quote> {
        let walk_bps = inner.walk_bps;
        let entry = inner
            .quotes
            .get_mut(symbol)
            .ok_or_else(|| ExchangeError::InvalidParameters(format!("unknown symbol {symbol}")))?;

        if walk_bps > 0.0 {
            let step = (rand::random::<f64>() * 2.0 - 1.0) * walk_bps;
            if let Some(step) = Decimal::from_f64(step) {
                let mid = entry.quote.mid();
                let shift = (mid * step / BPS).round_dp(8);
                entry.quote.bid += shift;
                entry.quote.ask += shift;
            }
        }
        if !entry.pinned {
            entry.quote.timestamp = now_millis();
        }
        Ok(entry.quote)
    }

    fn fill(&self, inner: &mut Inner, order_id: &str, quantity: Decimal, price: Decimal) {
        if quantity <= Decimal::ZERO {
            return;
        }
        let Some(order) = inner.orders.get_mut(order_id) else {
            return;
        };

        let prev_notional = order.filled_notional();
        order.filled_quantity += quantity;
        order.average_price = Some((prev_notional + quantity * price) / order.filled_quantity);
        order.fee += quantity * price * self.fee_rate;
        order.status = if order.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
        order.updated_at = now_millis();

        let symbol = order.symbol.clone();
        let side = order.side;
        let position = inner.positions.entry(symbol.clone()).or_insert(Position {
            symbol,
            quantity: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
        });
        let delta = side.sign() * quantity;
        let new_qty = position.quantity + delta;
        if position.quantity.is_zero() || position.quantity.is_sign_positive() != new_qty.is_sign_positive() {
            position.entry_price = price;
        } else if position.quantity.is_sign_positive() == delta.is_sign_positive() {
            position.entry_price = (position.quantity.abs() * position.entry_price + quantity * price)
                / new_qty.abs();
        }
        position.quantity = new_qty;
    }

    fn new_order(&self, symbol: &Symbol, side: Side, order_type: OrderType, quantity: Decimal, price: Option<Decimal>) -> Order {
        let now = now_millis();
        Order {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.clone(),
            side,
            order_type,
            quantity,
            price,
            status: OrderStatus::Created,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            fee: Decimal::ZERO,
            exchange: self.name.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fill resting limits that the current quote has crossed.
    fn match_resting(&self, inner: &mut Inner, order_id: &str) {
        if inner.fill_mode == FillMode::Never {
            return;
        }
        let Some(order) = inner.orders.get(order_id).cloned() else {
            return;
        };
        let (OrderType::Limit, Some(limit)) = (order.order_type, order.price) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }
        let Some(entry) = inner.quotes.get(&order.symbol) else {
            return;
        };
        let crossed = match order.side {
            Side::Buy => entry.quote.ask <= limit,
            Side::Sell => entry.quote.bid >= limit,
        };
        if crossed {
            self.fill(inner, order_id, order.remaining(), limit);
        }
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_quote(&self, symbol: &Symbol) -> ExchangeResult<Quote> {
        self.enter(Operation::Quote).await?;
        let mut inner = self.inner.lock();
        Self::current_quote(&mut inner, symbol)
    }

    async fn place_market_order(&self, symbol: &Symbol, side: Side, quantity: Decimal) -> ExchangeResult<Order> {
        self.enter(Operation::PlaceMarket).await?;
        if quantity <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParameters(format!("quantity {quantity}")));
        }

        let mut inner = self.inner.lock();
        let quote = Self::current_quote(&mut inner, symbol)?;
        let price = quote.taker_price(side);
        let order = self.new_order(symbol, side, OrderType::Market, quantity, None);
        let id = order.id.clone();
        inner.orders.insert(id.clone(), order);

        match inner.fill_mode {
            FillMode::Immediate => self.fill(&mut inner, &id, quantity, price),
            FillMode::Partial(fraction) => {
                self.fill(&mut inner, &id, (quantity * fraction).round_dp(8), price)
            }
            FillMode::Never => {}
        }

        debug!(venue = %self.name, "paper market {} {} {} @ {}", side, quantity, symbol, price);
        inner
            .orders
            .get(&id)
            .cloned()
            .ok_or(ExchangeError::OrderNotFound(id))
    }

    async fn place_limit_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        price: Decimal,
    ) -> ExchangeResult<Order> {
        self.enter(Operation::PlaceLimit).await?;
        if quantity <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParameters(format!("{quantity} @ {price}")));
        }

        let mut inner = self.inner.lock();
        let quote = Self::current_quote(&mut inner, symbol)?;
        let order = self.new_order(symbol, side, OrderType::Limit, quantity, Some(price));
        let id = order.id.clone();
        inner.orders.insert(id.clone(), order);

        let marketable = match side {
            Side::Buy => quote.ask <= price,
            Side::Sell => quote.bid >= price,
        };
        if marketable && inner.fill_mode == FillMode::Immediate {
            self.fill(&mut inner, &id, quantity, quote.taker_price(side));
        }

        inner
            .orders
            .get(&id)
            .cloned()
            .ok_or(ExchangeError::OrderNotFound(id))
    }

    async fn cancel_order(&self, _symbol: &Symbol, order_id: &str) -> ExchangeResult<Order> {
        self.enter(Operation::Cancel).await?;
        let mut inner = self.inner.lock();
        let order = inner
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Cancelled;
            order.updated_at = now_millis();
        }
        Ok(order.clone())
    }

    async fn get_order_status(&self, _symbol: &Symbol, order_id: &str) -> ExchangeResult<Order> {
        self.enter(Operation::OrderStatus).await?;
        let mut inner = self.inner.lock();
        self.match_resting(&mut inner, order_id);
        inner
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
    }

    async fn get_position(&self, symbol: &Symbol) -> ExchangeResult<Option<Position>> {
        self.enter(Operation::Position).await?;
        let inner = self.inner.lock();
        let Some(position) = inner.positions.get(symbol) else {
            return Ok(None);
        };
        if position.quantity.is_zero() {
            return Ok(None);
        }
        let mut position = position.clone();
        if let Some(entry) = inner.quotes.get(symbol) {
            position.unrealized_pnl = (entry.quote.mid() - position.entry_price) * position.quantity;
        }
        Ok(Some(position))
    }

    async fn get_orderbook(&self, symbol: &Symbol, depth: usize) -> ExchangeResult<Orderbook> {
        self.enter(Operation::Orderbook).await?;
        let mut inner = self.inner.lock();
        if let Some(book) = inner.books.get(symbol) {
            let mut book = book.clone();
            book.bids.truncate(depth);
            book.asks.truncate(depth);
            return Ok(book);
        }

        // Synthesize a ladder one bp apart from the top of book
        let quote = Self::current_quote(&mut inner, symbol)?;
        let step = quote.mid() / BPS;
        let levels = depth.clamp(1, 5);
        let bids = (0..levels)
            .map(|i| PriceLevel::new(quote.bid - step * Decimal::from(i), quote.bid_size))
            .collect();
        let asks = (0..levels)
            .map(|i| PriceLevel::new(quote.ask + step * Decimal::from(i), quote.ask_size))
            .collect();
        Ok(Orderbook {
            symbol: symbol.clone(),
            bids,
            asks,
            timestamp: quote.timestamp,
        })
    }
}
