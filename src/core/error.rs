//! Error handling - Hierarchical errors for the engine and its venues

use rust_decimal::Decimal;
use thiserror::Error;

use crate::risk::RiskError;

pub type Result<T> = std::result::Result<T, Error>;

/// Raw errors reported by an exchange venue.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("market closed or suspended: {0}")]
    MarketClosed(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("{0}")]
    Other(String),
}

/// How loudly an engine error must be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The handler may try again on the next cycle.
    Recoverable,
    /// The instance must stop.
    Fatal,
    /// The instance must stop and a human (or an unwind) must deal with open exposure.
    Escalation,
}

/// Engine error taxonomy
#[derive(Debug, Error)]
pub enum Error {
    /// Placement or fill failure on a single leg
    #[error("order execution failed on {venue}/{symbol} after {attempts} attempt(s): {reason}")]
    OrderExecution {
        venue: String,
        symbol: String,
        attempts: u32,
        retryable: bool,
        reason: String,
    },

    /// Quote or orderbook unavailable, malformed or stale
    #[error("market data unavailable: {0}")]
    MarketData(String),

    /// Position, loss, size or slippage limit breached
    #[error("risk limit breached: {0}")]
    RiskLimit(#[from] RiskError),

    /// Operation or whole-strategy deadline exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// One leg filled, its pair failed. Never retried automatically.
    #[error("partial execution: {filled_leg} filled {exposure}, {failed_leg} failed: {reason}")]
    PartialExecution {
        filled_leg: String,
        failed_leg: String,
        exposure: Decimal,
        reason: String,
    },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("strategy already produced its result")]
    AlreadyFinished,

    #[error("venue error: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("configuration error: {0}")]
    Config(String),

    /// Generic fallback
    #[error("strategy error: {0}")]
    Strategy(String),
}

impl Error {
    pub fn severity(&self) -> Severity {
        match self {
            Error::PartialExecution { .. } => Severity::Escalation,
            Error::MarketData(_) => Severity::Recoverable,
            Error::RiskLimit(e) if e.is_transient() => Severity::Recoverable,
            _ => Severity::Fatal,
        }
    }

    pub fn requires_escalation(&self) -> bool {
        self.severity() == Severity::Escalation
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
