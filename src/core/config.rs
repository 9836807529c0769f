//! Configuration - Type-safe, validated config
//!
//! Loads from `config.toml`. Every section has defaults so a partial file
//! (or no file at all) still produces a runnable engine.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_subscriber::EnvFilter;

use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub fill: FillConfig,

    #[serde(default)]
    pub market_data: MarketDataConfig,

    #[serde(default)]
    pub risk: RiskLimits,

    /// Simulated venues for paper mode
    #[serde(default)]
    pub venues: Vec<VenueConfig>,

    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whole-strategy deadline applied when an entry sets none
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,

    /// Handler errors tolerated before an instance is failed
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,

    /// Handler latency above which a transition counts as an SLA breach
    #[serde(default = "default_transition_sla_us")]
    pub transition_sla_us: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_execution_time_ms() -> u64 {
    60_000
}
fn default_max_error_count() -> u32 {
    5
}
fn default_transition_sla_us() -> u64 {
    1_000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_execution_time_ms: default_max_execution_time_ms(),
            max_error_count: default_max_error_count(),
            transition_sla_us: default_transition_sla_us(),
        }
    }
}

impl EngineSettings {
    /// `RUST_LOG` when set, otherwise `log_level`.
    pub fn log_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Retry policy for order placement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Add up to 25% random jitter to each delay
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    2_000
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter: false,
        }
    }
}

/// Fill polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_fill_timeout_ms")]
    pub fill_timeout_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    50
}
fn default_fill_timeout_ms() -> u64 {
    5_000
}

impl Default for FillConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            fill_timeout_ms: default_fill_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// Quotes older than this are rejected as stale
    #[serde(default = "default_max_quote_age_ms")]
    pub max_quote_age_ms: u64,
    /// Levels requested for depth validation
    #[serde(default = "default_book_depth")]
    pub book_depth: usize,
}

fn default_max_quote_age_ms() -> u64 {
    5_000
}
fn default_book_depth() -> usize {
    20
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            max_quote_age_ms: default_max_quote_age_ms(),
            book_depth: default_book_depth(),
        }
    }
}

/// Risk limits enforced before any capital commitment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max absolute position value per venue+symbol (quote currency)
    #[serde(default = "default_max_position_value")]
    pub max_position_value: Decimal,
    /// Max notional of a single order
    #[serde(default = "default_max_order_value")]
    pub max_order_value: Decimal,
    /// Loss that trips the daily circuit breaker (positive number)
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    /// Tolerated |current hedge ratio - target|
    #[serde(default = "default_max_hedge_drift")]
    pub max_hedge_drift: Decimal,
}

fn default_max_position_value() -> Decimal {
    Decimal::from(1_000_000)
}
fn default_max_order_value() -> Decimal {
    Decimal::from(600_000)
}
fn default_max_daily_loss() -> Decimal {
    Decimal::from(10_000)
}
fn default_max_hedge_drift() -> Decimal {
    Decimal::new(5, 2)
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_value: default_max_position_value(),
            max_order_value: default_max_order_value(),
            max_daily_loss: default_max_daily_loss(),
            max_execution_time_ms: default_max_execution_time_ms(),
            max_hedge_drift: default_max_hedge_drift(),
        }
    }
}

/// Paper venue definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub name: String,
    /// Taker fee as a fraction of notional (0.001 = 10 bps)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Max random mid move per quote read, in bps (0 = static prices)
    #[serde(default)]
    pub walk_bps: f64,
    #[serde(default)]
    pub quotes: Vec<SeedQuote>,
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedQuote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    #[serde(default = "default_seed_size")]
    pub size: Decimal,
}

fn default_seed_size() -> Decimal {
    Decimal::from(100)
}

/// One configured strategy instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEntry {
    /// Registry name, e.g. "simple_arbitrage"
    #[serde(rename = "type")]
    pub kind: String,
    /// Instance id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
    #[serde(default)]
    pub max_error_count: Option<u32>,
    /// Strategy-specific parameters
    #[serde(default)]
    pub params: toml::Table,
}

impl EngineConfig {
    /// Load from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `config.toml` from the working directory, falling back to defaults.
    ///
    /// Runs before the logger exists, so the load error is handed back for
    /// the caller to report.
    pub fn load_default() -> (Self, Option<Error>) {
        match Self::load(Path::new("config.toml")) {
            Ok(cfg) => (cfg, None),
            Err(e) => (Self::default(), Some(e)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Err(e) = EnvFilter::try_new(&self.engine.log_level) {
            return Err(Error::Config(format!(
                "engine.log_level '{}' is not a valid filter: {}",
                self.engine.log_level, e
            )));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(Error::Config("retry.backoff_factor must be >= 1.0".into()));
        }
        if self.fill.poll_interval_ms == 0 {
            return Err(Error::Config("fill.poll_interval_ms must be > 0".into()));
        }
        if self.risk.max_daily_loss.is_sign_negative() {
            return Err(Error::Config("risk.max_daily_loss must be positive".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for venue in &self.venues {
            if !seen.insert(venue.name.as_str()) {
                return Err(Error::Config(format!("duplicate venue '{}'", venue.name)));
            }
        }
        Ok(())
    }

    /// Get venue config by name
    pub fn venue(&self, name: &str) -> Option<&VenueConfig> {
        self.venues.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() {
        let cfg = EngineConfig::parse("[engine]\nlog_level = \"debug\"\n").unwrap();
        assert_eq!(cfg.engine.log_level, "debug");
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.risk.max_hedge_drift, Decimal::new(5, 2));
        assert!(cfg.strategies.is_empty());
    }

    #[test]
    fn test_strategy_entries_keep_params() {
        let cfg = EngineConfig::parse(
            r#"
            [[venues]]
            name = "alpha"
            fee_rate = 0.0005

            [[venues.quotes]]
            symbol = "BTCUSDT"
            bid = 100.0
            ask = 100.1

            [[strategies]]
            type = "simple_arbitrage"
            id = "arb-1"
            max_execution_time_ms = 1000

            [strategies.params]
            buy_venue = "alpha"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.venues[0].quotes.len(), 1);
        let entry = &cfg.strategies[0];
        assert_eq!(entry.kind, "simple_arbitrage");
        assert_eq!(entry.max_execution_time_ms, Some(1000));
        assert_eq!(entry.params["buy_venue"].as_str(), Some("alpha"));
    }

    #[test]
    fn test_log_level_accepts_directives() {
        let cfg = EngineConfig::parse("[engine]\nlog_level = \"warn,aleph_fsm=debug\"\n").unwrap();
        assert_eq!(cfg.engine.log_level, "warn,aleph_fsm=debug");

        let err = EngineConfig::parse("[engine]\nlog_level = \"aleph_fsm=loud\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("log_level")));
    }

    #[test]
    fn test_rejects_duplicate_venues() {
        let err = EngineConfig::parse(
            "[[venues]]\nname = \"a\"\n[[venues]]\nname = \"a\"\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
