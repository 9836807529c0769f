//! Strategy registry - create strategy instances by configured name

use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

use crate::core::config::{
    EngineConfig, EngineSettings, FillConfig, MarketDataConfig, RetryConfig, RiskLimits,
    StrategyEntry,
};
use crate::core::{Error, Exchange, Result};
use crate::machine::{ContextSettings, StrategyResult, StrategyRunner};
use crate::strategies::{
    FuturesSpreadStrategy, MarketMakerStrategy, SimpleArbitrageStrategy, SpotFuturesHedgeStrategy,
};

/// Shared collaborators handed to every constructor.
#[derive(Clone)]
pub struct StrategyDeps {
    pub venues: HashMap<String, Arc<dyn Exchange>>,
    pub retry: RetryConfig,
    pub fill: FillConfig,
    pub market_data: MarketDataConfig,
    pub risk: RiskLimits,
    pub transition_sla: Duration,
}

impl StrategyDeps {
    pub fn new(venues: HashMap<String, Arc<dyn Exchange>>) -> Self {
        Self::from_config(&EngineConfig::default(), venues)
    }

    pub fn from_config(config: &EngineConfig, venues: HashMap<String, Arc<dyn Exchange>>) -> Self {
        Self {
            venues,
            retry: config.retry.clone(),
            fill: config.fill.clone(),
            market_data: config.market_data.clone(),
            risk: config.risk.clone(),
            transition_sla: Duration::from_micros(config.engine.transition_sla_us),
        }
    }

    pub fn with_venue(mut self, venue: Arc<dyn Exchange>) -> Self {
        self.venues.insert(venue.name().to_string(), venue);
        self
    }

    pub fn venue(&self, name: &str) -> Result<Arc<dyn Exchange>> {
        self.venues
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown venue '{name}'")))
    }
}

/// Per-instance launch parameters.
#[derive(Debug, Clone)]
pub struct StrategyLaunch {
    pub strategy_id: String,
    pub params: toml::Table,
    pub max_execution_time: Duration,
    pub max_error_count: u32,
}

impl StrategyLaunch {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        let engine = EngineSettings::default();
        Self {
            strategy_id: strategy_id.into(),
            params: toml::Table::new(),
            max_execution_time: Duration::from_millis(engine.max_execution_time_ms),
            max_error_count: engine.max_error_count,
        }
    }

    pub fn from_entry(entry: &StrategyEntry, engine: &EngineSettings) -> Self {
        let strategy_id = entry
            .id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", entry.kind, &uuid::Uuid::new_v4().simple().to_string()[..8]));
        Self {
            strategy_id,
            params: entry.params.clone(),
            max_execution_time: Duration::from_millis(
                entry.max_execution_time_ms.unwrap_or(engine.max_execution_time_ms),
            ),
            max_error_count: entry.max_error_count.unwrap_or(engine.max_error_count),
        }
    }

    pub fn with_params(mut self, params: toml::Table) -> Self {
        self.params = params;
        self
    }

    pub fn with_max_execution_time(mut self, max: Duration) -> Self {
        self.max_execution_time = max;
        self
    }

    pub fn with_max_error_count(mut self, max: u32) -> Self {
        self.max_error_count = max;
        self
    }

    /// Deserialize the params table into a strategy config.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.params.clone())
            .try_into()
            .map_err(|e| Error::Config(format!("{}: {}", self.strategy_id, e)))
    }

    pub fn context_settings(&self, transition_sla: Duration) -> ContextSettings {
        ContextSettings {
            strategy_id: self.strategy_id.clone(),
            max_execution_time: self.max_execution_time,
            max_error_count: self.max_error_count,
            transition_sla,
        }
    }
}

pub type StrategyConstructor =
    dyn Fn(StrategyLaunch, &StrategyDeps) -> Result<Box<dyn StrategyRunner>> + Send + Sync;

/// Name -> constructor table. Passed explicitly to whoever launches strategies.
pub struct StrategyRegistry {
    constructors: BTreeMap<String, Arc<StrategyConstructor>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with the four built-in strategies.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("spot_futures_hedge", |launch, deps| {
            Ok(Box::new(SpotFuturesHedgeStrategy::create(launch, deps)?) as Box<dyn StrategyRunner>)
        });
        registry.register("futures_spread", |launch, deps| {
            Ok(Box::new(FuturesSpreadStrategy::create(launch, deps)?) as Box<dyn StrategyRunner>)
        });
        registry.register("market_maker", |launch, deps| {
            Ok(Box::new(MarketMakerStrategy::create(launch, deps)?) as Box<dyn StrategyRunner>)
        });
        registry.register("simple_arbitrage", |launch, deps| {
            Ok(Box::new(SimpleArbitrageStrategy::create(launch, deps)?) as Box<dyn StrategyRunner>)
        });
        registry
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StrategyLaunch, &StrategyDeps) -> Result<Box<dyn StrategyRunner>> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(
        &self,
        name: &str,
        launch: StrategyLaunch,
        deps: &StrategyDeps,
    ) -> Result<Box<dyn StrategyRunner>> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| Error::Config(format!("unregistered strategy type '{name}'")))?;
        constructor(launch, deps)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Await every spawned run in order.
///
/// A run that returns an error or panics is logged and counted in the
/// second value; the remaining runs are still collected.
pub async fn collect_results(handles: Vec<JoinHandle<Result<StrategyResult>>>) -> (Vec<StrategyResult>, usize) {
    let mut results = Vec::with_capacity(handles.len());
    let mut lost = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(e)) => {
                error!("❌ strategy returned no result: {}", e);
                lost += 1;
            }
            Err(e) => {
                error!("❌ strategy task panicked: {}", e);
                lost += 1;
            }
        }
    }
    (results, lost)
}
