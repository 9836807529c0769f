//! AlephFSM - Core Library
//! Strategy state-machine execution engine for multi-leg trading

// Public modules
pub mod core;
pub mod exchanges;
pub mod execution;
pub mod machine;
pub mod perf;
pub mod registry;
pub mod risk;
pub mod strategies;

// Re-exports
pub use crate::core::{EngineConfig, Error, Exchange, Result, Severity};
pub use machine::{StrategyMachine, StrategyResult, StrategyRunner, StrategyState};
pub use registry::{StrategyDeps, StrategyLaunch, StrategyRegistry};
