//! Core module - Common types, traits, and error handling

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, ExchangeError, Result, Severity};
pub use traits::{Exchange, ExchangeResult};
pub use types::*;
