//! Exchange implementations - Pluggable venue adapters

pub mod paper;

pub use paper::{FillMode, Operation, PaperExchange};
