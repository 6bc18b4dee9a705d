//! Core types and configuration shared by the metering ledger and its tools.

pub mod config;
pub mod money;
pub mod period;
pub mod types;

pub use config::*;
pub use money::*;
pub use period::*;
pub use types::*;

use thiserror::Error;

/// Errors raised while parsing or validating core values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown quota pool: {0}")]
    InvalidPool(String),

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Invalid period key: {0}")]
    InvalidPeriodKey(String),

    #[error("Currency mismatch: {0} vs {1}")]
    CurrencyMismatch(String, String),
}
