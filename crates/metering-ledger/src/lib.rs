//! Usage metering and quota ledger for tenants
//!
//! This crate decides, for every metered action a tenant attempts, whether it
//! is allowed and which source pays for it:
//! - the plan's included allotment for the current billing period
//! - purchased packages, drained closest-to-expiry first
//! - billed overage, when the tenant has it enabled
//!
//! Consumption is committed by the [`UsageRecorder`] as one atomic debit and
//! appended to an immutable usage log. Every counter can be re-derived from
//! that log (see [`Reconciler`]).

pub mod catalog;
pub mod clock;
pub mod cost;
pub mod gate;
pub mod ledger;
pub mod memory;
pub mod metering;
pub mod packages;
pub mod postgres;
pub mod reconcile;
pub mod recorder;
pub mod reports;
pub mod reservation;
pub mod retry;
pub mod service;
pub mod tenant;

pub use catalog::*;
pub use clock::*;
pub use cost::*;
pub use gate::*;
pub use ledger::*;
pub use memory::*;
pub use metering::*;
pub use packages::*;
pub use postgres::*;
pub use reconcile::*;
pub use recorder::*;
pub use reports::*;
pub use reservation::*;
pub use retry::*;
pub use service::*;
pub use tenant::*;

pub use metering_core::{
    BillingPeriod, Currency, Money, PeriodKey, QuotaPool, TenantId,
};

use metering_core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Metering errors
#[derive(Error, Debug)]
pub enum MeteringError {
    #[error("Insufficient {pool} quota: requested {requested}, available {available}")]
    InsufficientQuota {
        pool: QuotaPool,
        requested: u64,
        available: u64,
    },

    #[error("Invalid quota pool: {0}")]
    InvalidPool(String),

    #[error("Package not found: {0}")]
    PackageNotFound(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    #[error("Reservation expired: {0}")]
    ReservationExpired(Uuid),

    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid pricing catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Persistence failure: {0}")]
    Persistence(String),
}

impl MeteringError {
    /// Transient failures that are safe to retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_) | Self::Unavailable(_))
    }
}

impl From<CoreError> for MeteringError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidPool(pool) => Self::InvalidPool(pool),
            other => Self::InvalidConfiguration(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeteringError>;
