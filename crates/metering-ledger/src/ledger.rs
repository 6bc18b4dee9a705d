//! Ledger storage
//!
//! [`LedgerStore`] is the durable state of the engine: tenants, period
//! counters, package purchases, reservations and the usage log. Every debit
//! goes through a [`LedgerTransaction`] scoped to one (tenant, pool), which
//! serializes debits against the same capacity and applies all of its
//! writes together or not at all.

use crate::{
    PackagePurchase, RecordQuery, Reservation, ReservationStatus, Result, Tenant, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metering_core::{PeriodKey, QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Included-allotment consumption of one pool in one billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCounter {
    pub tenant_id: TenantId,
    pub pool: QuotaPool,
    pub period_key: PeriodKey,
    pub consumed: u64,
    pub updated_at: DateTime<Utc>,
}

/// Ledger repository trait
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert or replace a tenant
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()>;

    /// Get tenant by ID
    async fn tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>>;

    /// List all tenant IDs
    async fn tenant_ids(&self) -> Result<Vec<TenantId>>;

    /// Included units consumed in a period; zero when no counter exists
    async fn period_consumed(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        period_key: &PeriodKey,
    ) -> Result<u64>;

    /// All period counters of a tenant
    async fn counters(&self, tenant_id: &TenantId) -> Result<Vec<PeriodCounter>>;

    /// Save a new package purchase
    async fn insert_package(&self, purchase: &PackagePurchase) -> Result<()>;

    /// Get package purchase by ID
    async fn package(&self, purchase_id: Uuid) -> Result<Option<PackagePurchase>>;

    /// List a tenant's purchases, optionally for one pool
    async fn packages(
        &self,
        tenant_id: &TenantId,
        pool: Option<QuotaPool>,
    ) -> Result<Vec<PackagePurchase>>;

    /// Move a pending purchase to active
    ///
    /// Returns `None` without writing when the purchase is no longer pending.
    async fn activate_package(
        &self,
        purchase_id: Uuid,
        payment_ref: &str,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>>;

    /// Move a pending purchase to cancelled; `None` when not pending
    async fn cancel_package(
        &self,
        purchase_id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>>;

    /// Mark active packages with `expires_at < now` expired
    async fn expire_packages(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Usage records matching a query, oldest first
    async fn records(&self, query: &RecordQuery) -> Result<Vec<UsageRecord>>;

    /// Get usage record by ID
    async fn record(&self, record_id: Uuid) -> Result<Option<UsageRecord>>;

    /// Get usage record by the tenant's idempotency key
    async fn record_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<UsageRecord>>;

    /// Get reservation by ID
    async fn reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>>;

    /// Reservations still holding capacity at `now`
    async fn held_reservations(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>>;

    /// Mark held reservations with `expires_at < now` expired
    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Open a transaction holding the (tenant, pool) debit lock
    ///
    /// Fails with `ConcurrencyConflict` when the lock cannot be taken in time.
    async fn begin(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
    ) -> Result<Box<dyn LedgerTransaction>>;
}

/// Unit of work against one (tenant, pool)
///
/// Reads see the transaction's own writes. Dropping the transaction without
/// calling [`commit`](LedgerTransaction::commit) discards every write.
#[async_trait]
pub trait LedgerTransaction: Send {
    async fn period_consumed(&mut self, period_key: &PeriodKey) -> Result<u64>;

    /// Active, unexpired packages with remaining units, in drain order
    async fn consumable_packages(&mut self, now: DateTime<Utc>) -> Result<Vec<PackagePurchase>>;

    async fn held_reservations(&mut self, now: DateTime<Utc>) -> Result<Vec<Reservation>>;

    async fn reservation(&mut self, reservation_id: Uuid) -> Result<Option<Reservation>>;

    async fn record(&mut self, record_id: Uuid) -> Result<Option<UsageRecord>>;

    async fn record_by_idempotency_key(&mut self, key: &str) -> Result<Option<UsageRecord>>;

    /// Add `amount` to a period counter that currently reads `expected`
    async fn debit_counter(
        &mut self,
        period_key: &PeriodKey,
        expected: u64,
        amount: u64,
    ) -> Result<u64>;

    /// Consume `amount` from a package whose consumed count reads `expected`
    ///
    /// Fails with `ConcurrencyConflict` when the count moved or the package
    /// can no longer cover the amount.
    async fn debit_package(&mut self, purchase_id: Uuid, expected: u64, amount: u64) -> Result<u64>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()>;

    /// Close a held reservation
    async fn close_reservation(
        &mut self,
        reservation_id: Uuid,
        status: ReservationStatus,
        record_id: Option<Uuid>,
        closed_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn append_record(&mut self, record: &UsageRecord) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
