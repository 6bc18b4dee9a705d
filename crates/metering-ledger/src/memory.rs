//! In-memory ledger store
//!
//! Backs tests and single-process deployments. Debits against one
//! (tenant, pool) are serialized by an async mutex; the writes of a
//! transaction are staged and applied under the state lock at commit.

use crate::{
    drain_order, LedgerStore, LedgerTransaction, MeteringError, PackagePurchase, PackageStatus,
    PeriodCounter, RecordQuery, Reservation, ReservationStatus, Result, Tenant, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metering_core::{PeriodKey, QuotaPool, TenantId};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

type CounterKey = (TenantId, QuotaPool, PeriodKey);

#[derive(Debug, Default)]
struct LedgerState {
    tenants: BTreeMap<TenantId, Tenant>,
    counters: BTreeMap<CounterKey, PeriodCounter>,
    packages: BTreeMap<Uuid, PackagePurchase>,
    records: Vec<UsageRecord>,
    record_index: HashMap<Uuid, usize>,
    idempotency: HashMap<(TenantId, String), usize>,
    reservations: BTreeMap<Uuid, Reservation>,
}

impl LedgerState {
    fn counter(&self, tenant_id: &TenantId, pool: QuotaPool, period_key: &PeriodKey) -> u64 {
        self.counters
            .get(&(tenant_id.clone(), pool, period_key.clone()))
            .map_or(0, |c| c.consumed)
    }

    fn record_by_key(&self, tenant_id: &TenantId, key: &str) -> Option<&UsageRecord> {
        self.idempotency
            .get(&(tenant_id.clone(), key.to_string()))
            .and_then(|index| self.records.get(*index))
    }

    fn push_record(&mut self, record: UsageRecord) {
        let index = self.records.len();
        self.record_index.insert(record.id, index);
        if let Some(key) = &record.correlation.idempotency_key {
            self.idempotency
                .insert((record.tenant_id.clone(), key.clone()), index);
        }
        self.records.push(record);
    }
}

/// Point-in-time copy of the whole ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub tenants: Vec<Tenant>,
    pub counters: Vec<PeriodCounter>,
    pub packages: Vec<PackagePurchase>,
    pub records: Vec<UsageRecord>,
    pub reservations: Vec<Reservation>,
}

pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
    locks: DashMap<(TenantId, QuotaPool), Arc<Mutex<()>>>,
    lock_timeout: Duration,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            locks: DashMap::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// How long `begin` waits for a busy (tenant, pool)
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read();
        LedgerSnapshot {
            tenants: state.tenants.values().cloned().collect(),
            counters: state.counters.values().cloned().collect(),
            packages: state.packages.values().cloned().collect(),
            records: state.records.clone(),
            reservations: state.reservations.values().cloned().collect(),
        }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.state
            .write()
            .tenants
            .insert(tenant.id.clone(), tenant.clone());
        Ok(())
    }

    async fn tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.state.read().tenants.get(tenant_id).cloned())
    }

    async fn tenant_ids(&self) -> Result<Vec<TenantId>> {
        Ok(self.state.read().tenants.keys().cloned().collect())
    }

    async fn period_consumed(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        period_key: &PeriodKey,
    ) -> Result<u64> {
        Ok(self.state.read().counter(tenant_id, pool, period_key))
    }

    async fn counters(&self, tenant_id: &TenantId) -> Result<Vec<PeriodCounter>> {
        Ok(self
            .state
            .read()
            .counters
            .values()
            .filter(|c| &c.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn insert_package(&self, purchase: &PackagePurchase) -> Result<()> {
        let mut state = self.state.write();
        if state.packages.contains_key(&purchase.id) {
            return Err(MeteringError::ConcurrencyConflict(format!(
                "purchase {} already exists",
                purchase.id
            )));
        }
        state.packages.insert(purchase.id, purchase.clone());
        Ok(())
    }

    async fn package(&self, purchase_id: Uuid) -> Result<Option<PackagePurchase>> {
        Ok(self.state.read().packages.get(&purchase_id).cloned())
    }

    async fn packages(
        &self,
        tenant_id: &TenantId,
        pool: Option<QuotaPool>,
    ) -> Result<Vec<PackagePurchase>> {
        Ok(self
            .state
            .read()
            .packages
            .values()
            .filter(|p| &p.tenant_id == tenant_id && pool.map_or(true, |pool| p.pool == pool))
            .cloned()
            .collect())
    }

    async fn activate_package(
        &self,
        purchase_id: Uuid,
        payment_ref: &str,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>> {
        let mut state = self.state.write();
        match state.packages.get_mut(&purchase_id) {
            Some(purchase) if purchase.status == PackageStatus::Pending => {
                purchase.status = PackageStatus::Active;
                purchase.activated_at = Some(activated_at);
                purchase.expires_at = Some(expires_at);
                purchase.payment_ref = Some(payment_ref.to_string());
                Ok(Some(purchase.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn cancel_package(
        &self,
        purchase_id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>> {
        let mut state = self.state.write();
        match state.packages.get_mut(&purchase_id) {
            Some(purchase) if purchase.status == PackageStatus::Pending => {
                purchase.status = PackageStatus::Cancelled;
                purchase.cancelled_at = Some(cancelled_at);
                Ok(Some(purchase.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire_packages(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut state = self.state.write();
        let mut expired = Vec::new();
        for purchase in state.packages.values_mut() {
            if purchase.status == PackageStatus::Active
                && purchase.expires_at.map_or(false, |expires| expires < now)
            {
                purchase.status = PackageStatus::Expired;
                expired.push(purchase.id);
            }
        }
        Ok(expired)
    }

    async fn records(&self, query: &RecordQuery) -> Result<Vec<UsageRecord>> {
        let mut records: Vec<_> = self
            .state
            .read()
            .records
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.recorded_at);
        Ok(records)
    }

    async fn record(&self, record_id: Uuid) -> Result<Option<UsageRecord>> {
        let state = self.state.read();
        Ok(state
            .record_index
            .get(&record_id)
            .and_then(|index| state.records.get(*index))
            .cloned())
    }

    async fn record_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<UsageRecord>> {
        Ok(self.state.read().record_by_key(tenant_id, key).cloned())
    }

    async fn reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        Ok(self.state.read().reservations.get(&reservation_id).cloned())
    }

    async fn held_reservations(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        Ok(self
            .state
            .read()
            .reservations
            .values()
            .filter(|r| &r.tenant_id == tenant_id && r.pool == pool && r.is_live(now))
            .cloned()
            .collect())
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut state = self.state.write();
        let mut expired = Vec::new();
        for reservation in state.reservations.values_mut() {
            if reservation.status == ReservationStatus::Held && reservation.expires_at < now {
                reservation.status = ReservationStatus::Expired;
                reservation.closed_at = Some(now);
                expired.push(reservation.id);
            }
        }
        Ok(expired)
    }

    async fn begin(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
    ) -> Result<Box<dyn LedgerTransaction>> {
        let lock = self
            .locks
            .entry((tenant_id.clone(), pool))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = tokio::time::timeout(self.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                MeteringError::ConcurrencyConflict(format!(
                    "timed out waiting for {tenant_id}/{pool} debit lock"
                ))
            })?;

        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            tenant_id: tenant_id.clone(),
            pool,
            counters: BTreeMap::new(),
            packages: BTreeMap::new(),
            new_reservations: Vec::new(),
            closed_reservations: BTreeMap::new(),
            records: Vec::new(),
            _guard: guard,
        }))
    }
}

/// Staged count: the committed value first read and the new value
#[derive(Debug, Clone, Copy)]
struct Staged {
    read: u64,
    value: u64,
}

#[derive(Debug, Clone)]
struct ReservationClose {
    status: ReservationStatus,
    record_id: Option<Uuid>,
    closed_at: DateTime<Utc>,
}

struct MemoryTransaction {
    state: Arc<RwLock<LedgerState>>,
    tenant_id: TenantId,
    pool: QuotaPool,
    counters: BTreeMap<PeriodKey, Staged>,
    packages: BTreeMap<Uuid, Staged>,
    new_reservations: Vec<Reservation>,
    closed_reservations: BTreeMap<Uuid, ReservationClose>,
    records: Vec<UsageRecord>,
    _guard: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn counter_value(&self, period_key: &PeriodKey) -> u64 {
        match self.counters.get(period_key) {
            Some(staged) => staged.value,
            None => self
                .state
                .read()
                .counter(&self.tenant_id, self.pool, period_key),
        }
    }

    fn owns(&self, tenant_id: &TenantId, pool: QuotaPool) -> bool {
        &self.tenant_id == tenant_id && self.pool == pool
    }

    fn scope_error(&self, what: &str) -> MeteringError {
        MeteringError::InvalidState(format!(
            "{what} is outside the {}/{} transaction",
            self.tenant_id, self.pool
        ))
    }

    fn with_close(&self, mut reservation: Reservation) -> Reservation {
        if let Some(close) = self.closed_reservations.get(&reservation.id) {
            reservation.status = close.status;
            reservation.record_id = close.record_id;
            reservation.closed_at = Some(close.closed_at);
        }
        reservation
    }
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn period_consumed(&mut self, period_key: &PeriodKey) -> Result<u64> {
        Ok(self.counter_value(period_key))
    }

    async fn consumable_packages(&mut self, now: DateTime<Utc>) -> Result<Vec<PackagePurchase>> {
        let mut packages: Vec<_> = {
            let state = self.state.read();
            state
                .packages
                .values()
                .filter(|p| self.owns(&p.tenant_id, p.pool))
                .map(|p| {
                    let mut p = p.clone();
                    if let Some(staged) = self.packages.get(&p.id) {
                        p.consumed = staged.value;
                    }
                    p
                })
                .filter(|p| p.is_consumable(now))
                .collect()
        };
        packages.sort_by(drain_order);
        Ok(packages)
    }

    async fn held_reservations(&mut self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let committed: Vec<_> = {
            let state = self.state.read();
            state
                .reservations
                .values()
                .filter(|r| self.owns(&r.tenant_id, r.pool))
                .cloned()
                .collect()
        };
        Ok(committed
            .into_iter()
            .chain(self.new_reservations.iter().cloned())
            .map(|r| self.with_close(r))
            .filter(|r| r.is_live(now))
            .collect())
    }

    async fn reservation(&mut self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        let staged = self
            .new_reservations
            .iter()
            .find(|r| r.id == reservation_id)
            .cloned();
        let reservation =
            staged.or_else(|| self.state.read().reservations.get(&reservation_id).cloned());
        Ok(reservation.map(|r| self.with_close(r)))
    }

    async fn record(&mut self, record_id: Uuid) -> Result<Option<UsageRecord>> {
        if let Some(record) = self.records.iter().find(|r| r.id == record_id) {
            return Ok(Some(record.clone()));
        }
        let state = self.state.read();
        Ok(state
            .record_index
            .get(&record_id)
            .and_then(|index| state.records.get(*index))
            .cloned())
    }

    async fn record_by_idempotency_key(&mut self, key: &str) -> Result<Option<UsageRecord>> {
        if let Some(record) = self
            .records
            .iter()
            .find(|r| r.correlation.idempotency_key.as_deref() == Some(key))
        {
            return Ok(Some(record.clone()));
        }
        Ok(self
            .state
            .read()
            .record_by_key(&self.tenant_id, key)
            .cloned())
    }

    async fn debit_counter(
        &mut self,
        period_key: &PeriodKey,
        expected: u64,
        amount: u64,
    ) -> Result<u64> {
        let current = self.counter_value(period_key);
        if current != expected {
            return Err(MeteringError::ConcurrencyConflict(format!(
                "counter {period_key} moved from {expected} to {current}"
            )));
        }
        let value = expected
            .checked_add(amount)
            .ok_or_else(|| MeteringError::InvalidAmount(format!("counter {period_key} overflow")))?;
        let read = self.counters.get(period_key).map_or(current, |s| s.read);
        self.counters
            .insert(period_key.clone(), Staged { read, value });
        Ok(value)
    }

    async fn debit_package(&mut self, purchase_id: Uuid, expected: u64, amount: u64) -> Result<u64> {
        let (quantity, committed) = {
            let state = self.state.read();
            let purchase = state
                .packages
                .get(&purchase_id)
                .filter(|p| self.owns(&p.tenant_id, p.pool))
                .ok_or_else(|| MeteringError::PackageNotFound(purchase_id.to_string()))?;
            if purchase.status != PackageStatus::Active {
                return Err(MeteringError::ConcurrencyConflict(format!(
                    "purchase {purchase_id} is {}",
                    purchase.status.as_str()
                )));
            }
            (purchase.quantity, purchase.consumed)
        };

        let staged = self.packages.get(&purchase_id).copied();
        let current = staged.map_or(committed, |s| s.value);
        if current != expected {
            return Err(MeteringError::ConcurrencyConflict(format!(
                "purchase {purchase_id} moved from {expected} to {current}"
            )));
        }
        let value = expected
            .checked_add(amount)
            .filter(|value| *value <= quantity)
            .ok_or_else(|| {
                MeteringError::ConcurrencyConflict(format!(
                    "purchase {purchase_id} cannot cover {amount} more units"
                ))
            })?;
        let read = staged.map_or(committed, |s| s.read);
        self.packages.insert(purchase_id, Staged { read, value });
        Ok(value)
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        if !self.owns(&reservation.tenant_id, reservation.pool) {
            return Err(self.scope_error("reservation"));
        }
        self.new_reservations.push(reservation.clone());
        Ok(())
    }

    async fn close_reservation(
        &mut self,
        reservation_id: Uuid,
        status: ReservationStatus,
        record_id: Option<Uuid>,
        closed_at: DateTime<Utc>,
    ) -> Result<()> {
        let reservation = self
            .reservation(reservation_id)
            .await?
            .ok_or(MeteringError::ReservationNotFound(reservation_id))?;
        if !self.owns(&reservation.tenant_id, reservation.pool) {
            return Err(self.scope_error("reservation"));
        }
        if reservation.status != ReservationStatus::Held {
            return Err(MeteringError::InvalidState(format!(
                "reservation {reservation_id} is {}",
                reservation.status.as_str()
            )));
        }
        self.closed_reservations.insert(
            reservation_id,
            ReservationClose {
                status,
                record_id,
                closed_at,
            },
        );
        Ok(())
    }

    async fn append_record(&mut self, record: &UsageRecord) -> Result<()> {
        if !self.owns(&record.tenant_id, record.pool) {
            return Err(self.scope_error("usage record"));
        }
        if let Some(key) = &record.correlation.idempotency_key {
            if self.record_by_idempotency_key(key).await?.is_some() {
                return Err(MeteringError::ConcurrencyConflict(format!(
                    "idempotency key '{key}' already recorded"
                )));
            }
        }
        self.records.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = *self;
        let mut state = tx.state.write();

        for (period_key, staged) in &tx.counters {
            let current = state.counter(&tx.tenant_id, tx.pool, period_key);
            if current != staged.read {
                return Err(MeteringError::ConcurrencyConflict(format!(
                    "counter {period_key} changed before commit"
                )));
            }
        }
        for (purchase_id, staged) in &tx.packages {
            let current = state.packages.get(purchase_id).map(|p| p.consumed);
            if current != Some(staged.read) {
                return Err(MeteringError::ConcurrencyConflict(format!(
                    "purchase {purchase_id} changed before commit"
                )));
            }
        }
        for reservation_id in tx.closed_reservations.keys() {
            let committed = state.reservations.get(reservation_id).map(|r| r.status);
            let staged_new = tx.new_reservations.iter().any(|r| &r.id == reservation_id);
            if !staged_new && committed != Some(ReservationStatus::Held) {
                return Err(MeteringError::ConcurrencyConflict(format!(
                    "reservation {reservation_id} changed before commit"
                )));
            }
        }
        for record in &tx.records {
            if let Some(key) = &record.correlation.idempotency_key {
                if state.record_by_key(&tx.tenant_id, key).is_some() {
                    return Err(MeteringError::ConcurrencyConflict(format!(
                        "idempotency key '{key}' already recorded"
                    )));
                }
            }
        }

        let now = Utc::now();
        for (period_key, staged) in &tx.counters {
            state
                .counters
                .entry((tx.tenant_id.clone(), tx.pool, period_key.clone()))
                .and_modify(|c| {
                    c.consumed = staged.value;
                    c.updated_at = now;
                })
                .or_insert_with(|| PeriodCounter {
                    tenant_id: tx.tenant_id.clone(),
                    pool: tx.pool,
                    period_key: period_key.clone(),
                    consumed: staged.value,
                    updated_at: now,
                });
        }
        for (purchase_id, staged) in &tx.packages {
            if let Some(purchase) = state.packages.get_mut(purchase_id) {
                purchase.consumed = staged.value;
            }
        }
        for reservation in &tx.new_reservations {
            state
                .reservations
                .insert(reservation.id, reservation.clone());
        }
        for (reservation_id, close) in &tx.closed_reservations {
            if let Some(reservation) = state.reservations.get_mut(reservation_id) {
                reservation.status = close.status;
                reservation.record_id = close.record_id;
                reservation.closed_at = Some(close.closed_at);
            }
        }
        for record in &tx.records {
            state.push_record(record.clone());
        }

        debug!(
            tenant_id = %tx.tenant_id,
            pool = %tx.pool,
            records = tx.records.len(),
            "Committed ledger transaction"
        );
        Ok(())
    }
}
