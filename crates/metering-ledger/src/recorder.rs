//! Usage recorder
//!
//! Commits consumption as one atomic debit: included allotment first, then
//! packages in drain order, then billed overage. Sources are chosen and
//! debited inside a single ledger transaction for the (tenant, pool), so
//! concurrent debits never oversell capacity and a denied debit changes
//! nothing.

use crate::{
    Clock, Correlation, CostCalculator, LedgerStore, LedgerTransaction, MeteringError,
    PackageDebit, PackagePurchase, PricingCatalog, Reservation, ReservationStatus, Result,
    RetryConfig, RetryPolicy, Tenant, UsageBreakdown, UsageRecord,
};
use metering_core::{LedgerConfig, QuotaPool, TenantId};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Choose the sources that pay for `amount`
///
/// `included_remaining` is what is left of the allotment this period and
/// `packages` are the consumable packages in drain order. Capacity held by
/// other live reservations is unavailable unless overage is allowed.
pub fn plan_debit(
    pool: QuotaPool,
    amount: u64,
    included_remaining: u64,
    packages: &[PackagePurchase],
    overage_allowed: bool,
    reserved_by_others: u64,
) -> Result<UsageBreakdown> {
    let package_capacity: u64 = packages.iter().map(|p| p.remaining()).sum();
    let available = included_remaining
        .saturating_add(package_capacity)
        .saturating_sub(reserved_by_others);
    if !overage_allowed && amount > available {
        return Err(MeteringError::InsufficientQuota {
            pool,
            requested: amount,
            available,
        });
    }

    let included = amount.min(included_remaining);
    let mut residual = amount - included;
    let mut debits = Vec::new();
    for package in packages {
        if residual == 0 {
            break;
        }
        let take = residual.min(package.remaining());
        if take > 0 {
            debits.push(PackageDebit {
                purchase_id: package.id,
                amount: take,
            });
            residual -= take;
        }
    }

    Ok(UsageBreakdown {
        included,
        packages: debits,
        overage: residual,
    })
}

/// Records consumption against the ledger
pub struct UsageRecorder {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PricingCatalog>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    reservation_ttl: chrono::Duration,
    warning_threshold: f64,
}

impl UsageRecorder {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PricingCatalog>,
        clock: Arc<dyn Clock>,
        config: &LedgerConfig,
    ) -> Self {
        let reservation_ttl = chrono::Duration::from_std(config.reservation_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        Self {
            store,
            catalog,
            clock,
            retry: RetryPolicy::new(RetryConfig::from(config)),
            reservation_ttl,
            warning_threshold: config.warning_threshold,
        }
    }

    async fn load_tenant(&self, tenant_id: &TenantId) -> Result<Tenant> {
        self.store
            .tenant(tenant_id)
            .await?
            .ok_or_else(|| MeteringError::TenantNotFound(tenant_id.to_string()))
    }

    /// Consume `amount` units immediately
    ///
    /// A repeated idempotency key returns the record it produced the first
    /// time without debiting again.
    pub async fn consume(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        amount: u64,
        correlation: Correlation,
    ) -> Result<UsageRecord> {
        if amount == 0 {
            return Err(MeteringError::InvalidAmount(
                "consumption amount must be positive".to_string(),
            ));
        }

        let correlation = &correlation;
        self.retry
            .run("consume", || async move {
                let tenant = self.load_tenant(tenant_id).await?;
                let mut tx = self.store.begin(tenant_id, pool).await?;

                if let Some(key) = &correlation.idempotency_key {
                    if let Some(existing) = tx.record_by_idempotency_key(key).await? {
                        if existing.pool != pool || existing.amount != amount {
                            return Err(MeteringError::InvalidState(format!(
                                "idempotency key '{key}' was already used for {} {}",
                                existing.amount, existing.pool
                            )));
                        }
                        debug!(
                            tenant_id = %tenant_id,
                            idempotency_key = %key,
                            record_id = %existing.id,
                            "Replayed consumption"
                        );
                        return Ok(existing);
                    }
                }

                let record = self
                    .debit(tx.as_mut(), &tenant, pool, amount, correlation, None)
                    .await?;
                tx.commit().await?;
                self.log_committed(&tenant, &record);
                Ok(record)
            })
            .await
    }

    /// Hold `estimated` units of capacity for a long-running action
    pub async fn reserve(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        estimated: u64,
        correlation: Correlation,
    ) -> Result<Reservation> {
        if estimated == 0 {
            return Err(MeteringError::InvalidAmount(
                "reservation amount must be positive".to_string(),
            ));
        }

        let correlation = &correlation;
        self.retry
            .run("reserve", || async move {
                let tenant = self.load_tenant(tenant_id).await?;
                let now = self.clock.now();
                let plan = self.catalog.plan(tenant.plan_id_at(now))?;
                let period_key = plan.billing_period.key(now);

                let mut tx = self.store.begin(tenant_id, pool).await?;
                let consumed = tx.period_consumed(&period_key).await?;
                let packages = tx.consumable_packages(now).await?;
                let held: u64 = tx
                    .held_reservations(now)
                    .await?
                    .iter()
                    .map(|r| r.amount)
                    .sum();

                plan_debit(
                    pool,
                    estimated,
                    plan.allotment(pool).saturating_sub(consumed),
                    &packages,
                    tenant.overage_allowed(pool),
                    held,
                )?;

                let reservation = Reservation::hold(
                    tenant_id,
                    pool,
                    estimated,
                    correlation.clone(),
                    now,
                    self.reservation_ttl,
                );
                tx.insert_reservation(&reservation).await?;
                tx.commit().await?;

                info!(
                    tenant_id = %tenant_id,
                    pool = %pool,
                    reservation_id = %reservation.id,
                    amount = estimated,
                    expires_at = %reservation.expires_at,
                    "Reserved capacity"
                );
                Ok(reservation)
            })
            .await
    }

    /// Settle a reservation with the actual amount consumed
    ///
    /// Committing an already committed reservation returns its record.
    pub async fn commit(&self, reservation_id: Uuid, actual: u64) -> Result<UsageRecord> {
        if actual == 0 {
            return Err(MeteringError::InvalidAmount(
                "committed amount must be positive; release the reservation instead".to_string(),
            ));
        }

        self.retry
            .run("commit", || async move {
                let held = self
                    .store
                    .reservation(reservation_id)
                    .await?
                    .ok_or(MeteringError::ReservationNotFound(reservation_id))?;
                let tenant = self.load_tenant(&held.tenant_id).await?;
                let mut tx = self.store.begin(&held.tenant_id, held.pool).await?;
                let reservation = tx
                    .reservation(reservation_id)
                    .await?
                    .ok_or(MeteringError::ReservationNotFound(reservation_id))?;

                let now = self.clock.now();
                match reservation.status {
                    ReservationStatus::Committed => {
                        let record_id = reservation.record_id.ok_or_else(|| {
                            MeteringError::Persistence(format!(
                                "committed reservation {reservation_id} has no record"
                            ))
                        })?;
                        return tx.record(record_id).await?.ok_or_else(|| {
                            MeteringError::Persistence(format!(
                                "record {record_id} of reservation {reservation_id} is missing"
                            ))
                        });
                    }
                    ReservationStatus::Released => {
                        return Err(MeteringError::InvalidState(format!(
                            "reservation {reservation_id} was released"
                        )));
                    }
                    ReservationStatus::Expired => {
                        return Err(MeteringError::ReservationExpired(reservation_id));
                    }
                    ReservationStatus::Held if reservation.is_expired(now) => {
                        return Err(MeteringError::ReservationExpired(reservation_id));
                    }
                    ReservationStatus::Held => {}
                }

                if let Some(key) = &reservation.correlation.idempotency_key {
                    if tx.record_by_idempotency_key(key).await?.is_some() {
                        return Err(MeteringError::InvalidState(format!(
                            "idempotency key '{key}' was already used by another consumption"
                        )));
                    }
                }

                let record = self
                    .debit(
                        tx.as_mut(),
                        &tenant,
                        reservation.pool,
                        actual,
                        &reservation.correlation,
                        Some(reservation_id),
                    )
                    .await?;
                tx.close_reservation(
                    reservation_id,
                    ReservationStatus::Committed,
                    Some(record.id),
                    now,
                )
                .await?;
                tx.commit().await?;

                if actual > reservation.amount {
                    debug!(
                        reservation_id = %reservation_id,
                        reserved = reservation.amount,
                        actual,
                        "Committed more than reserved"
                    );
                }
                self.log_committed(&tenant, &record);
                Ok(record)
            })
            .await
    }

    /// Return reserved capacity without consuming it
    ///
    /// Releasing twice is a no-op.
    pub async fn release(&self, reservation_id: Uuid) -> Result<Reservation> {
        self.retry
            .run("release", || async move {
                let held = self
                    .store
                    .reservation(reservation_id)
                    .await?
                    .ok_or(MeteringError::ReservationNotFound(reservation_id))?;
                let mut tx = self.store.begin(&held.tenant_id, held.pool).await?;
                let mut reservation = tx
                    .reservation(reservation_id)
                    .await?
                    .ok_or(MeteringError::ReservationNotFound(reservation_id))?;

                let now = self.clock.now();
                match reservation.status {
                    ReservationStatus::Released => return Ok(reservation),
                    ReservationStatus::Committed => {
                        return Err(MeteringError::InvalidState(format!(
                            "reservation {reservation_id} was already committed"
                        )));
                    }
                    ReservationStatus::Expired => {
                        return Err(MeteringError::ReservationExpired(reservation_id));
                    }
                    ReservationStatus::Held if reservation.is_expired(now) => {
                        return Err(MeteringError::ReservationExpired(reservation_id));
                    }
                    ReservationStatus::Held => {}
                }

                tx.close_reservation(reservation_id, ReservationStatus::Released, None, now)
                    .await?;
                tx.commit().await?;

                reservation.status = ReservationStatus::Released;
                reservation.closed_at = Some(now);
                info!(
                    tenant_id = %reservation.tenant_id,
                    reservation_id = %reservation_id,
                    "Released reservation"
                );
                Ok(reservation)
            })
            .await
    }

    /// Debit sources and append the usage record inside `tx`
    async fn debit(
        &self,
        tx: &mut dyn LedgerTransaction,
        tenant: &Tenant,
        pool: QuotaPool,
        amount: u64,
        correlation: &Correlation,
        reservation_id: Option<Uuid>,
    ) -> Result<UsageRecord> {
        let now = self.clock.now();
        let plan = self.catalog.plan(tenant.plan_id_at(now))?;
        let period_key = plan.billing_period.key(now);

        let consumed = tx.period_consumed(&period_key).await?;
        let packages = tx.consumable_packages(now).await?;
        let reserved_by_others: u64 = tx
            .held_reservations(now)
            .await?
            .iter()
            .filter(|r| Some(r.id) != reservation_id)
            .map(|r| r.amount)
            .sum();

        let allotment = plan.allotment(pool);
        let breakdown = plan_debit(
            pool,
            amount,
            allotment.saturating_sub(consumed),
            &packages,
            tenant.overage_allowed(pool),
            reserved_by_others,
        )?;

        if breakdown.included > 0 {
            tx.debit_counter(&period_key, consumed, breakdown.included)
                .await?;
        }
        for debit in &breakdown.packages {
            let expected = packages
                .iter()
                .find(|p| p.id == debit.purchase_id)
                .map(|p| p.consumed)
                .ok_or_else(|| MeteringError::PackageNotFound(debit.purchase_id.to_string()))?;
            tx.debit_package(debit.purchase_id, expected, debit.amount)
                .await?;
        }

        let calculator = CostCalculator::new(&self.catalog);
        let cost = calculator.cost(plan, pool, &breakdown, &tenant.currency)?;
        let list_cost = calculator.list_cost(correlation.model.as_deref(), pool, amount);

        let record = UsageRecord {
            id: Uuid::new_v4(),
            tenant_id: tenant.id.clone(),
            pool,
            amount,
            breakdown,
            cost,
            list_cost,
            period_key,
            plan_id: plan.id.clone(),
            catalog_version: self.catalog.version().to_string(),
            reservation_id,
            correlation: correlation.clone(),
            recorded_at: now,
        };
        tx.append_record(&record).await?;

        self.check_threshold(tenant, pool, allotment, consumed, record.breakdown.included);
        Ok(record)
    }

    fn check_threshold(
        &self,
        tenant: &Tenant,
        pool: QuotaPool,
        allotment: u64,
        before: u64,
        included: u64,
    ) {
        if allotment == 0 || included == 0 {
            return;
        }
        let threshold = (allotment as f64 * self.warning_threshold).ceil() as u64;
        let after = before + included;
        if before < threshold && after >= threshold {
            warn!(
                tenant_id = %tenant.id,
                pool = %pool,
                used = after,
                allotment,
                "Included quota usage crossed warning threshold"
            );
        }
    }

    fn log_committed(&self, tenant: &Tenant, record: &UsageRecord) {
        info!(
            tenant_id = %tenant.id,
            pool = %record.pool,
            record_id = %record.id,
            amount = record.amount,
            included = record.breakdown.included,
            from_packages = record.breakdown.package_total(),
            overage = record.breakdown.overage,
            cost = %record.cost.base,
            "Recorded usage"
        );
    }
}
