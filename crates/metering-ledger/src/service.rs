//! Metering service
//!
//! Single entry point for the host application. Wires the access gate,
//! recorder, package inventory, reports and reconciler to one store, one
//! catalog and one clock. Store failures classified as transient are
//! retried here; the recorder retries its own debits.

use crate::{
    AccessDecision, AccessGate, Clock, Correlation, DailyUsage, InMemoryLedgerStore, LedgerStore,
    MeteringError, ModelUsage, PackageInventory, PackagePurchase, PricingCatalog,
    ReconciliationReport, Reconciler, Reservation, Result, ScheduledPlan, SystemClock, Tenant,
    RetryConfig, RetryPolicy, UsageRecord, UsageRecorder, UsageReports, UsageSummary,
};
use chrono::{DateTime, Utc};
use metering_core::{LedgerConfig, PeriodKey, QuotaPool, TenantId};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Result of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub expired_packages: Vec<Uuid>,
    pub expired_reservations: Vec<Uuid>,
}

pub struct MeteringService {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PricingCatalog>,
    clock: Arc<dyn Clock>,
    gate: AccessGate,
    recorder: UsageRecorder,
    inventory: PackageInventory,
    reports: UsageReports,
    reconciler: Reconciler,
    retry: RetryPolicy,
}

impl MeteringService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PricingCatalog>,
        config: &LedgerConfig,
    ) -> Self {
        Self::with_clock(store, catalog, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PricingCatalog>,
        config: &LedgerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gate: AccessGate::new(store.clone(), catalog.clone(), clock.clone()),
            recorder: UsageRecorder::new(store.clone(), catalog.clone(), clock.clone(), config),
            inventory: PackageInventory::new(store.clone(), catalog.clone(), clock.clone()),
            reports: UsageReports::new(store.clone(), catalog.clone(), clock.clone()),
            reconciler: Reconciler::new(store.clone(), catalog.clone()),
            retry: RetryPolicy::new(RetryConfig::from(config)),
            store,
            catalog,
            clock,
        }
    }

    /// In-memory service for tests and local runs
    pub fn in_memory(catalog: PricingCatalog) -> Self {
        Self::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(catalog),
            &LedgerConfig::default(),
        )
    }

    /// Verify older records against a previous catalog version as well
    pub fn with_historical_catalog(mut self, catalog: Arc<PricingCatalog>) -> Self {
        self.reconciler = self.reconciler.with_catalog(catalog);
        self
    }

    pub fn catalog(&self) -> &PricingCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // Tenants

    /// Register a new tenant after checking it against the catalog
    pub async fn register_tenant(&self, tenant: Tenant) -> Result<Tenant> {
        tenant.validate(&self.catalog)?;
        let tenant = &tenant;
        self.retry
            .run("register_tenant", || self.insert_tenant(tenant))
            .await
    }

    async fn insert_tenant(&self, tenant: &Tenant) -> Result<Tenant> {
        if self.store.tenant(&tenant.id).await?.is_some() {
            return Err(MeteringError::InvalidState(format!(
                "tenant {} is already registered",
                tenant.id
            )));
        }
        self.store.put_tenant(tenant).await?;
        info!(tenant_id = %tenant.id, plan_id = %tenant.plan_id, "Registered tenant");
        Ok(tenant.clone())
    }

    pub async fn tenant(&self, tenant_id: &TenantId) -> Result<Tenant> {
        self.retry
            .run("tenant", || self.load_tenant(tenant_id))
            .await
    }

    async fn load_tenant(&self, tenant_id: &TenantId) -> Result<Tenant> {
        self.store
            .tenant(tenant_id)
            .await?
            .ok_or_else(|| MeteringError::TenantNotFound(tenant_id.to_string()))
    }

    /// Switch plans at the start of the next billing period
    ///
    /// Usage already recorded keeps the plan it was recorded under; choosing
    /// the current plan cancels a pending change.
    pub async fn schedule_plan_change(&self, tenant_id: &TenantId, plan_id: &str) -> Result<Tenant> {
        self.retry
            .run("schedule_plan_change", || self.update_plan(tenant_id, plan_id))
            .await
    }

    async fn update_plan(&self, tenant_id: &TenantId, plan_id: &str) -> Result<Tenant> {
        let now = self.clock.now();
        let mut tenant = self.load_tenant(tenant_id).await?;
        tenant.settle(now);
        self.catalog.plan(plan_id)?;

        if tenant.plan_id == plan_id {
            tenant.scheduled_plan = None;
        } else {
            let current = self.catalog.plan(&tenant.plan_id)?;
            tenant.scheduled_plan = Some(ScheduledPlan {
                plan_id: plan_id.to_string(),
                effective_at: current.billing_period.period_end(now),
            });
        }
        tenant.validate(&self.catalog)?;
        self.store.put_tenant(&tenant).await?;

        info!(
            tenant_id = %tenant_id,
            plan_id = %plan_id,
            effective_at = ?tenant.scheduled_plan.as_ref().map(|s| s.effective_at),
            "Scheduled plan change"
        );
        Ok(tenant)
    }

    /// Enable or disable billed overage for one pool
    pub async fn set_overage(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        allowed: bool,
    ) -> Result<Tenant> {
        self.retry
            .run("set_overage", || self.update_overage(tenant_id, pool, allowed))
            .await
    }

    async fn update_overage(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        allowed: bool,
    ) -> Result<Tenant> {
        let mut tenant = self.load_tenant(tenant_id).await?;
        tenant.settle(self.clock.now());
        if allowed {
            tenant.overage_allowed.insert(pool);
        } else {
            tenant.overage_allowed.remove(&pool);
        }
        tenant.validate(&self.catalog)?;
        self.store.put_tenant(&tenant).await?;
        info!(tenant_id = %tenant_id, pool = %pool, allowed, "Updated overage setting");
        Ok(tenant)
    }

    // Metering

    pub async fn check_access(&self, tenant_id: &TenantId, pool: QuotaPool) -> Result<AccessDecision> {
        self.retry
            .run("check_access", || self.gate.check_access(tenant_id, pool))
            .await
    }

    pub async fn consume(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        amount: u64,
        correlation: Correlation,
    ) -> Result<UsageRecord> {
        self.recorder
            .consume(tenant_id, pool, amount, correlation)
            .await
    }

    pub async fn reserve(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        estimated: u64,
        correlation: Correlation,
    ) -> Result<Reservation> {
        self.recorder
            .reserve(tenant_id, pool, estimated, correlation)
            .await
    }

    pub async fn commit(&self, reservation_id: Uuid, actual: u64) -> Result<UsageRecord> {
        self.recorder.commit(reservation_id, actual).await
    }

    pub async fn release(&self, reservation_id: Uuid) -> Result<Reservation> {
        self.recorder.release(reservation_id).await
    }

    pub async fn record_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<UsageRecord>> {
        self.retry
            .run("record_by_idempotency_key", || {
                self.store.record_by_idempotency_key(tenant_id, key)
            })
            .await
    }

    // Packages

    pub async fn purchase_package(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        package_id: &str,
    ) -> Result<PackagePurchase> {
        self.retry
            .run("purchase_package", || {
                self.inventory.purchase(tenant_id, pool, package_id)
            })
            .await
    }

    pub async fn confirm_payment(
        &self,
        purchase_id: Uuid,
        payment_ref: &str,
    ) -> Result<PackagePurchase> {
        self.retry
            .run("confirm_payment", || {
                self.inventory.confirm_payment(purchase_id, payment_ref)
            })
            .await
    }

    pub async fn cancel_purchase(&self, purchase_id: Uuid) -> Result<PackagePurchase> {
        self.retry
            .run("cancel_purchase", || self.inventory.cancel(purchase_id))
            .await
    }

    pub async fn list_active_packages(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
    ) -> Result<Vec<PackagePurchase>> {
        self.retry
            .run("list_active_packages", || self.inventory.list_active(tenant_id, pool))
            .await
    }

    pub async fn list_purchases(&self, tenant_id: &TenantId) -> Result<Vec<PackagePurchase>> {
        self.retry
            .run("list_purchases", || self.inventory.list_purchases(tenant_id))
            .await
    }

    // Maintenance

    pub async fn expire_packages(&self) -> Result<Vec<Uuid>> {
        self.retry
            .run("expire_packages", || self.inventory.expire_due())
            .await
    }

    pub async fn expire_reservations(&self) -> Result<Vec<Uuid>> {
        let now = self.clock.now();
        let expired = self
            .retry
            .run("expire_reservations", || self.store.expire_reservations(now))
            .await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired lapsed reservations");
        }
        Ok(expired)
    }

    /// Run both expiry sweeps
    pub async fn sweep(&self) -> Result<SweepReport> {
        Ok(SweepReport {
            expired_packages: self.expire_packages().await?,
            expired_reservations: self.expire_reservations().await?,
        })
    }

    pub async fn reconcile_tenant(&self, tenant_id: &TenantId) -> Result<ReconciliationReport> {
        self.retry
            .run("reconcile_tenant", || self.reconciler.reconcile_tenant(tenant_id))
            .await
    }

    pub async fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>> {
        self.retry
            .run("reconcile_all", || self.reconciler.reconcile_all())
            .await
    }

    // Reports

    pub async fn usage_summary(
        &self,
        tenant_id: &TenantId,
        period_key: Option<PeriodKey>,
    ) -> Result<UsageSummary> {
        self.retry
            .run("usage_summary", || {
                self.reports.usage_summary(tenant_id, period_key.clone())
            })
            .await
    }

    pub async fn daily_usage(&self, tenant_id: &TenantId, days: u32) -> Result<Vec<DailyUsage>> {
        self.retry
            .run("daily_usage", || self.reports.daily_usage(tenant_id, days))
            .await
    }

    pub async fn usage_by_model(
        &self,
        tenant_id: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ModelUsage>> {
        self.retry
            .run("usage_by_model", || self.reports.usage_by_model(tenant_id, from, to))
            .await
    }
}
