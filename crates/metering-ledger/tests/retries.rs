//! Transient store failures are retried behind every service operation.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{catalog, start_time};
use metering_core::LedgerConfig;
use metering_ledger::{
    AccessReason, Correlation, Currency, InMemoryLedgerStore, LedgerStore, LedgerTransaction,
    ManualClock, MeteringError, MeteringService, PackagePurchase, PeriodCounter, PeriodKey,
    QuotaPool, RecordQuery, Reservation, Result, Tenant, TenantId, UsageRecord,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// In-memory store whose next `outages` calls fail as unavailable
struct FlakyStore {
    inner: InMemoryLedgerStore,
    outages: AtomicU32,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryLedgerStore::new(),
            outages: AtomicU32::new(0),
        }
    }

    fn fail_next(&self, calls: u32) {
        self.outages.store(calls, Ordering::SeqCst);
    }

    fn remaining_outages(&self) -> u32 {
        self.outages.load(Ordering::SeqCst)
    }

    fn trip(&self) -> Result<()> {
        let tripped = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(MeteringError::Unavailable("connection pool timed out".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn put_tenant(&self, tenant: &Tenant) -> Result<()> {
        self.trip()?;
        self.inner.put_tenant(tenant).await
    }

    async fn tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>> {
        self.trip()?;
        self.inner.tenant(tenant_id).await
    }

    async fn tenant_ids(&self) -> Result<Vec<TenantId>> {
        self.trip()?;
        self.inner.tenant_ids().await
    }

    async fn period_consumed(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        period_key: &PeriodKey,
    ) -> Result<u64> {
        self.trip()?;
        self.inner.period_consumed(tenant_id, pool, period_key).await
    }

    async fn counters(&self, tenant_id: &TenantId) -> Result<Vec<PeriodCounter>> {
        self.trip()?;
        self.inner.counters(tenant_id).await
    }

    async fn insert_package(&self, purchase: &PackagePurchase) -> Result<()> {
        self.trip()?;
        self.inner.insert_package(purchase).await
    }

    async fn package(&self, purchase_id: Uuid) -> Result<Option<PackagePurchase>> {
        self.trip()?;
        self.inner.package(purchase_id).await
    }

    async fn packages(
        &self,
        tenant_id: &TenantId,
        pool: Option<QuotaPool>,
    ) -> Result<Vec<PackagePurchase>> {
        self.trip()?;
        self.inner.packages(tenant_id, pool).await
    }

    async fn activate_package(
        &self,
        purchase_id: Uuid,
        payment_ref: &str,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>> {
        self.trip()?;
        self.inner
            .activate_package(purchase_id, payment_ref, activated_at, expires_at)
            .await
    }

    async fn cancel_package(
        &self,
        purchase_id: Uuid,
        cancelled_at: DateTime<Utc>,
    ) -> Result<Option<PackagePurchase>> {
        self.trip()?;
        self.inner.cancel_package(purchase_id, cancelled_at).await
    }

    async fn expire_packages(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.trip()?;
        self.inner.expire_packages(now).await
    }

    async fn records(&self, query: &RecordQuery) -> Result<Vec<UsageRecord>> {
        self.trip()?;
        self.inner.records(query).await
    }

    async fn record(&self, record_id: Uuid) -> Result<Option<UsageRecord>> {
        self.trip()?;
        self.inner.record(record_id).await
    }

    async fn record_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<UsageRecord>> {
        self.trip()?;
        self.inner.record_by_idempotency_key(tenant_id, key).await
    }

    async fn reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        self.trip()?;
        self.inner.reservation(reservation_id).await
    }

    async fn held_reservations(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        self.trip()?;
        self.inner.held_reservations(tenant_id, pool, now).await
    }

    async fn expire_reservations(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.trip()?;
        self.inner.expire_reservations(now).await
    }

    async fn begin(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
    ) -> Result<Box<dyn LedgerTransaction>> {
        self.trip()?;
        self.inner.begin(tenant_id, pool).await
    }
}

fn service(store: Arc<FlakyStore>, max_retries: u32) -> MeteringService {
    MeteringService::with_clock(
        store as Arc<dyn LedgerStore>,
        Arc::new(catalog()),
        &LedgerConfig::default().with_max_retries(max_retries),
        Arc::new(ManualClock::new(start_time())),
    )
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = Arc::new(FlakyStore::new());
    let service = service(store.clone(), 5);

    store.fail_next(2);
    let tenant = service
        .register_tenant(Tenant::new("acme", "growth", Currency::usd()))
        .await
        .unwrap()
        .id;

    store.fail_next(3);
    let decision = service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert_eq!(decision.reason, AccessReason::IncludedQuota);
    assert_eq!(store.remaining_outages(), 0);

    store.fail_next(3);
    let pending = service
        .purchase_package(&tenant, QuotaPool::AiUnits, "ai-100")
        .await
        .unwrap();

    store.fail_next(3);
    let active = service.confirm_payment(pending.id, "pay-1").await.unwrap();
    assert!(active.expires_at.is_some());

    store.fail_next(3);
    service
        .consume(&tenant, QuotaPool::AiUnits, 1050, Correlation::new())
        .await
        .unwrap();

    store.fail_next(3);
    let summary = service.usage_summary(&tenant, None).await.unwrap();
    assert_eq!(summary.pools[0].included_used, 1000);
    assert_eq!(summary.pools[0].package_used, 50);

    store.fail_next(3);
    assert_eq!(service.daily_usage(&tenant, 1).await.unwrap().len(), 1);

    store.fail_next(3);
    assert!(service.reconcile_tenant(&tenant).await.unwrap().is_consistent());
}

#[tokio::test]
async fn test_outage_longer_than_retries_surfaces() {
    let store = Arc::new(FlakyStore::new());
    let service = service(store.clone(), 1);
    let tenant = service
        .register_tenant(Tenant::new("acme", "growth", Currency::usd()))
        .await
        .unwrap()
        .id;

    store.fail_next(5);
    let err = service
        .check_access(&tenant, QuotaPool::AiUnits)
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::Unavailable(_)));
    assert_eq!(store.remaining_outages(), 3);
}

#[tokio::test]
async fn test_business_errors_are_not_retried() {
    let store = Arc::new(FlakyStore::new());
    let service = service(store.clone(), 5);

    let err = service
        .purchase_package(&TenantId::new("ghost"), QuotaPool::AiUnits, "ai-100")
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::TenantNotFound(_)));

    let err = service.cancel_purchase(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, MeteringError::PackageNotFound(_)));
}
