//! Shared fixtures for the ledger integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use metering_core::LedgerConfig;
use metering_ledger::{
    Currency, InMemoryLedgerStore, LedgerStore, ManualClock, MeteringService, PackagePurchase,
    PricingCatalog, QuotaPool, Tenant, TenantId,
};
use std::sync::Arc;

pub const CATALOG: &str = r#"
version = "test-2026-10"
base_currency = "USD"

[currencies.USD]
rate = "1"
decimals = 2

[currencies.KRW]
rate = "1350"
decimals = 0

[pools.ai_units]
package_validity_days = 30

[pools.image]
package_validity_days = 90

[[plans]]
id = "growth"
billing_period = "monthly"
allotments = { ai_units = 1000, retrieval = 500 }
overage_price_per_1k = { ai_units = "10.00", retrieval = "2.50" }

[[plans]]
id = "starter"
billing_period = "monthly"
allotments = { ai_units = 200 }
overage_price_per_1k = { ai_units = "12.00" }

[[plans]]
id = "payg"
billing_period = "monthly"
overage_price_per_1k = { ai_units = "15.00" }

[[packages]]
id = "ai-70"
pool = "ai_units"
quantity = 70
price = "3.50"
validity_days = 3

[[packages]]
id = "ai-100"
pool = "ai_units"
quantity = 100
price = "5.00"

[[packages]]
id = "ai-100-5d"
pool = "ai_units"
quantity = 100
price = "4.00"
validity_days = 5

[[packages]]
id = "ai-100-10d"
pool = "ai_units"
quantity = 100
price = "4.50"
validity_days = 10

[[packages]]
id = "image-50"
pool = "image"
quantity = 50
price = "12.00"

[[models]]
id = "gpt-4o"
pool = "ai_units"
unit_cost_per_1k = "0.005"
"#;

pub fn catalog() -> PricingCatalog {
    PricingCatalog::from_toml_str(CATALOG).expect("test catalog is valid")
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap()
}

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

/// Service over an in-memory store and a manual clock
pub struct Harness {
    pub service: Arc<MeteringService>,
    pub store: Arc<InMemoryLedgerStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let service = Arc::new(MeteringService::with_clock(
            store.clone() as Arc<dyn LedgerStore>,
            Arc::new(catalog()),
            &config,
            clock.clone(),
        ));
        Self {
            service,
            store,
            clock,
        }
    }

    pub async fn tenant(&self, id: &str, plan_id: &str) -> TenantId {
        self.register(Tenant::new(id, plan_id, Currency::usd())).await
    }

    pub async fn tenant_with_overage(&self, id: &str, plan_id: &str) -> TenantId {
        self.register(Tenant::new(id, plan_id, Currency::usd()).with_overage(QuotaPool::AiUnits))
            .await
    }

    pub async fn register(&self, tenant: Tenant) -> TenantId {
        self.service
            .register_tenant(tenant)
            .await
            .expect("tenant registers")
            .id
    }

    /// Purchase and immediately confirm a catalog package
    pub async fn active_package(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        package_id: &str,
    ) -> PackagePurchase {
        let pending = self
            .service
            .purchase_package(tenant_id, pool, package_id)
            .await
            .expect("purchase succeeds");
        self.service
            .confirm_payment(pending.id, &format!("pay-{}", pending.id))
            .await
            .expect("payment confirms")
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn snapshot_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.store.snapshot()).expect("snapshot serializes")
    }
}
