//! Usage reports
//!
//! Read-only views aggregated from the usage log.

use crate::{Clock, Cost, LedgerStore, MeteringError, PricingCatalog, RecordQuery, Result, Tenant};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use metering_core::{Money, PeriodKey, QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Label for records without a model
pub const UNATTRIBUTED_MODEL: &str = "unattributed";

/// One pool within a period summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub pool: QuotaPool,
    pub allotment: u64,
    pub included_used: u64,
    pub included_remaining: u64,
    pub package_used: u64,
    /// Units left in packages consumable now
    pub packages_remaining: u64,
    pub overage: u64,
    pub overage_cost: Cost,
}

impl PoolUsage {
    pub fn total_used(&self) -> u64 {
        self.included_used + self.package_used + self.overage
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub tenant_id: TenantId,
    pub period_key: PeriodKey,
    pub plan_id: String,
    pub pools: Vec<PoolUsage>,
    pub total_cost: Cost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub pool: QuotaPool,
    pub amount: u64,
    pub overage: u64,
    pub cost: Cost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: u64,
    pub amount: u64,
    pub cost: Cost,
    /// Sum of list prices of priced records
    pub list_cost: Money,
}

pub struct UsageReports {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PricingCatalog>,
    clock: Arc<dyn Clock>,
}

impl UsageReports {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PricingCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    async fn load_tenant(&self, tenant_id: &TenantId) -> Result<Tenant> {
        self.store
            .tenant(tenant_id)
            .await?
            .ok_or_else(|| MeteringError::TenantNotFound(tenant_id.to_string()))
    }

    fn zero_cost(&self, tenant: &Tenant) -> Cost {
        Cost::zero(self.catalog.base_currency().clone(), tenant.currency.clone())
    }

    /// Per-pool usage of one billing period; the current period when `None`
    pub async fn usage_summary(
        &self,
        tenant_id: &TenantId,
        period_key: Option<PeriodKey>,
    ) -> Result<UsageSummary> {
        let tenant = self.load_tenant(tenant_id).await?;
        let now = self.clock.now();
        let period_key = match period_key {
            Some(key) => key,
            None => self
                .catalog
                .plan(tenant.plan_id_at(now))?
                .billing_period
                .key(now),
        };

        let records = self
            .store
            .records(&RecordQuery::tenant(tenant_id).with_period(period_key.clone()))
            .await?;
        // The plan a period was metered under is the one on its records
        let plan_id = records
            .last()
            .map(|r| r.plan_id.clone())
            .unwrap_or_else(|| tenant.plan_id_at(now).to_string());
        let plan = self.catalog.plan(&plan_id).ok();

        let mut pools = Vec::with_capacity(QuotaPool::ALL.len());
        let mut total_cost = self.zero_cost(&tenant);
        for pool in QuotaPool::ALL {
            let allotment = plan.map_or(0, |p| p.allotment(pool));
            let included_used = self
                .store
                .period_consumed(tenant_id, pool, &period_key)
                .await?;
            let packages_remaining: u64 = self
                .store
                .packages(tenant_id, Some(pool))
                .await?
                .iter()
                .map(|p| p.available(now))
                .sum();

            let mut package_used = 0;
            let mut overage = 0;
            let mut overage_cost = self.zero_cost(&tenant);
            for record in records.iter().filter(|r| r.pool == pool) {
                package_used += record.breakdown.package_total();
                overage += record.breakdown.overage;
                overage_cost = overage_cost.checked_add(&record.cost)?;
            }
            total_cost = total_cost.checked_add(&overage_cost)?;

            pools.push(PoolUsage {
                pool,
                allotment,
                included_used,
                included_remaining: allotment.saturating_sub(included_used),
                package_used,
                packages_remaining,
                overage,
                overage_cost,
            });
        }

        Ok(UsageSummary {
            tenant_id: tenant_id.clone(),
            period_key,
            plan_id,
            pools,
            total_cost,
        })
    }

    /// Usage per UTC day and pool over the last `days` days, today included
    pub async fn daily_usage(&self, tenant_id: &TenantId, days: u32) -> Result<Vec<DailyUsage>> {
        let tenant = self.load_tenant(tenant_id).await?;
        if days == 0 {
            return Ok(Vec::new());
        }

        let today = self.clock.now().date_naive();
        let mut query = RecordQuery::tenant(tenant_id);
        // A window reaching past the Unix epoch is open at the start
        query.from = today
            .checked_sub_signed(Duration::days(i64::from(days) - 1))
            .and_then(|first| first.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc())
            .filter(|from| *from >= DateTime::<Utc>::UNIX_EPOCH);
        query.to = today
            .checked_add_signed(Duration::days(1))
            .and_then(|next| next.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc());

        let records = self.store.records(&query).await?;

        let mut buckets: BTreeMap<(NaiveDate, QuotaPool), DailyUsage> = BTreeMap::new();
        for record in &records {
            let date = record.recorded_at.date_naive();
            let entry = buckets.entry((date, record.pool)).or_insert_with(|| DailyUsage {
                date,
                pool: record.pool,
                amount: 0,
                overage: 0,
                cost: self.zero_cost(&tenant),
            });
            entry.amount += record.amount;
            entry.overage += record.breakdown.overage;
            entry.cost = entry.cost.checked_add(&record.cost)?;
        }

        Ok(buckets.into_values().collect())
    }

    /// Usage per model between `from` (inclusive) and `to` (exclusive)
    pub async fn usage_by_model(
        &self,
        tenant_id: &TenantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ModelUsage>> {
        let tenant = self.load_tenant(tenant_id).await?;
        let records = self
            .store
            .records(&RecordQuery::tenant(tenant_id).between(from, to))
            .await?;

        let mut models: BTreeMap<String, ModelUsage> = BTreeMap::new();
        for record in &records {
            let model = record.model().unwrap_or(UNATTRIBUTED_MODEL).to_string();
            let entry = models.entry(model.clone()).or_insert_with(|| ModelUsage {
                model,
                requests: 0,
                amount: 0,
                cost: self.zero_cost(&tenant),
                list_cost: Money::zero(self.catalog.base_currency().clone()),
            });
            entry.requests += 1;
            entry.amount += record.amount;
            entry.cost = entry.cost.checked_add(&record.cost)?;
            if let Some(list_cost) = &record.list_cost {
                entry.list_cost = entry.list_cost.checked_add(list_cost)?;
            }
        }

        let mut usage: Vec<_> = models.into_values().collect();
        usage.sort_by(|a, b| b.amount.cmp(&a.amount).then_with(|| a.model.cmp(&b.model)));
        Ok(usage)
    }
}
