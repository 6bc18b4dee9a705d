//! Tenant billing profile
//!
//! The ledger only needs the billing side of a tenant: the plan it is on,
//! which pools may run into billed overage, and the currency costs are
//! reported in.

use crate::{MeteringError, PricingCatalog, Result};
use chrono::{DateTime, Utc};
use metering_core::{Currency, QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Plan change that takes effect at the start of the next billing period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledPlan {
    pub plan_id: String,
    pub effective_at: DateTime<Utc>,
}

/// Tenant entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    /// Active plan
    pub plan_id: String,
    /// Pending plan change, if any
    pub scheduled_plan: Option<ScheduledPlan>,
    /// Pools in which consumption beyond allotment and packages is billed
    pub overage_allowed: BTreeSet<QuotaPool>,
    /// Currency costs are reported in next to the base currency
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: impl Into<TenantId>, plan_id: &str, currency: Currency) -> Self {
        Self {
            id: id.into(),
            plan_id: plan_id.to_string(),
            scheduled_plan: None,
            overage_allowed: BTreeSet::new(),
            currency,
            created_at: Utc::now(),
        }
    }

    /// Allow billed overage for a pool
    pub fn with_overage(mut self, pool: QuotaPool) -> Self {
        self.overage_allowed.insert(pool);
        self
    }

    pub fn overage_allowed(&self, pool: QuotaPool) -> bool {
        self.overage_allowed.contains(&pool)
    }

    /// Plan in force at `now`
    pub fn plan_id_at(&self, now: DateTime<Utc>) -> &str {
        match &self.scheduled_plan {
            Some(scheduled) if now >= scheduled.effective_at => &scheduled.plan_id,
            _ => &self.plan_id,
        }
    }

    /// Fold a scheduled change that has taken effect into `plan_id`
    pub fn settle(&mut self, now: DateTime<Utc>) {
        if let Some(scheduled) = self.scheduled_plan.take() {
            if now >= scheduled.effective_at {
                self.plan_id = scheduled.plan_id;
            } else {
                self.scheduled_plan = Some(scheduled);
            }
        }
    }

    /// Check the tenant against the catalog it will be metered with
    pub fn validate(&self, catalog: &PricingCatalog) -> Result<()> {
        if self.id.as_str().trim().is_empty() {
            return Err(MeteringError::InvalidConfiguration(
                "tenant id must not be empty".to_string(),
            ));
        }
        if catalog.currency(&self.currency).is_none() {
            return Err(MeteringError::InvalidConfiguration(format!(
                "currency {} has no rate in catalog {}",
                self.currency,
                catalog.version()
            )));
        }

        let mut plan_ids = vec![self.plan_id.as_str()];
        if let Some(scheduled) = &self.scheduled_plan {
            plan_ids.push(&scheduled.plan_id);
        }
        for plan_id in plan_ids {
            let plan = catalog.plan(plan_id)?;
            for pool in &self.overage_allowed {
                if plan.overage_price_per_1k(*pool).is_none() {
                    return Err(MeteringError::InvalidConfiguration(format!(
                        "plan '{}' has no overage price for {pool}",
                        plan.id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;
    use chrono::Duration;

    #[test]
    fn test_tenant_overage_flags() {
        let tenant = Tenant::new("acme", "growth", Currency::usd()).with_overage(QuotaPool::AiUnits);

        assert!(tenant.overage_allowed(QuotaPool::AiUnits));
        assert!(!tenant.overage_allowed(QuotaPool::Retrieval));
        assert!(tenant.validate(&sample_catalog()).is_ok());
    }

    #[test]
    fn test_scheduled_plan_takes_effect_later() {
        let now = Utc::now();
        let mut tenant = Tenant::new("acme", "growth", Currency::usd());
        tenant.scheduled_plan = Some(ScheduledPlan {
            plan_id: "free".to_string(),
            effective_at: now + Duration::days(1),
        });

        assert_eq!(tenant.plan_id_at(now), "growth");
        assert_eq!(tenant.plan_id_at(now + Duration::days(2)), "free");

        tenant.settle(now);
        assert!(tenant.scheduled_plan.is_some());
        tenant.settle(now + Duration::days(2));
        assert_eq!(tenant.plan_id, "free");
        assert!(tenant.scheduled_plan.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_references() {
        let catalog = sample_catalog();

        let unknown_plan = Tenant::new("acme", "platinum", Currency::usd());
        assert!(matches!(
            unknown_plan.validate(&catalog),
            Err(MeteringError::PlanNotFound(_))
        ));

        let unpriced = Tenant::new("acme", "free", Currency::usd()).with_overage(QuotaPool::AiUnits);
        assert!(matches!(
            unpriced.validate(&catalog),
            Err(MeteringError::InvalidConfiguration(_))
        ));

        let unknown_currency = Tenant::new("acme", "growth", "EUR".parse().unwrap());
        assert!(unknown_currency.validate(&catalog).is_err());
    }
}
