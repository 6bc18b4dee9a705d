//! Access gate
//!
//! Cheap pre-flight check before a metered action. It reads without taking
//! the debit lock, so a positive answer is advisory: the authoritative
//! check is the debit itself.

use crate::{Clock, LedgerStore, PricingCatalog, Result};
use metering_core::{PeriodKey, QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Why access was granted or denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    /// The next unit comes from the plan allotment
    IncludedQuota,
    /// The allotment is used up; packages cover the next unit
    PackageQuota,
    /// Nothing is left but overage is billed
    Overage,
    QuotaExhausted,
    UnknownTenant,
}

impl AccessReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncludedQuota => "included_quota",
            Self::PackageQuota => "package_quota",
            Self::Overage => "overage",
            Self::QuotaExhausted => "quota_exhausted",
            Self::UnknownTenant => "unknown_tenant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub tenant_id: TenantId,
    pub pool: QuotaPool,
    pub allowed: bool,
    pub reason: AccessReason,
    pub period_key: Option<PeriodKey>,
    /// Included units left this period
    pub included_remaining: u64,
    /// Units left in consumable packages
    pub packages_remaining: u64,
    /// Units held by live reservations
    pub reserved: u64,
    pub overage_allowed: bool,
}

impl AccessDecision {
    fn unknown_tenant(tenant_id: &TenantId, pool: QuotaPool) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            pool,
            allowed: false,
            reason: AccessReason::UnknownTenant,
            period_key: None,
            included_remaining: 0,
            packages_remaining: 0,
            reserved: 0,
            overage_allowed: false,
        }
    }

    /// Units that can be consumed without overage
    pub fn available(&self) -> u64 {
        self.included_remaining
            .saturating_add(self.packages_remaining)
            .saturating_sub(self.reserved)
    }
}

pub struct AccessGate {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PricingCatalog>,
    clock: Arc<dyn Clock>,
}

impl AccessGate {
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

    /// May the tenant start an action that consumes from `pool`?
    ///
    /// An unknown tenant is a denial, not an error.
    pub async fn check_access(&self, tenant_id: &TenantId, pool: QuotaPool) -> Result<AccessDecision> {
        let Some(tenant) = self.store.tenant(tenant_id).await? else {
            debug!(tenant_id = %tenant_id, "Access check for unknown tenant");
            return Ok(AccessDecision::unknown_tenant(tenant_id, pool));
        };

        let now = self.clock.now();
        let plan = self.catalog.plan(tenant.plan_id_at(now))?;
        let period_key = plan.billing_period.key(now);

        let consumed = self
            .store
            .period_consumed(tenant_id, pool, &period_key)
            .await?;
        let included_remaining = plan.allotment(pool).saturating_sub(consumed);
        let packages_remaining: u64 = self
            .store
            .packages(tenant_id, Some(pool))
            .await?
            .iter()
            .map(|p| p.available(now))
            .sum();
        let reserved: u64 = self
            .store
            .held_reservations(tenant_id, pool, now)
            .await?
            .iter()
            .map(|r| r.amount)
            .sum();
        let overage_allowed = tenant.overage_allowed(pool);

        let mut decision = AccessDecision {
            tenant_id: tenant_id.clone(),
            pool,
            allowed: false,
            reason: AccessReason::QuotaExhausted,
            period_key: Some(period_key),
            included_remaining,
            packages_remaining,
            reserved,
            overage_allowed,
        };

        // Reservations are drawn from the allotment first, like debits
        decision.reason = if decision.available() == 0 {
            if overage_allowed {
                AccessReason::Overage
            } else {
                AccessReason::QuotaExhausted
            }
        } else if included_remaining > reserved {
            AccessReason::IncludedQuota
        } else {
            AccessReason::PackageQuota
        };
        decision.allowed = decision.reason != AccessReason::QuotaExhausted;

        debug!(
            tenant_id = %tenant_id,
            pool = %pool,
            allowed = decision.allowed,
            reason = decision.reason.as_str(),
            "Access checked"
        );
        Ok(decision)
    }
}
