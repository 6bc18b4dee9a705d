//! Usage log
//!
//! Every committed consumption appends one immutable [`UsageRecord`]. The log
//! is the source of truth: period counters and package balances are
//! materialized views of it.

use crate::Cost;
use chrono::{DateTime, Utc};
use metering_core::{Money, PeriodKey, QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Caller-owned identifiers attached to a usage record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    /// Unique per tenant; a repeated key returns the original record
    pub idempotency_key: Option<String>,
    /// Model that produced the consumption, for per-model reporting
    pub model: Option<String>,
    /// Free-form identifiers (request id, agent id, lead id, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Correlation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Fill fields missing here from `other`
    pub fn merged_with(mut self, other: &Correlation) -> Self {
        if self.idempotency_key.is_none() {
            self.idempotency_key = other.idempotency_key.clone();
        }
        if self.model.is_none() {
            self.model = other.model.clone();
        }
        for (key, value) in &other.attributes {
            self.attributes.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }
}

/// Amount taken from one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDebit {
    pub purchase_id: Uuid,
    pub amount: u64,
}

/// Which sources paid for a consumption
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBreakdown {
    /// Taken from the plan's included allotment
    pub included: u64,
    /// Taken from packages, in drain order
    pub packages: Vec<PackageDebit>,
    /// Billed beyond allotment and packages
    pub overage: u64,
}

impl UsageBreakdown {
    pub fn package_total(&self) -> u64 {
        self.packages.iter().map(|p| p.amount).sum()
    }

    pub fn total(&self) -> u64 {
        self.included + self.package_total() + self.overage
    }
}

/// Immutable usage log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub pool: QuotaPool,
    /// Gross amount consumed
    pub amount: u64,
    pub breakdown: UsageBreakdown,
    /// Charged cost; only overage is ever charged
    pub cost: Cost,
    /// Model list price of the gross amount, when the model is priced
    pub list_cost: Option<Money>,
    pub period_key: PeriodKey,
    pub plan_id: String,
    pub catalog_version: String,
    /// Reservation this record settled, if any
    pub reservation_id: Option<Uuid>,
    pub correlation: Correlation,
    pub recorded_at: DateTime<Utc>,
}

impl UsageRecord {
    pub fn model(&self) -> Option<&str> {
        self.correlation.model.as_deref()
    }
}

/// Filter over the usage log
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub tenant_id: Option<TenantId>,
    pub pool: Option<QuotaPool>,
    pub period_key: Option<PeriodKey>,
    /// Inclusive lower bound on `recorded_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `recorded_at`
    pub to: Option<DateTime<Utc>>,
}

impl RecordQuery {
    pub fn tenant(tenant_id: &TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id.clone()),
            ..Default::default()
        }
    }

    pub fn with_pool(mut self, pool: QuotaPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_period(mut self, period_key: PeriodKey) -> Self {
        self.period_key = Some(period_key);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn matches(&self, record: &UsageRecord) -> bool {
        self.tenant_id.as_ref().map_or(true, |t| &record.tenant_id == t)
            && self.pool.map_or(true, |p| record.pool == p)
            && self.period_key.as_ref().map_or(true, |k| &record.period_key == k)
            && self.from.map_or(true, |from| record.recorded_at >= from)
            && self.to.map_or(true, |to| record.recorded_at < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breakdown_totals() {
        let breakdown = UsageBreakdown {
            included: 50,
            packages: vec![
                PackageDebit { purchase_id: Uuid::new_v4(), amount: 20 },
                PackageDebit { purchase_id: Uuid::new_v4(), amount: 30 },
            ],
            overage: 7,
        };

        assert_eq!(breakdown.package_total(), 50);
        assert_eq!(breakdown.total(), 107);
    }

    #[test]
    fn test_correlation_merge_keeps_own_values() {
        let reserved = Correlation::new()
            .with_idempotency_key("req-1")
            .with_model("gpt-4o")
            .with_attribute("lead_id", "L-9");
        let committed = Correlation::new()
            .with_model("gpt-4o-mini")
            .with_attribute("lead_id", "L-10")
            .merged_with(&reserved);

        assert_eq!(committed.idempotency_key.as_deref(), Some("req-1"));
        assert_eq!(committed.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(committed.attributes["lead_id"], "L-10");
    }
}
