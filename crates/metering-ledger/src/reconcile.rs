//! Ledger reconciliation
//!
//! Period counters and package balances are materialized from the usage
//! log. Reconciliation re-derives them from the log and recomputes every
//! record's cost with the catalog version it was priced under, reporting
//! anything that disagrees.

use crate::{CostCalculator, Cost, LedgerStore, MeteringError, PricingCatalog, RecordQuery, Result};
use metering_core::{PeriodKey, QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterMismatch {
    pub pool: QuotaPool,
    pub period_key: PeriodKey,
    pub stored: u64,
    pub derived: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMismatch {
    pub purchase_id: Uuid,
    /// `None` when the log references a purchase the store does not have
    pub stored: Option<u64>,
    pub derived: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostMismatch {
    pub record_id: Uuid,
    pub recorded: Cost,
    pub recomputed: Cost,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub tenant_id: Option<TenantId>,
    pub records_checked: u64,
    pub counter_mismatches: Vec<CounterMismatch>,
    pub package_mismatches: Vec<PackageMismatch>,
    pub cost_mismatches: Vec<CostMismatch>,
    /// Records whose breakdown does not add up to their amount
    pub invalid_breakdowns: Vec<Uuid>,
    /// Records priced under a catalog version that is not loaded
    pub unverified_costs: u64,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.counter_mismatches.is_empty()
            && self.package_mismatches.is_empty()
            && self.cost_mismatches.is_empty()
            && self.invalid_breakdowns.is_empty()
    }
}

pub struct Reconciler {
    store: Arc<dyn LedgerStore>,
    catalogs: HashMap<String, Arc<PricingCatalog>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LedgerStore>, catalog: Arc<PricingCatalog>) -> Self {
        let mut catalogs = HashMap::new();
        catalogs.insert(catalog.version().to_string(), catalog);
        Self { store, catalogs }
    }

    /// Make an older catalog version available for cost verification
    pub fn with_catalog(mut self, catalog: Arc<PricingCatalog>) -> Self {
        self.catalogs.insert(catalog.version().to_string(), catalog);
        self
    }

    pub async fn reconcile_tenant(&self, tenant_id: &TenantId) -> Result<ReconciliationReport> {
        let tenant = self
            .store
            .tenant(tenant_id)
            .await?
            .ok_or_else(|| MeteringError::TenantNotFound(tenant_id.to_string()))?;
        let records = self.store.records(&RecordQuery::tenant(tenant_id)).await?;

        let mut report = ReconciliationReport {
            tenant_id: Some(tenant_id.clone()),
            ..Default::default()
        };
        let mut counters: BTreeMap<(QuotaPool, PeriodKey), u64> = BTreeMap::new();
        let mut packages: BTreeMap<Uuid, u64> = BTreeMap::new();

        for record in &records {
            report.records_checked += 1;
            if record.breakdown.total() != record.amount {
                report.invalid_breakdowns.push(record.id);
            }
            if record.breakdown.included > 0 {
                *counters
                    .entry((record.pool, record.period_key.clone()))
                    .or_default() += record.breakdown.included;
            }
            for debit in &record.breakdown.packages {
                *packages.entry(debit.purchase_id).or_default() += debit.amount;
            }

            let Some(catalog) = self.catalogs.get(&record.catalog_version) else {
                report.unverified_costs += 1;
                continue;
            };
            let recomputed = catalog.plan(&record.plan_id).and_then(|plan| {
                CostCalculator::new(catalog).cost(
                    plan,
                    record.pool,
                    &record.breakdown,
                    &record.cost.local.currency,
                )
            });
            match recomputed {
                Ok(recomputed) if recomputed == record.cost => {}
                Ok(recomputed) => report.cost_mismatches.push(CostMismatch {
                    record_id: record.id,
                    recorded: record.cost.clone(),
                    recomputed,
                }),
                Err(err) => {
                    error!(record_id = %record.id, error = %err, "Cannot recompute record cost");
                    report.unverified_costs += 1;
                }
            }
        }

        for counter in self.store.counters(tenant_id).await? {
            let derived = counters
                .remove(&(counter.pool, counter.period_key.clone()))
                .unwrap_or(0);
            if derived != counter.consumed {
                report.counter_mismatches.push(CounterMismatch {
                    pool: counter.pool,
                    period_key: counter.period_key,
                    stored: counter.consumed,
                    derived,
                });
            }
        }
        // Usage with no counter at all
        for ((pool, period_key), derived) in counters {
            report.counter_mismatches.push(CounterMismatch {
                pool,
                period_key,
                stored: 0,
                derived,
            });
        }

        for purchase in self.store.packages(tenant_id, None).await? {
            let derived = packages.remove(&purchase.id).unwrap_or(0);
            if derived != purchase.consumed {
                report.package_mismatches.push(PackageMismatch {
                    purchase_id: purchase.id,
                    stored: Some(purchase.consumed),
                    derived,
                });
            }
        }
        for (purchase_id, derived) in packages {
            report.package_mismatches.push(PackageMismatch {
                purchase_id,
                stored: None,
                derived,
            });
        }

        if report.is_consistent() {
            info!(
                tenant_id = %tenant.id,
                records = report.records_checked,
                "Ledger reconciled"
            );
        } else {
            error!(
                tenant_id = %tenant.id,
                counters = report.counter_mismatches.len(),
                packages = report.package_mismatches.len(),
                costs = report.cost_mismatches.len(),
                breakdowns = report.invalid_breakdowns.len(),
                "Ledger does not match usage log"
            );
        }
        Ok(report)
    }

    /// Reconcile every tenant
    pub async fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>> {
        let mut reports = Vec::new();
        for tenant_id in self.store.tenant_ids().await? {
            reports.push(self.reconcile_tenant(&tenant_id).await?);
        }
        Ok(reports)
    }
}
