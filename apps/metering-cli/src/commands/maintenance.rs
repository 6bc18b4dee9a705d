//! Schema migrations and ledger audits

use crate::context::AppContext;
use crate::output;
use anyhow::{bail, Result};
use colored::Colorize;
use metering_ledger::{ReconciliationReport, TenantId};

pub async fn migrate(ctx: &AppContext) -> Result<()> {
    let store = ctx.store().await?;
    store.migrate().await?;
    output::success("Ledger schema is up to date");
    Ok(())
}

/// Fails when any tenant's ledger disagrees with its usage log
pub async fn reconcile(ctx: &AppContext, tenant: Option<&str>) -> Result<()> {
    let service = ctx.service().await?;
    let reports = match tenant {
        Some(tenant) => vec![service.reconcile_tenant(&TenantId::new(tenant)).await?],
        None => service.reconcile_all().await?,
    };

    output::emit(&reports, ctx.format, |reports| {
        if reports.is_empty() {
            output::dimmed("No tenants.");
        }
        for report in reports {
            print_report(report);
        }
    })?;

    let inconsistent = reports.iter().filter(|r| !r.is_consistent()).count();
    if inconsistent > 0 {
        bail!("{inconsistent} tenant ledgers do not match their usage log");
    }
    Ok(())
}

fn print_report(report: &ReconciliationReport) {
    let tenant = report
        .tenant_id
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());

    if report.is_consistent() {
        println!(
            "{} {}: {} records",
            "✓".green(),
            tenant.bold(),
            report.records_checked
        );
    } else {
        println!(
            "{} {}: {} records",
            "✗".red(),
            tenant.bold(),
            report.records_checked
        );
    }

    for mismatch in &report.counter_mismatches {
        println!(
            "    counter {} {}: stored {}, log {}",
            mismatch.pool, mismatch.period_key, mismatch.stored, mismatch.derived
        );
    }
    for mismatch in &report.package_mismatches {
        let stored = mismatch
            .stored
            .map(|s| s.to_string())
            .unwrap_or_else(|| "missing".to_string());
        println!(
            "    package {}: stored {}, log {}",
            mismatch.purchase_id, stored, mismatch.derived
        );
    }
    for mismatch in &report.cost_mismatches {
        println!(
            "    record {}: charged {}, recomputed {}",
            mismatch.record_id,
            output::cost(&mismatch.recorded),
            output::cost(&mismatch.recomputed)
        );
    }
    for record_id in &report.invalid_breakdowns {
        println!("    record {record_id}: breakdown does not add up");
    }
    if report.unverified_costs > 0 {
        output::warning(&format!(
            "{} records priced under a catalog version that is not loaded",
            report.unverified_costs
        ));
    }
}
