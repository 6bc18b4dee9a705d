//! Usage report commands

use crate::context::{parse_time, AppContext};
use crate::output;
use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use colored::Colorize;
use metering_ledger::{PeriodKey, TenantId};
use tabled::{Table, Tabled};

pub async fn summary(ctx: &AppContext, tenant: &str, period: Option<&str>) -> Result<()> {
    let period_key = period
        .map(|key| {
            key.parse::<PeriodKey>()
                .with_context(|| format!("Invalid period key '{key}'"))
        })
        .transpose()?;
    let service = ctx.service().await?;
    let summary = service
        .usage_summary(&TenantId::new(tenant), period_key)
        .await?;

    output::emit(&summary, ctx.format, |summary| {
        println!(
            "{} {} (plan {})",
            summary.tenant_id.to_string().bold(),
            summary.period_key,
            summary.plan_id
        );

        #[derive(Tabled)]
        struct PoolRow {
            #[tabled(rename = "Pool")]
            pool: String,
            #[tabled(rename = "Included")]
            included: String,
            #[tabled(rename = "Packages used")]
            package_used: u64,
            #[tabled(rename = "Packages left")]
            packages_remaining: u64,
            #[tabled(rename = "Overage")]
            overage: u64,
            #[tabled(rename = "Cost")]
            cost: String,
        }

        let rows: Vec<_> = summary
            .pools
            .iter()
            .map(|p| PoolRow {
                pool: p.pool.to_string(),
                included: format!("{}/{}", p.included_used, p.allotment),
                package_used: p.package_used,
                packages_remaining: p.packages_remaining,
                overage: p.overage,
                cost: output::cost(&p.overage_cost),
            })
            .collect();
        println!("{}", Table::new(rows));
        output::key_value("Total cost", output::cost(&summary.total_cost));
    })
}

pub async fn daily(ctx: &AppContext, tenant: &str, days: u32) -> Result<()> {
    let service = ctx.service().await?;
    let usage = service.daily_usage(&TenantId::new(tenant), days).await?;

    output::emit(&usage, ctx.format, |usage| {
        if usage.is_empty() {
            output::dimmed("No usage in this window.");
            return;
        }

        #[derive(Tabled)]
        struct DayRow {
            #[tabled(rename = "Date")]
            date: String,
            #[tabled(rename = "Pool")]
            pool: String,
            #[tabled(rename = "Amount")]
            amount: u64,
            #[tabled(rename = "Overage")]
            overage: u64,
            #[tabled(rename = "Cost")]
            cost: String,
        }

        let rows: Vec<_> = usage
            .iter()
            .map(|d| DayRow {
                date: d.date.to_string(),
                pool: d.pool.to_string(),
                amount: d.amount,
                overage: d.overage,
                cost: output::cost(&d.cost),
            })
            .collect();
        println!("{}", Table::new(rows));
    })
}

pub async fn models(
    ctx: &AppContext,
    tenant: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<()> {
    let to = match to {
        Some(to) => parse_time(to)?,
        None => Utc::now(),
    };
    let from = match from {
        Some(from) => parse_time(from)?,
        None => to - Duration::days(30),
    };

    let service = ctx.service().await?;
    let usage = service
        .usage_by_model(&TenantId::new(tenant), from, to)
        .await?;

    output::emit(&usage, ctx.format, |usage| {
        if usage.is_empty() {
            output::dimmed("No usage in this window.");
            return;
        }

        #[derive(Tabled)]
        struct ModelRow {
            #[tabled(rename = "Model")]
            model: String,
            #[tabled(rename = "Requests")]
            requests: u64,
            #[tabled(rename = "Amount")]
            amount: u64,
            #[tabled(rename = "Charged")]
            cost: String,
            #[tabled(rename = "List cost")]
            list_cost: String,
        }

        let rows: Vec<_> = usage
            .iter()
            .map(|m| ModelRow {
                model: m.model.clone(),
                requests: m.requests,
                amount: m.amount,
                cost: output::cost(&m.cost),
                list_cost: m.list_cost.to_string(),
            })
            .collect();
        println!("{}", Table::new(rows));
    })
}
