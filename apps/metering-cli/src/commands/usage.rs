//! Metering commands: access checks, consumption and reservations

use crate::context::{parse_pool, AppContext};
use crate::output;
use crate::{CorrelationArgs, ReservationCommands};
use anyhow::{bail, Result};
use colored::Colorize;
use metering_ledger::{Correlation, Reservation, TenantId, UsageRecord};

impl CorrelationArgs {
    fn into_correlation(self) -> Result<Correlation> {
        let mut correlation = Correlation::new();
        correlation.idempotency_key = self.idempotency_key;
        correlation.model = self.model;
        for attribute in &self.attributes {
            let Some((key, value)) = attribute.split_once('=') else {
                bail!("Attribute '{attribute}' must be key=value");
            };
            correlation = correlation.with_attribute(key.trim(), value.trim());
        }
        Ok(correlation)
    }
}

pub async fn access(ctx: &AppContext, tenant: &str, pool: &str) -> Result<()> {
    let pool = parse_pool(pool)?;
    let service = ctx.service().await?;
    let decision = service.check_access(&TenantId::new(tenant), pool).await?;

    output::emit(&decision, ctx.format, |decision| {
        let verdict = if decision.allowed {
            "allowed".green().bold()
        } else {
            "denied".red().bold()
        };
        println!("{} {} for {}: {}", decision.tenant_id, pool, verdict, decision.reason.as_str());
        if let Some(period_key) = &decision.period_key {
            output::key_value("Period", period_key);
        }
        output::key_value("Included remaining", decision.included_remaining);
        output::key_value("Packages remaining", decision.packages_remaining);
        output::key_value("Reserved", decision.reserved);
        output::key_value("Available", decision.available());
        output::key_value("Overage", if decision.overage_allowed { "on" } else { "off" });
    })
}

pub async fn consume(
    ctx: &AppContext,
    tenant: &str,
    pool: &str,
    amount: u64,
    correlation: CorrelationArgs,
) -> Result<()> {
    let pool = parse_pool(pool)?;
    let correlation = correlation.into_correlation()?;
    let service = ctx.service().await?;
    let record = service
        .consume(&TenantId::new(tenant), pool, amount, correlation)
        .await?;

    output::emit(&record, ctx.format, print_record)
}

pub async fn reservations(ctx: &AppContext, cmd: ReservationCommands) -> Result<()> {
    let service = ctx.service().await?;

    match cmd {
        ReservationCommands::Reserve {
            tenant,
            amount,
            pool,
            correlation,
        } => {
            let pool = parse_pool(&pool)?;
            let reservation = service
                .reserve(&TenantId::new(tenant), pool, amount, correlation.into_correlation()?)
                .await?;
            output::emit(&reservation, ctx.format, print_reservation)
        }
        ReservationCommands::Commit { id, amount } => {
            let record = service.commit(id, amount).await?;
            output::emit(&record, ctx.format, print_record)
        }
        ReservationCommands::Release { id } => {
            let reservation = service.release(id).await?;
            output::emit(&reservation, ctx.format, print_reservation)
        }
        ReservationCommands::Sweep => {
            let expired = service.expire_reservations().await?;
            output::emit(&expired, ctx.format, |expired| {
                if expired.is_empty() {
                    output::dimmed("No lapsed reservations.");
                } else {
                    output::success(&format!("Expired {} reservations", expired.len()));
                    for id in expired {
                        println!("  {id}");
                    }
                }
            })
        }
    }
}

fn print_record(record: &UsageRecord) {
    output::success(&format!(
        "Recorded {} {} for {}",
        record.amount, record.pool, record.tenant_id
    ));
    output::key_value("Record", record.id);
    output::key_value("Period", &record.period_key);
    output::key_value("Included", record.breakdown.included);
    for debit in &record.breakdown.packages {
        output::key_value("Package", format!("{} ({})", debit.amount, debit.purchase_id));
    }
    if record.breakdown.overage > 0 {
        output::key_value("Overage", record.breakdown.overage);
    }
    output::key_value("Cost", output::cost(&record.cost));
}

fn print_reservation(reservation: &Reservation) {
    output::key_value("Reservation", reservation.id);
    output::key_value("Tenant", &reservation.tenant_id);
    output::key_value("Pool", reservation.pool);
    output::key_value("Amount", reservation.amount);
    output::key_value("Status", reservation.status.as_str());
    output::key_value("Expires", reservation.expires_at);
}
