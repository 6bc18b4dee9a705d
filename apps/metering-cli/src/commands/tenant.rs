//! Tenant commands

use crate::context::{parse_pool, AppContext};
use crate::output;
use crate::TenantCommands;
use anyhow::{Context, Result};
use metering_ledger::{Currency, Tenant, TenantId};

pub async fn run(ctx: &AppContext, cmd: TenantCommands) -> Result<()> {
    let service = ctx.service().await?;

    let tenant = match cmd {
        TenantCommands::Register {
            id,
            plan,
            currency,
            overage,
        } => {
            let currency = match currency {
                Some(code) => code
                    .parse::<Currency>()
                    .with_context(|| format!("Invalid currency '{code}'"))?,
                None => service.catalog().base_currency().clone(),
            };
            let mut tenant = Tenant::new(id.as_str(), &plan, currency);
            for pool in &overage {
                tenant = tenant.with_overage(parse_pool(pool)?);
            }
            let tenant = service.register_tenant(tenant).await?;
            if ctx.format == output::OutputFormat::Text {
                output::success(&format!("Registered tenant {}", tenant.id));
            }
            tenant
        }
        TenantCommands::Show { id } => service.tenant(&TenantId::new(id)).await?,
        TenantCommands::Plan { id, plan } => {
            let tenant = service
                .schedule_plan_change(&TenantId::new(id), &plan)
                .await?;
            if ctx.format == output::OutputFormat::Text {
                match &tenant.scheduled_plan {
                    Some(scheduled) => output::success(&format!(
                        "Plan {} takes effect at {}",
                        scheduled.plan_id, scheduled.effective_at
                    )),
                    None => output::success(&format!("Staying on plan {}", tenant.plan_id)),
                }
            }
            tenant
        }
        TenantCommands::Overage { id, pool, disable } => {
            let pool = parse_pool(&pool)?;
            let tenant = service
                .set_overage(&TenantId::new(id), pool, !disable)
                .await?;
            if ctx.format == output::OutputFormat::Text {
                let state = if disable { "disabled" } else { "enabled" };
                output::success(&format!("Overage {state} for {pool}"));
            }
            tenant
        }
    };

    output::emit(&tenant, ctx.format, print_tenant)
}

fn print_tenant(tenant: &Tenant) {
    output::key_value("Tenant", &tenant.id);
    output::key_value("Plan", &tenant.plan_id);
    if let Some(scheduled) = &tenant.scheduled_plan {
        output::key_value(
            "Scheduled",
            format!("{} from {}", scheduled.plan_id, scheduled.effective_at),
        );
    }
    let overage: Vec<_> = tenant.overage_allowed.iter().map(|p| p.as_str()).collect();
    output::key_value(
        "Overage",
        if overage.is_empty() {
            "none".to_string()
        } else {
            overage.join(", ")
        },
    );
    output::key_value("Currency", &tenant.currency);
    output::key_value("Created", tenant.created_at);
}
