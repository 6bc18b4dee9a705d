//! Package purchase commands

use crate::context::{parse_pool, AppContext};
use crate::output;
use crate::PackageCommands;
use anyhow::Result;
use chrono::{DateTime, Utc};
use metering_ledger::{PackagePurchase, TenantId};
use tabled::{Table, Tabled};

pub async fn run(ctx: &AppContext, cmd: PackageCommands) -> Result<()> {
    let service = ctx.service().await?;

    match cmd {
        PackageCommands::List { tenant, pool } => {
            let tenant = TenantId::new(tenant);
            let packages = match pool {
                Some(pool) => {
                    service
                        .list_active_packages(&tenant, parse_pool(&pool)?)
                        .await?
                }
                None => service.list_purchases(&tenant).await?,
            };
            let now = service.now();
            output::emit(&packages, ctx.format, |packages| print_table(packages, now))
        }
        PackageCommands::Purchase {
            tenant,
            package,
            pool,
        } => {
            let purchase = service
                .purchase_package(&TenantId::new(tenant), parse_pool(&pool)?, &package)
                .await?;
            output::emit(&purchase, ctx.format, |purchase| {
                output::success(&format!(
                    "Created pending purchase of {} ({})",
                    purchase.package_id,
                    output::cost(&purchase.price)
                ));
                output::key_value("Purchase", purchase.id);
                output::dimmed("Confirm payment to activate it.");
            })
        }
        PackageCommands::Confirm { id, payment_ref } => {
            let purchase = service.confirm_payment(id, &payment_ref).await?;
            output::emit(&purchase, ctx.format, |purchase| {
                output::success(&format!(
                    "Purchase {} is {}",
                    purchase.id,
                    purchase.status.as_str()
                ));
                if let Some(expires_at) = purchase.expires_at {
                    output::key_value("Expires", expires_at);
                }
            })
        }
        PackageCommands::Cancel { id } => {
            let purchase = service.cancel_purchase(id).await?;
            output::emit(&purchase, ctx.format, |purchase| {
                output::success(&format!("Purchase {} cancelled", purchase.id));
            })
        }
        PackageCommands::Expire => {
            let expired = service.expire_packages().await?;
            output::emit(&expired, ctx.format, |expired| {
                if expired.is_empty() {
                    output::dimmed("No packages due to expire.");
                } else {
                    output::success(&format!("Expired {} packages", expired.len()));
                    for id in expired {
                        println!("  {id}");
                    }
                }
            })
        }
    }
}

fn print_table(packages: &[PackagePurchase], now: DateTime<Utc>) {
    if packages.is_empty() {
        output::dimmed("No packages found.");
        return;
    }

    #[derive(Tabled)]
    struct PackageRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "Package")]
        package: String,
        #[tabled(rename = "Pool")]
        pool: String,
        #[tabled(rename = "Remaining")]
        remaining: String,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "Expires")]
        expires: String,
    }

    let rows: Vec<_> = packages
        .iter()
        .map(|p| PackageRow {
            id: p.id.to_string(),
            package: p.package_id.clone(),
            pool: p.pool.to_string(),
            remaining: format!("{}/{}", p.remaining(), p.quantity),
            status: p.effective_status(now).as_str().to_string(),
            expires: p
                .expires_at
                .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    println!("{}", Table::new(rows));
}
