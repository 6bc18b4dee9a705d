//! Pricing catalog commands

use crate::context::AppContext;
use crate::output;
use crate::CatalogCommands;
use anyhow::{Context, Result};
use colored::Colorize;
use metering_ledger::{PricingCatalog, QuotaPool};
use tabled::{Table, Tabled};

pub fn run(ctx: &AppContext, cmd: CatalogCommands) -> Result<()> {
    match cmd {
        CatalogCommands::Validate { path } => validate(ctx, path.as_deref()),
        CatalogCommands::Show => show(ctx),
    }
}

fn validate(ctx: &AppContext, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(&ctx.config.catalog.path);
    let catalog = PricingCatalog::load(path).with_context(|| format!("{path} is not valid"))?;

    output::success(&format!(
        "Catalog {} is valid: {} plans, {} packages, {} models, {} currencies",
        catalog.version().bold(),
        catalog.plans().count(),
        catalog.packages().count(),
        catalog.models().count(),
        catalog.currencies().count(),
    ));
    Ok(())
}

fn pool_map<V: std::fmt::Display>(entries: impl Iterator<Item = (QuotaPool, V)>) -> String {
    let parts: Vec<_> = entries.map(|(pool, value)| format!("{pool}={value}")).collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join(", ")
    }
}

fn show(ctx: &AppContext) -> Result<()> {
    let catalog = ctx.catalog()?;

    output::emit(&catalog, ctx.format, |catalog| {
        output::key_value("Version", catalog.version());
        output::key_value("Base currency", catalog.base_currency());

        #[derive(Tabled)]
        struct PlanRow {
            #[tabled(rename = "Plan")]
            id: String,
            #[tabled(rename = "Period")]
            period: String,
            #[tabled(rename = "Allotments")]
            allotments: String,
            #[tabled(rename = "Overage / 1k")]
            overage: String,
        }

        output::section("Plans");
        let plans: Vec<_> = catalog
            .plans()
            .map(|plan| PlanRow {
                id: plan.id.clone(),
                period: plan.billing_period.as_str().to_string(),
                allotments: pool_map(plan.allotments.iter().map(|(p, v)| (*p, *v))),
                overage: pool_map(plan.overage_price_per_1k.iter().map(|(p, v)| (*p, *v))),
            })
            .collect();
        println!("{}", Table::new(plans));

        #[derive(Tabled)]
        struct PackageRow {
            #[tabled(rename = "Package")]
            id: String,
            #[tabled(rename = "Pool")]
            pool: String,
            #[tabled(rename = "Quantity")]
            quantity: u64,
            #[tabled(rename = "Price")]
            price: String,
            #[tabled(rename = "Valid (days)")]
            validity: i64,
        }

        output::section("Packages");
        let packages: Vec<_> = catalog
            .packages()
            .map(|offer| PackageRow {
                id: offer.id.clone(),
                pool: offer.pool.to_string(),
                quantity: offer.quantity,
                price: format!("{} {}", offer.price, catalog.base_currency()),
                validity: catalog.validity_window(offer).num_days(),
            })
            .collect();
        if packages.is_empty() {
            output::dimmed("No packages.");
        } else {
            println!("{}", Table::new(packages));
        }

        output::section("Models");
        let mut any_model = false;
        for model in catalog.models() {
            any_model = true;
            println!(
                "  {} ({}): {} {} / 1k",
                model.id.bold(),
                model.pool,
                model.unit_cost_per_1k,
                catalog.base_currency()
            );
        }
        if !any_model {
            output::dimmed("No model prices.");
        }

        output::section("Currencies");
        for (currency, rate) in catalog.currencies() {
            println!("  {}: {} ({} decimals)", currency, rate.rate, rate.decimals);
        }
    })
}
