//! Metering ledger CLI
//!
//! Administration for the tenant usage metering ledger: catalog checks,
//! migrations, tenants, packages, manual metering, reports and audits.

mod commands;
mod context;
mod output;
mod telemetry;

use clap::{Parser, Subcommand};
use colored::Colorize;
use context::AppContext;
use output::OutputFormat;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "metering",
    author = "Metering Ledger Team",
    version,
    about = "Tenant usage metering and quota ledger",
    long_about = "Administer the usage metering ledger.\n\n\
                  Validate pricing catalogs, manage tenants and purchased packages,\n\
                  meter usage by hand and audit the ledger against its usage log."
)]
struct Cli {
    /// Configuration file; METERING__* environment variables override it
    #[arg(short, long, env = "METERING_CONFIG")]
    config: Option<String>,

    /// Pricing catalog file, overrides the configured path
    #[arg(long, env = "METERING_CATALOG")]
    catalog: Option<String>,

    /// Output format (text, json, yaml)
    #[arg(
        short,
        long,
        default_value = "text",
        value_parser = ["text", "json", "yaml"]
    )]
    format: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the pricing catalog
    #[command(subcommand)]
    Catalog(CatalogCommands),

    /// Apply database migrations
    Migrate,

    /// Manage tenants
    #[command(subcommand)]
    Tenant(TenantCommands),

    /// Check whether a tenant may consume from a pool
    Access {
        /// Tenant ID
        tenant: String,
        /// Quota pool
        #[arg(short, long, default_value = "ai_units")]
        pool: String,
    },

    /// Record consumption
    Consume {
        /// Tenant ID
        tenant: String,
        /// Units consumed
        amount: u64,
        /// Quota pool
        #[arg(short, long, default_value = "ai_units")]
        pool: String,
        #[command(flatten)]
        correlation: CorrelationArgs,
    },

    /// Manage purchased packages
    #[command(subcommand)]
    Packages(PackageCommands),

    /// Manage capacity reservations
    #[command(subcommand)]
    Reservations(ReservationCommands),

    /// Usage of one billing period
    Summary {
        /// Tenant ID
        tenant: String,
        /// Period key (e.g. 2026-10); the current period when omitted
        #[arg(short, long)]
        period: Option<String>,
    },

    /// Usage per day
    Daily {
        /// Tenant ID
        tenant: String,
        /// Number of days, today included
        #[arg(short, long, default_value = "30")]
        days: u32,
    },

    /// Usage per model
    Models {
        /// Tenant ID
        tenant: String,
        /// Window start (RFC 3339 or YYYY-MM-DD); 30 days ago by default
        #[arg(long)]
        from: Option<String>,
        /// Window end, exclusive; now by default
        #[arg(long)]
        to: Option<String>,
    },

    /// Re-derive balances from the usage log and report mismatches
    Reconcile {
        /// Only this tenant
        tenant: Option<String>,
    },
}

#[derive(clap::Args)]
pub struct CorrelationArgs {
    /// Idempotency key; a repeated key returns the original record
    #[arg(short = 'k', long)]
    idempotency_key: Option<String>,
    /// Model that produced the usage
    #[arg(short, long)]
    model: Option<String>,
    /// Extra identifiers (key=value)
    #[arg(short, long = "attr")]
    attributes: Vec<String>,
}

#[derive(Subcommand)]
pub enum CatalogCommands {
    /// Parse and validate a catalog
    Validate {
        /// Catalog file; the configured catalog when omitted
        path: Option<String>,
    },
    /// Show plans, packages, models and currencies
    Show,
}

#[derive(Subcommand)]
pub enum TenantCommands {
    /// Register a tenant
    Register {
        /// Tenant ID
        id: String,
        /// Plan ID
        #[arg(short, long)]
        plan: String,
        /// Reporting currency; the catalog base currency when omitted
        #[arg(short, long)]
        currency: Option<String>,
        /// Pools with billed overage
        #[arg(short, long)]
        overage: Vec<String>,
    },
    /// Show a tenant
    Show {
        /// Tenant ID
        id: String,
    },
    /// Schedule a plan change for the next billing period
    Plan {
        /// Tenant ID
        id: String,
        /// New plan ID
        plan: String,
    },
    /// Enable or disable billed overage for a pool
    Overage {
        /// Tenant ID
        id: String,
        /// Quota pool
        pool: String,
        /// Disable instead of enable
        #[arg(long)]
        disable: bool,
    },
}

#[derive(Subcommand)]
pub enum PackageCommands {
    /// List packages
    List {
        /// Tenant ID
        tenant: String,
        /// Only consumable packages of this pool, in drain order
        #[arg(short, long)]
        pool: Option<String>,
    },
    /// Create a pending purchase
    Purchase {
        /// Tenant ID
        tenant: String,
        /// Catalog package ID
        package: String,
        /// Quota pool the package is for
        #[arg(short, long, default_value = "ai_units")]
        pool: String,
    },
    /// Confirm payment and activate a purchase
    Confirm {
        /// Purchase ID
        id: uuid::Uuid,
        /// Payment reference
        payment_ref: String,
    },
    /// Cancel a pending purchase
    Cancel {
        /// Purchase ID
        id: uuid::Uuid,
    },
    /// Mark packages past their expiry as expired
    Expire,
}

#[derive(Subcommand)]
pub enum ReservationCommands {
    /// Hold capacity for a long-running action
    Reserve {
        /// Tenant ID
        tenant: String,
        /// Estimated units
        amount: u64,
        /// Quota pool
        #[arg(short, long, default_value = "ai_units")]
        pool: String,
        #[command(flatten)]
        correlation: CorrelationArgs,
    },
    /// Settle a reservation with the actual amount
    Commit {
        /// Reservation ID
        id: uuid::Uuid,
        /// Units actually consumed
        amount: u64,
    },
    /// Release a reservation without consuming
    Release {
        /// Reservation ID
        id: uuid::Uuid,
    },
    /// Expire lapsed reservations
    Sweep,
}

async fn execute(ctx: &AppContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Catalog(cmd) => commands::catalog::run(ctx, cmd),
        Commands::Migrate => commands::maintenance::migrate(ctx).await,
        Commands::Tenant(cmd) => commands::tenant::run(ctx, cmd).await,
        Commands::Access { tenant, pool } => commands::usage::access(ctx, &tenant, &pool).await,
        Commands::Consume {
            tenant,
            amount,
            pool,
            correlation,
        } => commands::usage::consume(ctx, &tenant, &pool, amount, correlation).await,
        Commands::Packages(cmd) => commands::packages::run(ctx, cmd).await,
        Commands::Reservations(cmd) => commands::usage::reservations(ctx, cmd).await,
        Commands::Summary { tenant, period } => {
            commands::reports::summary(ctx, &tenant, period.as_deref()).await
        }
        Commands::Daily { tenant, days } => commands::reports::daily(ctx, &tenant, days).await,
        Commands::Models { tenant, from, to } => {
            commands::reports::models(ctx, &tenant, from.as_deref(), to.as_deref()).await
        }
        Commands::Reconcile { tenant } => {
            commands::maintenance::reconcile(ctx, tenant.as_deref()).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let format: OutputFormat = match cli.format.parse() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let result = match AppContext::load(cli.config.as_deref(), cli.catalog, format) {
        Ok(ctx) => match telemetry::init(&ctx.config.logging, cli.verbose) {
            Ok(()) => execute(&ctx, cli.command).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            if cli.verbose {
                for cause in e.chain().skip(1) {
                    eprintln!("{}: {}", "Caused by".yellow(), cause);
                }
            }
            ExitCode::FAILURE
        }
    }
}
