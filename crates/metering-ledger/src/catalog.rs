//! Pricing catalog
//!
//! Plans, purchasable packages, model list prices and currency rates. The
//! catalog is parsed from TOML or JSON once at startup and validated eagerly;
//! a malformed catalog is rejected before any usage is metered. A loaded
//! [`PricingCatalog`] is immutable and carries a version string that every
//! usage record references.

use crate::{MeteringError, Result};
use chrono::Duration;
use metering_core::{BillingPeriod, Currency, QuotaPool};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const MAX_CURRENCY_DECIMALS: u32 = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    version: String,
    base_currency: Currency,
    currencies: BTreeMap<Currency, CurrencyRate>,
    #[serde(default)]
    pools: BTreeMap<QuotaPool, PoolSettings>,
    #[serde(default)]
    plans: Vec<Plan>,
    #[serde(default)]
    packages: Vec<PackageOffer>,
    #[serde(default)]
    models: Vec<ModelPrice>,
}

/// Conversion from the base currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurrencyRate {
    /// Units of this currency per one unit of the base currency
    pub rate: Decimal,
    /// Minor-unit digits costs are rounded to
    pub decimals: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolSettings {
    package_validity_days: u32,
}

/// Subscription plan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub billing_period: BillingPeriod,
    /// Included units per billing period
    #[serde(default)]
    pub allotments: BTreeMap<QuotaPool, u64>,
    /// Overage price per 1,000 units, in the base currency
    #[serde(default)]
    pub overage_price_per_1k: BTreeMap<QuotaPool, Decimal>,
}

impl Plan {
    pub fn allotment(&self, pool: QuotaPool) -> u64 {
        self.allotments.get(&pool).copied().unwrap_or(0)
    }

    pub fn overage_price_per_1k(&self, pool: QuotaPool) -> Option<Decimal> {
        self.overage_price_per_1k.get(&pool).copied()
    }
}

/// Purchasable supplemental capacity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageOffer {
    pub id: String,
    pub pool: QuotaPool,
    pub quantity: u64,
    /// Price in the base currency
    pub price: Decimal,
    /// Overrides the pool's validity window
    #[serde(default)]
    pub validity_days: Option<u32>,
}

/// List price of a model, used for per-model usage analytics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPrice {
    pub id: String,
    pub pool: QuotaPool,
    pub unit_cost_per_1k: Decimal,
}

/// Validated, immutable pricing catalog
#[derive(Debug, Clone, Serialize)]
pub struct PricingCatalog {
    version: String,
    base_currency: Currency,
    currencies: BTreeMap<Currency, CurrencyRate>,
    package_validity_days: BTreeMap<QuotaPool, u32>,
    plans: BTreeMap<String, Plan>,
    packages: BTreeMap<String, PackageOffer>,
    models: BTreeMap<String, ModelPrice>,
}

fn invalid(message: impl Into<String>) -> MeteringError {
    MeteringError::InvalidCatalog(message.into())
}

fn index_unique<T>(
    items: Vec<T>,
    kind: &str,
    id: impl Fn(&T) -> &str,
) -> Result<BTreeMap<String, T>> {
    let mut map = BTreeMap::new();
    for item in items {
        let key = id(&item).trim().to_string();
        if key.is_empty() {
            return Err(invalid(format!("{kind} with empty id")));
        }
        if map.contains_key(&key) {
            return Err(invalid(format!("duplicate {kind} id '{key}'")));
        }
        map.insert(key, item);
    }
    Ok(map)
}

impl PricingCatalog {
    /// Parse and validate a TOML catalog
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(source).map_err(|e| invalid(e.to_string()))?;
        Self::validate(file)
    }

    /// Parse and validate a JSON catalog
    pub fn from_json_str(source: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_json::from_str(source).map_err(|e| invalid(e.to_string()))?;
        Self::validate(file)
    }

    /// Load a catalog file; `.json` files are parsed as JSON, anything else as TOML
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
        let catalog = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source)?,
            _ => Self::from_toml_str(&source)?,
        };
        tracing::info!(
            path = %path.display(),
            version = %catalog.version,
            plans = catalog.plans.len(),
            packages = catalog.packages.len(),
            "Loaded pricing catalog"
        );
        Ok(catalog)
    }

    fn validate(file: CatalogFile) -> Result<Self> {
        if file.version.trim().is_empty() {
            return Err(invalid("version must not be empty"));
        }

        match file.currencies.get(&file.base_currency) {
            Some(base) if base.rate == Decimal::ONE => {}
            Some(_) => return Err(invalid("base currency rate must be 1")),
            None => {
                return Err(invalid(format!(
                    "base currency {} has no rate entry",
                    file.base_currency
                )))
            }
        }
        for (currency, rate) in &file.currencies {
            if rate.rate <= Decimal::ZERO {
                return Err(invalid(format!("rate for {currency} must be positive")));
            }
            if rate.decimals > MAX_CURRENCY_DECIMALS {
                return Err(invalid(format!("too many decimals for {currency}")));
            }
        }

        let mut package_validity_days = BTreeMap::new();
        for (pool, settings) in file.pools {
            if settings.package_validity_days == 0 {
                return Err(invalid(format!("package validity for {pool} must be positive")));
            }
            package_validity_days.insert(pool, settings.package_validity_days);
        }

        let plans = index_unique(file.plans, "plan", |p| p.id.as_str())?;
        for plan in plans.values() {
            if let Some((pool, _)) = plan
                .overage_price_per_1k
                .iter()
                .find(|(_, price)| price.is_sign_negative())
            {
                return Err(invalid(format!(
                    "plan '{}' has a negative overage price for {pool}",
                    plan.id
                )));
            }
        }

        let packages = index_unique(file.packages, "package", |p| p.id.as_str())?;
        for package in packages.values() {
            if package.quantity == 0 {
                return Err(invalid(format!("package '{}' grants nothing", package.id)));
            }
            if package.price.is_sign_negative() {
                return Err(invalid(format!("package '{}' has a negative price", package.id)));
            }
            let validity = package
                .validity_days
                .or_else(|| package_validity_days.get(&package.pool).copied());
            match validity {
                Some(days) if days > 0 => {}
                _ => {
                    return Err(invalid(format!(
                        "package '{}' has no positive validity window",
                        package.id
                    )))
                }
            }
        }

        let models = index_unique(file.models, "model", |m| m.id.as_str())?;
        if let Some(model) = models.values().find(|m| m.unit_cost_per_1k.is_sign_negative()) {
            return Err(invalid(format!("model '{}' has a negative unit cost", model.id)));
        }

        Ok(Self {
            version: file.version,
            base_currency: file.base_currency,
            currencies: file.currencies,
            package_validity_days,
            plans,
            packages,
            models,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn base_currency(&self) -> &Currency {
        &self.base_currency
    }

    pub fn currency(&self, currency: &Currency) -> Option<&CurrencyRate> {
        self.currencies.get(currency)
    }

    pub fn currencies(&self) -> impl Iterator<Item = (&Currency, &CurrencyRate)> {
        self.currencies.iter()
    }

    pub fn plan(&self, plan_id: &str) -> Result<&Plan> {
        self.plans
            .get(plan_id)
            .ok_or_else(|| MeteringError::PlanNotFound(plan_id.to_string()))
    }

    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.values()
    }

    pub fn package(&self, package_id: &str) -> Result<&PackageOffer> {
        self.packages
            .get(package_id)
            .ok_or_else(|| MeteringError::PackageNotFound(package_id.to_string()))
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageOffer> {
        self.packages.values()
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelPrice> {
        self.models.get(model_id)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelPrice> {
        self.models.values()
    }

    /// Validity window of a purchased package
    pub fn validity_window(&self, offer: &PackageOffer) -> Duration {
        let days = offer
            .validity_days
            .or_else(|| self.package_validity_days.get(&offer.pool).copied())
            .unwrap_or(0);
        Duration::days(days as i64)
    }
}
