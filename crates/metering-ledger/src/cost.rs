//! Cost calculation
//!
//! Pure and deterministic: the same breakdown, plan and catalog always give
//! the same cost, so an audit can recompute any record from the log.
//! Included and package consumption are free at consumption time (packages
//! were paid for at purchase); only overage is charged.

use crate::{MeteringError, Plan, PricingCatalog, Result, UsageBreakdown};
use metering_core::{round_half_up, Currency, Money, QuotaPool};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Overage charges are rounded to cents once per call
pub const OVERAGE_DECIMALS: u32 = 2;
/// List prices are informational and kept at finer precision
pub const LIST_COST_DECIMALS: u32 = 6;

/// Charged cost in the catalog's base currency and the tenant's currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cost {
    pub base: Money,
    pub local: Money,
}

impl Cost {
    pub fn zero(base: Currency, local: Currency) -> Self {
        Self {
            base: Money::zero(base),
            local: Money::zero(local),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.base.is_zero() && self.local.is_zero()
    }

    pub fn checked_add(&self, other: &Cost) -> Result<Cost> {
        Ok(Cost {
            base: self.base.checked_add(&other.base)?,
            local: self.local.checked_add(&other.local)?,
        })
    }
}

pub struct CostCalculator<'a> {
    catalog: &'a PricingCatalog,
}

impl<'a> CostCalculator<'a> {
    pub fn new(catalog: &'a PricingCatalog) -> Self {
        Self { catalog }
    }

    /// Convert an exact base-currency amount, rounding half-up to the
    /// currency's minor units
    pub fn convert(&self, base_amount: Decimal, currency: &Currency) -> Result<Money> {
        let rate = self.catalog.currency(currency).ok_or_else(|| {
            MeteringError::InvalidConfiguration(format!(
                "currency {currency} has no rate in catalog {}",
                self.catalog.version()
            ))
        })?;
        Ok(Money::new(
            round_half_up(base_amount * rate.rate, rate.decimals),
            currency.clone(),
        ))
    }

    /// Charge for `overage` units at the plan's price
    pub fn overage_cost(
        &self,
        plan: &Plan,
        pool: QuotaPool,
        overage: u64,
        currency: &Currency,
    ) -> Result<Cost> {
        let base_currency = self.catalog.base_currency().clone();
        if overage == 0 {
            return Ok(Cost::zero(base_currency, currency.clone()));
        }

        let price = plan.overage_price_per_1k(pool).ok_or_else(|| {
            MeteringError::InvalidConfiguration(format!(
                "plan '{}' has no overage price for {pool}",
                plan.id
            ))
        })?;
        let exact = Decimal::from(overage) / Decimal::from(1000u64) * price;

        Ok(Cost {
            base: Money::new(round_half_up(exact, OVERAGE_DECIMALS), base_currency),
            local: self.convert(exact, currency)?,
        })
    }

    /// Cost of a full breakdown
    pub fn cost(
        &self,
        plan: &Plan,
        pool: QuotaPool,
        breakdown: &UsageBreakdown,
        currency: &Currency,
    ) -> Result<Cost> {
        self.overage_cost(plan, pool, breakdown.overage, currency)
    }

    /// List price of `amount` units of a model, if the model is priced for the pool
    pub fn list_cost(&self, model: Option<&str>, pool: QuotaPool, amount: u64) -> Option<Money> {
        let model = self.catalog.model(model?)?;
        if model.pool != pool {
            return None;
        }
        let exact = Decimal::from(amount) / Decimal::from(1000u64) * model.unit_cost_per_1k;
        Some(Money::new(
            round_half_up(exact, LIST_COST_DECIMALS),
            self.catalog.base_currency().clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;
    use rust_decimal_macros::dec;

    fn krw() -> Currency {
        "KRW".parse().unwrap()
    }

    #[test]
    fn test_pure_overage_cost() {
        let catalog = sample_catalog();
        let plan = catalog.plan("growth").unwrap();
        let calculator = CostCalculator::new(&catalog);

        let cost = calculator
            .overage_cost(plan, QuotaPool::AiUnits, 2500, &Currency::usd())
            .unwrap();

        assert_eq!(cost.base.amount, dec!(25.00));
        assert_eq!(cost.local.amount, dec!(25.00));
    }

    #[test]
    fn test_overage_rounds_half_up_once() {
        let catalog = sample_catalog();
        let plan = catalog.plan("growth").unwrap();
        let calculator = CostCalculator::new(&catalog);

        // 1 unit at 2.50/1k = 0.0025 -> 0.00; 2 units = 0.005 -> 0.01
        let one = calculator
            .overage_cost(plan, QuotaPool::Retrieval, 1, &Currency::usd())
            .unwrap();
        let two = calculator
            .overage_cost(plan, QuotaPool::Retrieval, 2, &Currency::usd())
            .unwrap();
        assert_eq!(one.base.amount, dec!(0.00));
        assert_eq!(two.base.amount, dec!(0.01));

        // 1001 units at 10.00/1k = 10.01 exactly
        let cost = calculator
            .overage_cost(plan, QuotaPool::AiUnits, 1001, &Currency::usd())
            .unwrap();
        assert_eq!(cost.base.amount, dec!(10.01));
    }

    #[test]
    fn test_local_currency_uses_catalog_rate() {
        let catalog = sample_catalog();
        let plan = catalog.plan("growth").unwrap();
        let calculator = CostCalculator::new(&catalog);

        // 3 units at 2.50/1k = 0.0075 USD exact -> 10.125 KRW -> 10
        let cost = calculator
            .overage_cost(plan, QuotaPool::Retrieval, 3, &krw())
            .unwrap();
        assert_eq!(cost.base.amount, dec!(0.01));
        assert_eq!(cost.local.amount, dec!(10));
        assert_eq!(cost.local.currency, krw());

        let cost = calculator
            .overage_cost(plan, QuotaPool::AiUnits, 2500, &krw())
            .unwrap();
        assert_eq!(cost.local.amount, dec!(33750));
    }

    #[test]
    fn test_included_and_package_consumption_is_free() {
        let catalog = sample_catalog();
        let plan = catalog.plan("growth").unwrap();
        let calculator = CostCalculator::new(&catalog);
        let breakdown = UsageBreakdown {
            included: 500,
            packages: vec![crate::PackageDebit {
                purchase_id: uuid::Uuid::new_v4(),
                amount: 300,
            }],
            overage: 0,
        };

        let cost = calculator
            .cost(plan, QuotaPool::AiUnits, &breakdown, &Currency::usd())
            .unwrap();
        assert!(cost.is_zero());
    }

    #[test]
    fn test_overage_without_price_is_rejected() {
        let catalog = sample_catalog();
        let plan = catalog.plan("free").unwrap();
        let calculator = CostCalculator::new(&catalog);

        assert!(calculator
            .overage_cost(plan, QuotaPool::AiUnits, 10, &Currency::usd())
            .is_err());
    }

    #[test]
    fn test_list_cost() {
        let catalog = sample_catalog();
        let calculator = CostCalculator::new(&catalog);

        let cost = calculator
            .list_cost(Some("gpt-4o"), QuotaPool::AiUnits, 2000)
            .unwrap();
        assert_eq!(cost.amount, dec!(0.01));
        assert!(calculator.list_cost(Some("gpt-4o"), QuotaPool::Image, 2000).is_none());
        assert!(calculator.list_cost(None, QuotaPool::AiUnits, 2000).is_none());
    }
}
