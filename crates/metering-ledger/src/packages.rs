//! Package inventory
//!
//! Purchased supplemental capacity for one pool. A purchase starts `pending`,
//! becomes `active` exactly once when payment is confirmed, and expires
//! `validity_days` after activation. Expiry is a function of time: an active
//! package past its `expires_at` is skipped by every debit whether or not the
//! sweep has marked it `expired` yet.

use crate::{Clock, Cost, CostCalculator, LedgerStore, MeteringError, PricingCatalog, Result};
use chrono::{DateTime, Duration, Utc};
use metering_core::{QuotaPool, TenantId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Package purchase status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    /// Awaiting payment, not consumable
    Pending,
    /// Paid and consumable until `expires_at`
    Active,
    /// Past its validity window; the remainder is forfeited
    Expired,
    /// Abandoned before payment
    Cancelled,
}

impl PackageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One purchased package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePurchase {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub pool: QuotaPool,
    /// Catalog package this purchase was made from
    pub package_id: String,
    /// Units granted
    pub quantity: u64,
    /// Units consumed so far
    pub consumed: u64,
    pub status: PackageStatus,
    /// Price paid, captured at purchase time
    pub price: Cost,
    /// Validity window captured at purchase time
    pub validity_days: u32,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// External payment reference from the confirmation event
    pub payment_ref: Option<String>,
}

impl PackagePurchase {
    pub fn remaining(&self) -> u64 {
        self.quantity.saturating_sub(self.consumed)
    }

    /// Expired by time or already marked expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            PackageStatus::Expired => true,
            PackageStatus::Active => self.expires_at.map_or(false, |expires| now > expires),
            PackageStatus::Pending | PackageStatus::Cancelled => false,
        }
    }

    /// Status as observed at `now`
    pub fn effective_status(&self, now: DateTime<Utc>) -> PackageStatus {
        if self.is_expired(now) {
            PackageStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == PackageStatus::Active && self.remaining() > 0
    }

    /// Units a debit at `now` may take from this package
    pub fn available(&self, now: DateTime<Utc>) -> u64 {
        if self.is_consumable(now) {
            self.remaining()
        } else {
            0
        }
    }
}

/// Drain order: closest to expiry first, then oldest purchase
pub fn drain_order(a: &PackagePurchase, b: &PackagePurchase) -> Ordering {
    let expiry = |p: &PackagePurchase| p.expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
    expiry(a)
        .cmp(&expiry(b))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Package purchase lifecycle
pub struct PackageInventory {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<PricingCatalog>,
    clock: Arc<dyn Clock>,
}

impl PackageInventory {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<PricingCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            catalog,
            clock,
        }
    }

    /// Create a pending purchase of a catalog package
    pub async fn purchase(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
        package_id: &str,
    ) -> Result<PackagePurchase> {
        let offer = self.catalog.package(package_id)?;
        if offer.pool != pool {
            return Err(MeteringError::InvalidPool(format!(
                "package '{package_id}' grants {} capacity, not {pool}",
                offer.pool
            )));
        }
        let tenant = self
            .store
            .tenant(tenant_id)
            .await?
            .ok_or_else(|| MeteringError::TenantNotFound(tenant_id.to_string()))?;

        let calculator = CostCalculator::new(&self.catalog);
        let price = Cost {
            base: metering_core::Money::new(offer.price, self.catalog.base_currency().clone()),
            local: calculator.convert(offer.price, &tenant.currency)?,
        };
        let validity_days = self.catalog.validity_window(offer).num_days() as u32;

        let purchase = PackagePurchase {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.clone(),
            pool,
            package_id: offer.id.clone(),
            quantity: offer.quantity,
            consumed: 0,
            status: PackageStatus::Pending,
            price,
            validity_days,
            created_at: self.clock.now(),
            activated_at: None,
            expires_at: None,
            cancelled_at: None,
            payment_ref: None,
        };
        self.store.insert_package(&purchase).await?;

        info!(
            tenant_id = %tenant_id,
            purchase_id = %purchase.id,
            package_id = %purchase.package_id,
            pool = %pool,
            quantity = purchase.quantity,
            "Created pending package purchase"
        );
        Ok(purchase)
    }

    async fn load(&self, purchase_id: Uuid) -> Result<PackagePurchase> {
        self.store
            .package(purchase_id)
            .await?
            .ok_or_else(|| MeteringError::PackageNotFound(purchase_id.to_string()))
    }

    /// Activate a purchase on payment confirmation
    ///
    /// Idempotent: confirming an already active (or since expired) purchase
    /// returns it unchanged, so at-least-once payment callbacks never grant
    /// twice or move the expiry.
    pub async fn confirm_payment(
        &self,
        purchase_id: Uuid,
        payment_ref: &str,
    ) -> Result<PackagePurchase> {
        loop {
            let purchase = self.load(purchase_id).await?;
            match purchase.status {
                PackageStatus::Active | PackageStatus::Expired => {
                    if purchase.payment_ref.as_deref() != Some(payment_ref) {
                        warn!(
                            purchase_id = %purchase_id,
                            payment_ref = %payment_ref,
                            "Payment confirmation with a different reference ignored"
                        );
                    } else {
                        debug!(purchase_id = %purchase_id, "Duplicate payment confirmation ignored");
                    }
                    return Ok(purchase);
                }
                PackageStatus::Cancelled => {
                    return Err(MeteringError::InvalidState(format!(
                        "purchase {purchase_id} was cancelled"
                    )));
                }
                PackageStatus::Pending => {
                    let activated_at = self.clock.now();
                    let expires_at = activated_at + Duration::days(purchase.validity_days as i64);
                    if let Some(active) = self
                        .store
                        .activate_package(purchase_id, payment_ref, activated_at, expires_at)
                        .await?
                    {
                        info!(
                            tenant_id = %active.tenant_id,
                            purchase_id = %purchase_id,
                            expires_at = %expires_at,
                            "Activated package"
                        );
                        return Ok(active);
                    }
                    // Lost a race with another transition; re-read and decide again
                }
            }
        }
    }

    /// Cancel a purchase that has not been paid
    pub async fn cancel(&self, purchase_id: Uuid) -> Result<PackagePurchase> {
        loop {
            let purchase = self.load(purchase_id).await?;
            match purchase.status {
                PackageStatus::Cancelled => return Ok(purchase),
                PackageStatus::Active | PackageStatus::Expired => {
                    return Err(MeteringError::InvalidState(format!(
                        "purchase {purchase_id} is already {}",
                        purchase.status.as_str()
                    )));
                }
                PackageStatus::Pending => {
                    if let Some(cancelled) = self
                        .store
                        .cancel_package(purchase_id, self.clock.now())
                        .await?
                    {
                        info!(purchase_id = %purchase_id, "Cancelled package purchase");
                        return Ok(cancelled);
                    }
                }
            }
        }
    }

    /// Active, unexpired packages in drain order
    pub async fn list_active(
        &self,
        tenant_id: &TenantId,
        pool: QuotaPool,
    ) -> Result<Vec<PackagePurchase>> {
        let now = self.clock.now();
        let mut packages: Vec<_> = self
            .store
            .packages(tenant_id, Some(pool))
            .await?
            .into_iter()
            .filter(|p| p.effective_status(now) == PackageStatus::Active)
            .collect();
        packages.sort_by(drain_order);
        Ok(packages)
    }

    /// Every purchase of a tenant, newest first
    pub async fn list_purchases(&self, tenant_id: &TenantId) -> Result<Vec<PackagePurchase>> {
        let mut packages = self.store.packages(tenant_id, None).await?;
        packages.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(packages)
    }

    /// Mark active packages past their expiry as expired
    pub async fn expire_due(&self) -> Result<Vec<Uuid>> {
        let expired = self.store.expire_packages(self.clock.now()).await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "Marked packages expired");
        }
        Ok(expired)
    }
}
