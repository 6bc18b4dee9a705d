//! Integration tests for the package purchase lifecycle.

mod common;

use chrono::Duration;
use common::Harness;
use metering_ledger::{
    Correlation, Currency, MeteringError, PackageStatus, QuotaPool, Tenant, TenantId,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn test_purchase_starts_pending_and_is_not_consumable() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;

    let pending = h
        .service
        .purchase_package(&tenant, QuotaPool::AiUnits, "ai-100")
        .await
        .unwrap();

    assert_eq!(pending.status, PackageStatus::Pending);
    assert_eq!(pending.quantity, 100);
    assert_eq!(pending.validity_days, 30);
    assert!(pending.expires_at.is_none());
    assert_eq!(pending.price.base.amount, dec!(5.00));

    let err = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 1, Correlation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::InsufficientQuota { available: 0, .. }));
    assert!(h
        .service
        .list_active_packages(&tenant, QuotaPool::AiUnits)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_confirm_payment_is_idempotent() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;
    let pending = h
        .service
        .purchase_package(&tenant, QuotaPool::AiUnits, "ai-100")
        .await
        .unwrap();

    let active = h.service.confirm_payment(pending.id, "pay-1").await.unwrap();
    assert_eq!(active.status, PackageStatus::Active);
    assert_eq!(active.payment_ref.as_deref(), Some("pay-1"));
    assert_eq!(active.activated_at, Some(h.service.now()));
    assert_eq!(active.expires_at, Some(h.service.now() + Duration::days(30)));

    // A retried callback a day later must not move the expiry or grant again
    h.advance(Duration::days(1));
    let again = h.service.confirm_payment(pending.id, "pay-1").await.unwrap();
    assert_eq!(again, active);

    let purchases = h.service.list_purchases(&tenant).await.unwrap();
    assert_eq!(purchases.len(), 1);
    assert_eq!(purchases[0].remaining(), 100);
}

#[tokio::test]
async fn test_cancel_pending_purchase() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;
    let pending = h
        .service
        .purchase_package(&tenant, QuotaPool::AiUnits, "ai-100")
        .await
        .unwrap();

    let cancelled = h.service.cancel_purchase(pending.id).await.unwrap();
    assert_eq!(cancelled.status, PackageStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());

    // Cancelling twice is harmless, confirming afterwards is not allowed
    assert_eq!(h.service.cancel_purchase(pending.id).await.unwrap(), cancelled);
    let err = h.service.confirm_payment(pending.id, "pay-late").await.unwrap_err();
    assert!(matches!(err, MeteringError::InvalidState(_)));
}

#[tokio::test]
async fn test_cannot_cancel_active_purchase() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;
    let active = h.active_package(&tenant, QuotaPool::AiUnits, "ai-100").await;

    let err = h.service.cancel_purchase(active.id).await.unwrap_err();
    assert!(matches!(err, MeteringError::InvalidState(_)));
}

#[tokio::test]
async fn test_expiry_sweep_forfeits_remainder() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;
    let package = h.active_package(&tenant, QuotaPool::AiUnits, "ai-70").await;

    h.service
        .consume(&tenant, QuotaPool::AiUnits, 20, Correlation::new())
        .await
        .unwrap();

    // Nothing is due before the expiry instant has passed
    h.clock.set(package.expires_at.unwrap());
    assert!(h.service.expire_packages().await.unwrap().is_empty());

    h.advance(Duration::seconds(1));
    let report = h.service.sweep().await.unwrap();
    assert_eq!(report.expired_packages, vec![package.id]);
    assert!(report.expired_reservations.is_empty());

    let purchases = h.service.list_purchases(&tenant).await.unwrap();
    assert_eq!(purchases[0].status, PackageStatus::Expired);
    assert_eq!(purchases[0].consumed, 20);

    // A second sweep finds nothing new
    assert!(h.service.expire_packages().await.unwrap().is_empty());

    // Confirming an expired purchase returns it unchanged
    let confirmed = h
        .service
        .confirm_payment(package.id, &format!("pay-{}", package.id))
        .await
        .unwrap();
    assert_eq!(confirmed.status, PackageStatus::Expired);
}

#[tokio::test]
async fn test_purchase_validation() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;

    let wrong_pool = h
        .service
        .purchase_package(&tenant, QuotaPool::AiUnits, "image-50")
        .await
        .unwrap_err();
    assert!(matches!(wrong_pool, MeteringError::InvalidPool(_)));

    let unknown = h
        .service
        .purchase_package(&tenant, QuotaPool::AiUnits, "ai-1m")
        .await
        .unwrap_err();
    assert!(matches!(unknown, MeteringError::PackageNotFound(_)));

    let no_tenant = h
        .service
        .purchase_package(&TenantId::new("ghost"), QuotaPool::AiUnits, "ai-100")
        .await
        .unwrap_err();
    assert!(matches!(no_tenant, MeteringError::TenantNotFound(_)));

    let missing = h.service.confirm_payment(Uuid::new_v4(), "pay").await.unwrap_err();
    assert!(matches!(missing, MeteringError::PackageNotFound(_)));
}

#[tokio::test]
async fn test_price_in_tenant_currency() {
    let h = Harness::new();
    let tenant = h
        .register(Tenant::new("seoul", "payg", "KRW".parse::<Currency>().unwrap()))
        .await;

    let pending = h
        .service
        .purchase_package(&tenant, QuotaPool::AiUnits, "ai-100")
        .await
        .unwrap();

    assert_eq!(pending.price.base.amount, dec!(5.00));
    assert_eq!(pending.price.local.amount, dec!(6750));
    assert_eq!(pending.price.local.currency.as_str(), "KRW");
}

#[tokio::test]
async fn test_image_package_uses_pool_validity() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;

    let package = h.active_package(&tenant, QuotaPool::Image, "image-50").await;
    assert_eq!(package.validity_days, 90);

    let record = h
        .service
        .consume(&tenant, QuotaPool::Image, 5, Correlation::new())
        .await
        .unwrap();
    assert_eq!(record.breakdown.package_total(), 5);
}
