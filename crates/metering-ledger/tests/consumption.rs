//! Integration tests for debiting consumption against the ledger.

mod common;

use chrono::Duration;
use common::{at, Harness};
use metering_ledger::{AccessReason, Correlation, MeteringError, PackageDebit, QuotaPool, TenantId};
use rust_decimal_macros::dec;

// ==================== Source Order ====================

#[tokio::test]
async fn test_included_then_closest_expiry_package() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;

    h.service
        .consume(&tenant, QuotaPool::AiUnits, 950, Correlation::new())
        .await
        .unwrap();
    let package = h.active_package(&tenant, QuotaPool::AiUnits, "ai-70").await;
    assert_eq!(package.expires_at, Some(h.service.now() + Duration::days(3)));

    let record = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 120, Correlation::new())
        .await
        .unwrap();

    assert_eq!(record.breakdown.included, 50);
    assert_eq!(
        record.breakdown.packages,
        vec![PackageDebit { purchase_id: package.id, amount: 70 }]
    );
    assert_eq!(record.breakdown.overage, 0);
    assert!(record.cost.is_zero());

    let decision = h.service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, AccessReason::QuotaExhausted);
}

#[tokio::test]
async fn test_packages_drain_closest_to_expiry_first() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;

    // Bought first but expires later
    let later = h.active_package(&tenant, QuotaPool::AiUnits, "ai-100-10d").await;
    let sooner = h.active_package(&tenant, QuotaPool::AiUnits, "ai-100-5d").await;

    let first = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 80, Correlation::new())
        .await
        .unwrap();
    assert_eq!(
        first.breakdown.packages,
        vec![PackageDebit { purchase_id: sooner.id, amount: 80 }]
    );

    let second = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 50, Correlation::new())
        .await
        .unwrap();
    assert_eq!(
        second.breakdown.packages,
        vec![
            PackageDebit { purchase_id: sooner.id, amount: 20 },
            PackageDebit { purchase_id: later.id, amount: 30 },
        ]
    );

    let active = h
        .service
        .list_active_packages(&tenant, QuotaPool::AiUnits)
        .await
        .unwrap();
    let remaining: Vec<_> = active.iter().map(|p| (p.id, p.remaining())).collect();
    assert_eq!(remaining, vec![(sooner.id, 0), (later.id, 70)]);
}

// ==================== Denials ====================

#[tokio::test]
async fn test_denied_consumption_changes_nothing() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;

    h.service
        .consume(&tenant, QuotaPool::AiUnits, 950, Correlation::new())
        .await
        .unwrap();
    h.active_package(&tenant, QuotaPool::AiUnits, "ai-70").await;

    let before = h.snapshot_bytes();
    let err = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 200, Correlation::new())
        .await
        .unwrap_err();

    match err {
        MeteringError::InsufficientQuota {
            pool,
            requested,
            available,
        } => {
            assert_eq!(pool, QuotaPool::AiUnits);
            assert_eq!(requested, 200);
            assert_eq!(available, 120);
        }
        other => panic!("expected InsufficientQuota, got {other:?}"),
    }
    assert_eq!(h.snapshot_bytes(), before);
}

#[tokio::test]
async fn test_zero_amount_is_rejected() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;

    let err = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 0, Correlation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::InvalidAmount(_)));
    assert!(h.store.snapshot().records.is_empty());
}

#[tokio::test]
async fn test_unknown_tenant() {
    let h = Harness::new();
    let ghost = TenantId::new("ghost");

    let err = h
        .service
        .consume(&ghost, QuotaPool::AiUnits, 1, Correlation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::TenantNotFound(_)));

    let decision = h.service.check_access(&ghost, QuotaPool::AiUnits).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, AccessReason::UnknownTenant);
}

// ==================== Overage ====================

#[tokio::test]
async fn test_overage_is_billed() {
    let h = Harness::new();
    let tenant = h.tenant_with_overage("acme", "growth").await;

    let record = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 3500, Correlation::new())
        .await
        .unwrap();

    assert_eq!(record.breakdown.included, 1000);
    assert_eq!(record.breakdown.overage, 2500);
    assert_eq!(record.cost.base.amount, dec!(25.00));
    assert_eq!(record.cost.base.currency.as_str(), "USD");

    let decision = h.service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, AccessReason::Overage);
}

#[tokio::test]
async fn test_overage_toggle_applies_to_next_debit() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;
    h.service
        .consume(&tenant, QuotaPool::AiUnits, 1000, Correlation::new())
        .await
        .unwrap();

    assert!(h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 10, Correlation::new())
        .await
        .is_err());

    h.service
        .set_overage(&tenant, QuotaPool::AiUnits, true)
        .await
        .unwrap();
    let record = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 10, Correlation::new())
        .await
        .unwrap();
    assert_eq!(record.breakdown.overage, 10);
    assert_eq!(record.cost.base.amount, dec!(0.10));
}

// ==================== Pools And Periods ====================

#[tokio::test]
async fn test_pools_are_independent() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;

    h.service
        .consume(&tenant, QuotaPool::AiUnits, 1000, Correlation::new())
        .await
        .unwrap();

    let retrieval = h
        .service
        .check_access(&tenant, QuotaPool::Retrieval)
        .await
        .unwrap();
    assert!(retrieval.allowed);
    assert_eq!(retrieval.included_remaining, 500);

    let record = h
        .service
        .consume(&tenant, QuotaPool::Retrieval, 500, Correlation::new())
        .await
        .unwrap();
    assert_eq!(record.breakdown.included, 500);

    // No allotment for images and no packages
    let image = h.service.check_access(&tenant, QuotaPool::Image).await.unwrap();
    assert!(!image.allowed);
}

#[tokio::test]
async fn test_period_rollover_restores_allotment() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;

    let october = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 1000, Correlation::new())
        .await
        .unwrap();
    assert_eq!(october.period_key.as_str(), "2026-10");
    assert!(h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 1, Correlation::new())
        .await
        .is_err());

    h.clock.set(at(2026, 11, 1, 0));
    let november = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 1000, Correlation::new())
        .await
        .unwrap();
    assert_eq!(november.period_key.as_str(), "2026-11");
    assert_eq!(november.breakdown.included, 1000);
}

// ==================== Expiry ====================

#[tokio::test]
async fn test_expired_package_is_skipped_before_sweep() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;
    let expiring = h.active_package(&tenant, QuotaPool::AiUnits, "ai-70").await;
    let lasting = h.active_package(&tenant, QuotaPool::AiUnits, "ai-100").await;

    h.advance(Duration::days(3) + Duration::seconds(1));

    let record = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 50, Correlation::new())
        .await
        .unwrap();
    assert_eq!(
        record.breakdown.packages,
        vec![PackageDebit { purchase_id: lasting.id, amount: 50 }]
    );

    let err = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 51, Correlation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::InsufficientQuota { available: 50, .. }));

    let swept = h.service.expire_packages().await.unwrap();
    assert_eq!(swept, vec![expiring.id]);
}

#[tokio::test]
async fn test_package_is_consumable_at_its_expiry_instant() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "payg").await;
    let package = h.active_package(&tenant, QuotaPool::AiUnits, "ai-70").await;

    h.clock.set(package.expires_at.unwrap());
    let record = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 10, Correlation::new())
        .await
        .unwrap();
    assert_eq!(record.breakdown.package_total(), 10);

    h.advance(Duration::milliseconds(1));
    assert!(h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 10, Correlation::new())
        .await
        .is_err());
}

// ==================== Idempotency ====================

#[tokio::test]
async fn test_idempotency_key_replays_original_record() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;

    let correlation = Correlation::new()
        .with_idempotency_key("req-42")
        .with_model("gpt-4o")
        .with_attribute("agent_id", "support-bot");
    let first = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 300, correlation.clone())
        .await
        .unwrap();
    let replay = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 300, correlation)
        .await
        .unwrap();

    assert_eq!(first, replay);
    assert_eq!(h.store.snapshot().records.len(), 1);

    let decision = h.service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert_eq!(decision.included_remaining, 700);

    let found = h
        .service
        .record_by_idempotency_key(&tenant, "req-42")
        .await
        .unwrap();
    assert_eq!(found.map(|r| r.id), Some(first.id));
}

#[tokio::test]
async fn test_idempotency_keys_are_scoped_per_tenant() {
    let h = Harness::new();
    let acme = h.tenant("acme", "growth").await;
    let globex = h.tenant("globex", "growth").await;

    let key = Correlation::new().with_idempotency_key("req-1");
    let a = h
        .service
        .consume(&acme, QuotaPool::AiUnits, 10, key.clone())
        .await
        .unwrap();
    let b = h
        .service
        .consume(&globex, QuotaPool::AiUnits, 10, key)
        .await
        .unwrap();

    assert_ne!(a.id, b.id);
    assert_eq!(h.store.snapshot().records.len(), 2);
}

#[tokio::test]
async fn test_idempotency_key_reused_for_different_request() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;
    let key = Correlation::new().with_idempotency_key("req-7");

    let first = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 300, key.clone())
        .await
        .unwrap();
    let before = h.snapshot_bytes();

    let err = h
        .service
        .consume(&tenant, QuotaPool::Retrieval, 5, key.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::InvalidState(_)));

    let err = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 301, key.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::InvalidState(_)));
    assert_eq!(h.snapshot_bytes(), before);

    let replay = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 300, key)
        .await
        .unwrap();
    assert_eq!(replay, first);
}

// ==================== Access Gate ====================

#[tokio::test]
async fn test_access_falls_through_to_packages() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;
    h.service
        .consume(&tenant, QuotaPool::AiUnits, 1000, Correlation::new())
        .await
        .unwrap();
    h.active_package(&tenant, QuotaPool::AiUnits, "ai-70").await;
    h.active_package(&tenant, QuotaPool::AiUnits, "ai-100").await;

    let decision = h.service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.reason, AccessReason::PackageQuota);
    assert_eq!(decision.included_remaining, 0);
    assert_eq!(decision.packages_remaining, 170);
    assert_eq!(decision.available(), 170);

    // ai-70 lapses; the sweep has not run yet
    h.advance(Duration::days(3) + Duration::seconds(1));
    let decision = h.service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert_eq!(decision.reason, AccessReason::PackageQuota);
    assert_eq!(decision.packages_remaining, 100);

    // ai-100 lapses too, still within October
    h.advance(Duration::days(27));
    let decision = h.service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert!(!decision.allowed);
    assert_eq!(decision.reason, AccessReason::QuotaExhausted);
    assert_eq!(decision.packages_remaining, 0);
}
