//! Concurrent debits against one (tenant, pool) must never oversell.

mod common;

use common::Harness;
use futures::future::join_all;
use metering_ledger::{Correlation, MeteringError, QuotaPool};
use rand::Rng;

/// Split `total` into random chunks of 1..=max
fn random_chunks(total: u64, max: u64) -> Vec<u64> {
    let mut rng = rand::thread_rng();
    let mut chunks = Vec::new();
    let mut left = total;
    while left > 0 {
        let chunk = rng.gen_range(1..=max.min(left));
        chunks.push(chunk);
        left -= chunk;
    }
    chunks
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_use_exact_capacity() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;
    h.active_package(&tenant, QuotaPool::AiUnits, "ai-100").await;
    h.active_package(&tenant, QuotaPool::AiUnits, "ai-100").await;

    let chunks = random_chunks(1200, 40);
    let tasks = chunks.iter().map(|&amount| {
        let service = h.service.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move {
            service
                .consume(&tenant, QuotaPool::AiUnits, amount, Correlation::new())
                .await
        })
    });

    for result in join_all(tasks).await {
        result.expect("task completes").expect("debit within capacity succeeds");
    }

    let err = h
        .service
        .consume(&tenant, QuotaPool::AiUnits, 1, Correlation::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MeteringError::InsufficientQuota { available: 0, .. }));

    let snapshot = h.store.snapshot();
    assert_eq!(snapshot.records.len(), chunks.len());
    assert_eq!(snapshot.records.iter().map(|r| r.amount).sum::<u64>(), 1200);
    assert!(snapshot.packages.iter().all(|p| p.consumed == 100));

    let report = h.service.reconcile_tenant(&tenant).await.unwrap();
    assert!(report.is_consistent(), "{report:?}");
    assert_eq!(report.records_checked, chunks.len() as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversubscribed_debits_never_oversell() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "growth").await;
    h.active_package(&tenant, QuotaPool::AiUnits, "ai-100").await;
    h.active_package(&tenant, QuotaPool::AiUnits, "ai-100").await;

    // 100 x 20 units against 1200 units of capacity
    let tasks = (0..100).map(|_| {
        let service = h.service.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move {
            service
                .consume(&tenant, QuotaPool::AiUnits, 20, Correlation::new())
                .await
        })
    });

    let mut granted = 0u64;
    let mut denied = 0;
    for result in join_all(tasks).await {
        match result.expect("task completes") {
            Ok(record) => granted += record.amount,
            Err(MeteringError::InsufficientQuota { .. }) => denied += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(granted, 1200);
    assert_eq!(denied, 40);
    let report = h.service.reconcile_tenant(&tenant).await.unwrap();
    assert!(report.is_consistent(), "{report:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_share_capacity() {
    let h = Harness::new();
    let tenant = h.tenant("acme", "starter").await;

    // 10 x 50 units against a 200 unit allotment
    let tasks = (0..10).map(|_| {
        let service = h.service.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move {
            service
                .reserve(&tenant, QuotaPool::AiUnits, 50, Correlation::new())
                .await
        })
    });

    let held: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|result| result.expect("task completes").ok())
        .collect();
    assert_eq!(held.len(), 4);

    for reservation in &held {
        h.service.commit(reservation.id, 50).await.unwrap();
    }
    let decision = h.service.check_access(&tenant, QuotaPool::AiUnits).await.unwrap();
    assert_eq!(decision.included_remaining, 0);
}
