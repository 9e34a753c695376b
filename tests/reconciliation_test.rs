//! End-to-end passes over the in-memory store with a fixed clock.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use lifecycle_engine::clock::ManualClock;
use lifecycle_engine::error::{LifecycleError, StoreError};
use lifecycle_engine::lifecycle::{
    Contract, ContractStatus, LifecycleConfig, NoticeKind, Reconciler, RecordingNotifier,
    SubscriptionOrganization, SubscriptionStatus,
};
use lifecycle_engine::store::MemoryStore;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    notifier: Arc<RecordingNotifier>,
    reconciler: Reconciler,
}

fn harness_with(now: DateTime<Utc>, config: LifecycleConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(now));
    let notifier = Arc::new(RecordingNotifier::new());
    let reconciler = Reconciler::new(store.clone(), clock.clone(), notifier.clone(), config);
    Harness {
        store,
        clock,
        notifier,
        reconciler,
    }
}

fn harness(now: DateTime<Utc>) -> Harness {
    harness_with(now, LifecycleConfig::default())
}

/// Active contract running 30 days and ending `ends_in` from `now`.
fn contract_ending(id: &str, org: &str, now: DateTime<Utc>, ends_in: Duration) -> Contract {
    let end = now + ends_in;
    Contract::new(id, org, end - Duration::days(30), end)
}

async fn contract_status(h: &Harness, id: &str) -> ContractStatus {
    h.store.contract(id).await.unwrap().status
}

// =============================================================================
// CONTRACTS
// =============================================================================

#[tokio::test]
async fn test_second_pass_without_time_change_transitions_nothing() {
    let now = t0();
    let h = harness(now);
    let expired = contract_ending("c-expired", "org-1", now, -Duration::days(1));
    let renewal = Contract::renewal_for(&expired, "c-renewal", now + Duration::days(29), Some(100.0));
    h.store.insert_contract(expired).await;
    h.store.insert_contract(renewal).await;
    h.store
        .insert_contract(contract_ending("c-soon", "org-1", now, Duration::days(3)))
        .await;
    h.store
        .insert_contract(
            contract_ending("c-frozen", "org-1", now, Duration::days(90))
                .frozen_between(now - Duration::days(14), now - Duration::hours(1)),
        )
        .await;

    let first = h.reconciler.run_contract_lifecycle(None).await.unwrap();
    assert!(first.success);
    assert_eq!(first.expiring_soon.count, 1);
    assert_eq!(first.expired.expired_count, 1);
    assert_eq!(first.expired.cascade_activated_count, 1);
    assert_eq!(first.frozen_or_grace.released_count, 1);

    let second = h.reconciler.run_contract_lifecycle(None).await.unwrap();
    assert!(second.success);
    assert_eq!(second.transitioned(), 0);
    assert_eq!(second.expired.cascade_activated_count, 0);
    assert_eq!(second.final_stats.needs_update.total, 0);
}

#[tokio::test]
async fn test_contracts_move_into_their_windows() {
    let now = t0();
    let h = harness(now);
    for (id, ends_in) in [
        ("c-1", Duration::seconds(1)),
        ("c-2", Duration::days(2)),
        ("c-3", Duration::days(5)),
        ("c-4", Duration::days(5) + Duration::seconds(1)),
        ("c-5", Duration::zero()),
        ("c-6", -Duration::days(3)),
    ] {
        h.store
            .insert_contract(contract_ending(id, "org-1", now, ends_in))
            .await;
    }

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::ExpiringSoon);
    assert_eq!(contract_status(&h, "c-2").await, ContractStatus::ExpiringSoon);
    assert_eq!(contract_status(&h, "c-3").await, ContractStatus::ExpiringSoon);
    assert_eq!(contract_status(&h, "c-4").await, ContractStatus::Active);
    // end_date == now is flagged then expired within the same pass
    assert_eq!(contract_status(&h, "c-5").await, ContractStatus::Expired);
    assert_eq!(contract_status(&h, "c-6").await, ContractStatus::Expired);

    assert_eq!(summary.expiring_soon.count, 4);
    assert_eq!(summary.expired.expired_count, 2);
    assert_eq!(summary.initial_stats.active, 6);
    assert_eq!(summary.final_stats.expiring_soon, 3);
    assert_eq!(summary.final_stats.expired, 2);
}

#[tokio::test]
async fn test_paid_renewal_is_activated_with_its_parent_expiry() {
    let now = t0();
    let h = harness(now);
    let parent = contract_ending("c-1", "org-1", now, -Duration::hours(1));
    let renewal = Contract::renewal_for(&parent, "r-1", now + Duration::days(30), Some(100.0));
    h.store.insert_contract(parent).await;
    h.store.insert_contract(renewal).await;

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Expired);
    assert_eq!(contract_status(&h, "r-1").await, ContractStatus::Active);
    assert_eq!(summary.expired.cascade_activated_count, 1);
    assert_eq!(h.notifier.count(NoticeKind::RenewalActivated), 1);
}

#[tokio::test]
async fn test_unpaid_renewal_stays_pending() {
    let now = t0();
    let h = harness(now);
    let parent = contract_ending("c-1", "org-1", now, -Duration::hours(1));
    let renewal = Contract::renewal_for(&parent, "r-1", now + Duration::days(30), None);
    h.store.insert_contract(parent).await;
    h.store.insert_contract(renewal).await;

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert!(summary.success);
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Expired);
    assert_eq!(contract_status(&h, "r-1").await, ContractStatus::Pending);
    assert_eq!(summary.expired.expired_count, 1);
    assert_eq!(summary.expired.cascade_activated_count, 0);
}

#[tokio::test]
async fn test_failed_renewal_write_rolls_back_parent_expiry() {
    let now = t0();
    let h = harness(now);
    let parent = contract_ending("c-1", "org-1", now, -Duration::hours(1));
    let renewal = Contract::renewal_for(&parent, "r-1", now + Duration::days(30), Some(40.0));
    h.store.insert_contract(parent).await;
    h.store.insert_contract(renewal).await;
    h.store.fail_writes_for("r-1");

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.expired.errors.len(), 1);
    assert_eq!(summary.expired.errors[0].entity_id, "c-1");
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Active);
    assert_eq!(contract_status(&h, "r-1").await, ContractStatus::Pending);
}

#[tokio::test]
async fn test_freeze_release_boundary() {
    let now = t0();
    let h = harness(now);
    h.store
        .insert_contract(
            contract_ending("c-due", "org-1", now, Duration::days(60))
                .frozen_between(now - Duration::days(10), now - Duration::seconds(1)),
        )
        .await;
    h.store
        .insert_contract(
            contract_ending("c-held", "org-1", now, Duration::days(60))
                .frozen_between(now - Duration::days(10), now + Duration::seconds(1)),
        )
        .await;

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    let released = h.store.contract("c-due").await.unwrap();
    assert_eq!(released.status, ContractStatus::Active);
    assert_eq!(released.freeze_start_date, None);
    assert_eq!(released.freeze_end_date, None);

    let held = h.store.contract("c-held").await.unwrap();
    assert_eq!(held.status, ContractStatus::Frozen);
    assert!(held.has_freeze_window());

    assert_eq!(summary.frozen_or_grace.released_count, 1);
    assert_eq!(summary.frozen_or_grace.still_pending_count, 1);
}

#[tokio::test]
async fn test_one_failing_entity_does_not_stop_the_batch() {
    let now = t0();
    let h = harness(now);
    for id in ["c-1", "c-2", "c-3"] {
        h.store
            .insert_contract(contract_ending(id, "org-1", now, -Duration::days(1)))
            .await;
    }
    h.store.fail_writes_for("c-2");

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert!(!summary.success);
    assert!(summary.expired.processed);
    assert_eq!(summary.expired.expired_count, 2);
    assert_eq!(summary.expired.errors.len(), 1);
    assert_eq!(summary.expired.errors[0].entity_id, "c-2");
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Expired);
    assert_eq!(contract_status(&h, "c-2").await, ContractStatus::Active);
    assert_eq!(contract_status(&h, "c-3").await, ContractStatus::Expired);
    // Later stages still ran
    assert!(summary.frozen_or_grace.processed);
}

#[tokio::test]
async fn test_contract_full_cycle_with_paid_renewal() {
    let h = harness(t0() + Duration::days(25));
    let contract = Contract::new("c-1", "org-1", t0(), t0() + Duration::days(30));
    let renewal = Contract::renewal_for(&contract, "r-1", t0() + Duration::days(60), Some(50.0));
    h.store.insert_contract(contract).await;
    h.store.insert_contract(renewal).await;

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();
    assert_eq!(summary.expiring_soon.count, 1);
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::ExpiringSoon);
    assert_eq!(contract_status(&h, "r-1").await, ContractStatus::Pending);

    h.clock.set(t0() + Duration::days(31));
    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();
    assert_eq!(summary.expired.expired_count, 1);
    assert_eq!(summary.expired.cascade_activated_count, 1);
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Expired);
    assert_eq!(contract_status(&h, "r-1").await, ContractStatus::Active);

    assert_eq!(h.notifier.count(NoticeKind::ContractExpiringSoon), 1);
    assert_eq!(h.notifier.count(NoticeKind::ContractExpired), 1);
}

#[tokio::test]
async fn test_contract_grace_delays_expiry() {
    let now = t0();
    let config = LifecycleConfig {
        contracts: lifecycle_engine::lifecycle::DomainWindows::days(5, 2),
        ..LifecycleConfig::default()
    };
    let h = harness_with(now, config);
    h.store
        .insert_contract(contract_ending("c-1", "org-1", now, -Duration::days(1)))
        .await;
    h.store
        .insert_contract(contract_ending("c-2", "org-1", now, -Duration::days(3)))
        .await;

    h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Active);
    assert_eq!(contract_status(&h, "c-2").await, ContractStatus::Expired);
}

#[tokio::test]
async fn test_tenant_scope_leaves_other_organizations_alone() {
    let now = t0();
    let h = harness(now);
    h.store
        .insert_contract(contract_ending("c-1", "org-1", now, -Duration::days(1)))
        .await;
    h.store
        .insert_contract(contract_ending("c-2", "org-2", now, -Duration::days(1)))
        .await;

    let summary = h.reconciler.run_contract_lifecycle(Some("org-1")).await.unwrap();

    assert_eq!(summary.tenant.as_deref(), Some("org-1"));
    assert_eq!(summary.expired.expired_count, 1);
    assert_eq!(summary.initial_stats.total, 1);
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Expired);
    assert_eq!(contract_status(&h, "c-2").await, ContractStatus::Active);
}

#[tokio::test]
async fn test_deleted_contracts_are_never_touched() {
    let now = t0();
    let h = harness(now);
    let mut deleted = contract_ending("c-1", "org-1", now, -Duration::days(1));
    deleted.deleted_at = Some(now - Duration::days(2));
    h.store.insert_contract(deleted).await;

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert_eq!(summary.transitioned(), 0);
    assert_eq!(summary.initial_stats.total, 0);
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Active);
}

#[tokio::test]
async fn test_dry_run_reports_without_writing() {
    let now = t0();
    let config = LifecycleConfig {
        dry_run: true,
        ..LifecycleConfig::default()
    };
    let h = harness_with(now, config);
    h.store
        .insert_contract(contract_ending("c-1", "org-1", now, Duration::days(1)))
        .await;

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert!(summary.dry_run);
    assert_eq!(summary.expiring_soon.count, 1);
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Active);
    assert!(h.notifier.notices().is_empty());
}

// =============================================================================
// FAILURE TIERS
// =============================================================================

#[tokio::test]
async fn test_scan_failure_marks_stages_unprocessed_but_returns_summary() {
    let now = t0();
    let h = harness(now);
    h.store
        .insert_contract(contract_ending("c-1", "org-1", now, -Duration::days(1)))
        .await;
    h.store.set_finds_unavailable(true);

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert!(!summary.success);
    assert!(!summary.expiring_soon.processed);
    assert!(!summary.expired.processed);
    assert!(!summary.frozen_or_grace.processed);
    assert_eq!(summary.expired.expired_count, 0);
    assert!(summary.expired.error.is_some());
    assert_eq!(contract_status(&h, "c-1").await, ContractStatus::Active);
}

#[tokio::test]
async fn test_unreachable_store_is_fatal() {
    let h = harness(t0());
    h.store.set_scans_unavailable(true);

    let err = h.reconciler.run_contract_lifecycle(None).await.unwrap_err();

    assert!(matches!(err, LifecycleError::Store(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn test_slow_transactions_are_reported_per_entity() {
    let now = t0();
    let config = LifecycleConfig {
        transaction_timeout: std::time::Duration::from_millis(20),
        ..LifecycleConfig::default()
    };
    let h = harness_with(now, config);
    h.store
        .insert_contract(contract_ending("c-1", "org-1", now, -Duration::days(1)))
        .await;
    h.store.set_transaction_delay(Some(std::time::Duration::from_millis(200)));

    let summary = h.reconciler.run_contract_lifecycle(None).await.unwrap();

    assert!(!summary.success);
    assert_eq!(summary.expired.errors.len(), 1);
    assert!(summary.expired.errors[0].error.contains("timed out"));
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[tokio::test]
async fn test_grace_period_boundary() {
    let now = t0();
    let h = harness(now);
    let ended = now - Duration::days(8);
    h.store
        .insert_subscription(
            SubscriptionOrganization::new("s-over", "org-1", ended - Duration::days(365), ended)
                .in_grace_period(ended, now - Duration::seconds(1)),
        )
        .await;
    h.store
        .insert_subscription(
            SubscriptionOrganization::new("s-held", "org-2", ended - Duration::days(365), ended)
                .in_grace_period(ended, now + Duration::seconds(1)),
        )
        .await;

    let summary = h.reconciler.run_subscription_lifecycle().await.unwrap();

    let over = h.store.subscription("s-over").await.unwrap();
    assert_eq!(over.status, SubscriptionStatus::Inactive);
    assert!(over.metadata.access_suspended());
    assert_eq!(over.metadata.grace_period_ended, Some(true));
    assert!(!over.is_active);

    let held = h.store.subscription("s-held").await.unwrap();
    assert_eq!(held.status, SubscriptionStatus::Expired);
    assert!(!held.metadata.access_suspended());

    assert_eq!(summary.frozen_or_grace.released_count, 1);
    assert_eq!(summary.frozen_or_grace.still_pending_count, 1);
    assert_eq!(h.notifier.count(NoticeKind::SubscriptionAccessSuspended), 1);
}

#[tokio::test]
async fn test_subscription_full_cycle() {
    let h = harness(t0() + Duration::days(25));
    h.store
        .insert_subscription(SubscriptionOrganization::new(
            "s-1",
            "org-1",
            t0() - Duration::days(335),
            t0() + Duration::days(30),
        ))
        .await;

    let summary = h.reconciler.run_subscription_lifecycle().await.unwrap();
    assert_eq!(summary.expiring_soon.count, 1);
    let sub = h.store.subscription("s-1").await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert!(sub.metadata.warning_sent());

    // Warning is not repeated
    h.clock.set(t0() + Duration::days(27));
    let summary = h.reconciler.run_subscription_lifecycle().await.unwrap();
    assert_eq!(summary.transitioned(), 0);

    h.clock.set(t0() + Duration::days(31));
    let summary = h.reconciler.run_subscription_lifecycle().await.unwrap();
    assert_eq!(summary.expired.expired_count, 1);
    let sub = h.store.subscription("s-1").await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Expired);
    assert!(sub.is_active);
    assert_eq!(sub.metadata.grace_period_end, Some(t0() + Duration::days(38)));

    h.clock.set(t0() + Duration::days(38));
    let summary = h.reconciler.run_subscription_lifecycle().await.unwrap();
    assert_eq!(summary.frozen_or_grace.released_count, 1);
    let sub = h.store.subscription("s-1").await.unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Inactive);
    assert!(sub.metadata.access_suspended());

    assert_eq!(h.notifier.count(NoticeKind::SubscriptionExpiringSoon), 1);
    assert_eq!(h.notifier.count(NoticeKind::SubscriptionGracePeriodStarted), 1);
    assert_eq!(h.notifier.count(NoticeKind::SubscriptionAccessSuspended), 1);
}

#[tokio::test]
async fn test_subscription_metadata_extras_survive_transitions() {
    let now = t0();
    let h = harness(now);
    let mut sub = SubscriptionOrganization::new("s-1", "org-1", now - Duration::days(360), now + Duration::days(2));
    sub.metadata
        .extra
        .insert("billingProvider".to_string(), serde_json::json!("stripe"));
    h.store.insert_subscription(sub).await;

    h.reconciler.run_subscription_lifecycle().await.unwrap();

    let sub = h.store.subscription("s-1").await.unwrap();
    assert!(sub.metadata.warning_sent());
    assert_eq!(sub.metadata.extra["billingProvider"], "stripe");
}
