//! EventStore interface tests.
//!
//! These tests verify the contract of the EventStore trait.
//! Each version store implementation should run these tests.

use std::sync::Arc;

use eventide::store::{CasOutcome, EventStore, StorageError};

// =============================================================================
// EventStore::get_version tests
// =============================================================================

pub async fn test_get_nonexistent<S: EventStore>(store: &S) {
    let version = store
        .get_version("Blog", "nonexistent")
        .await
        .expect("get_version should succeed");
    assert!(version.is_none(), "unknown aggregate should have no version");
}

// =============================================================================
// EventStore::compare_and_set_version tests
// =============================================================================

pub async fn test_first_write_from_absent<S: EventStore>(store: &S) {
    let outcome = store
        .compare_and_set_version("Blog", "agg_first", None, 1)
        .await
        .expect("cas should succeed");
    assert_eq!(outcome, CasOutcome::Swapped);
    assert_eq!(store.get_version("Blog", "agg_first").await.unwrap(), Some(1));
}

pub async fn test_advance_from_expected<S: EventStore>(store: &S) {
    let agg = "agg_advance";
    store.compare_and_set_version("Blog", agg, None, 1).await.unwrap();
    let outcome = store
        .compare_and_set_version("Blog", agg, Some(1), 2)
        .await
        .unwrap();
    assert_eq!(outcome, CasOutcome::Swapped);
    assert_eq!(store.get_version("Blog", agg).await.unwrap(), Some(2));
}

pub async fn test_stale_expectation_conflicts<S: EventStore>(store: &S) {
    let agg = "agg_conflict";
    store.compare_and_set_version("Blog", agg, None, 1).await.unwrap();
    store.compare_and_set_version("Blog", agg, Some(1), 2).await.unwrap();

    let outcome = store
        .compare_and_set_version("Blog", agg, Some(1), 2)
        .await
        .unwrap();
    assert_eq!(outcome, CasOutcome::Conflict { actual: Some(2) });

    let outcome = store
        .compare_and_set_version("Blog", agg, None, 1)
        .await
        .unwrap();
    assert_eq!(outcome, CasOutcome::Conflict { actual: Some(2) });
    assert_eq!(store.get_version("Blog", agg).await.unwrap(), Some(2));
}

pub async fn test_expected_version_on_absent_record_conflicts<S: EventStore>(store: &S) {
    let outcome = store
        .compare_and_set_version("Blog", "agg_absent", Some(3), 4)
        .await
        .unwrap();
    assert_eq!(outcome, CasOutcome::Conflict { actual: None });
}

pub async fn test_non_monotonic_is_rejected<S: EventStore>(store: &S) {
    let err = store
        .compare_and_set_version("Blog", "agg_backwards", Some(5), 5)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NonMonotonic { .. }));

    let err = store
        .compare_and_set_version("Blog", "agg_backwards", None, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NonMonotonic { .. }));
}

pub async fn test_gap_writes_are_allowed<S: EventStore>(store: &S) {
    let agg = "agg_gap";
    let outcome = store
        .compare_and_set_version("Blog", agg, None, 7)
        .await
        .unwrap();
    assert_eq!(outcome, CasOutcome::Swapped, "store does not judge ordering");
    assert_eq!(store.get_version("Blog", agg).await.unwrap(), Some(7));
}

// =============================================================================
// Isolation tests
// =============================================================================

pub async fn test_scope_isolation<S: EventStore>(store: &S) {
    let agg = "agg_scoped";
    store.compare_and_set_version("Blog", agg, None, 3).await.unwrap();
    store.compare_and_set_version("Comment", agg, None, 1).await.unwrap();

    assert_eq!(store.get_version("Blog", agg).await.unwrap(), Some(3));
    assert_eq!(store.get_version("Comment", agg).await.unwrap(), Some(1));
    assert_eq!(store.get_version("User", agg).await.unwrap(), None);
}

pub async fn test_aggregate_isolation<S: EventStore>(store: &S) {
    store.compare_and_set_version("User", "agg_iso_1", None, 1).await.unwrap();
    store.compare_and_set_version("User", "agg_iso_2", None, 4).await.unwrap();

    assert_eq!(store.get_version("User", "agg_iso_1").await.unwrap(), Some(1));
    assert_eq!(store.get_version("User", "agg_iso_2").await.unwrap(), Some(4));
}

// =============================================================================
// Concurrency tests
// =============================================================================

/// Concurrent writers racing from the same expectation: exactly one wins.
pub async fn test_concurrent_cas_single_winner<S: EventStore + 'static>(store: Arc<S>) {
    let agg = "agg_race";
    store.compare_and_set_version("Blog", agg, None, 1).await.unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .compare_and_set_version("Blog", agg, Some(1), 2)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap() == CasOutcome::Swapped {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one writer should win");
    assert_eq!(store.get_version("Blog", agg).await.unwrap(), Some(2));
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all EventStore interface tests against a store implementation.
///
/// Takes an `Arc` of the store.
#[macro_export]
macro_rules! run_event_store_tests {
    ($store:expr) => {
        use $crate::store::event_store_tests::*;

        let store = $store;

        test_get_nonexistent(&*store).await;
        println!("  test_get_nonexistent: PASSED");

        test_first_write_from_absent(&*store).await;
        println!("  test_first_write_from_absent: PASSED");

        test_advance_from_expected(&*store).await;
        println!("  test_advance_from_expected: PASSED");

        test_stale_expectation_conflicts(&*store).await;
        println!("  test_stale_expectation_conflicts: PASSED");

        test_expected_version_on_absent_record_conflicts(&*store).await;
        println!("  test_expected_version_on_absent_record_conflicts: PASSED");

        test_non_monotonic_is_rejected(&*store).await;
        println!("  test_non_monotonic_is_rejected: PASSED");

        test_gap_writes_are_allowed(&*store).await;
        println!("  test_gap_writes_are_allowed: PASSED");

        test_scope_isolation(&*store).await;
        println!("  test_scope_isolation: PASSED");

        test_aggregate_isolation(&*store).await;
        println!("  test_aggregate_isolation: PASSED");

        test_concurrent_cas_single_winner(store.clone()).await;
        println!("  test_concurrent_cas_single_winner: PASSED");
    };
}
