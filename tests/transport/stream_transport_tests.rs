//! StreamTransport interface tests.
//!
//! These tests verify the contract of the StreamTransport trait.
//! Each transport implementation should run these tests. Every test uses its
//! own consumer groups so they can share one transport instance.

use std::time::Duration;

use eventide::subject::Subject;
use eventide::transport::{
    GroupCreation, ReadCursor, StartPosition, StreamTransport, TransportError, TrimPolicy,
};

async fn read_new<T: StreamTransport>(
    transport: &T,
    subject: Subject,
    group: &str,
    consumer: &str,
) -> Vec<eventide::event::StreamEntry> {
    transport
        .read_group(subject, group, consumer, ReadCursor::New, 10, Duration::ZERO)
        .await
        .expect("read should succeed")
}

// =============================================================================
// Provisioning
// =============================================================================

pub async fn test_ensure_stream_is_idempotent<T: StreamTransport>(transport: &T) {
    let subject = Subject::UserCreated;
    transport
        .ensure_stream(subject, "event-admin")
        .await
        .expect("ensure_stream should succeed");
    transport
        .ensure_stream(subject, "event-admin")
        .await
        .expect("second ensure_stream should succeed");

    let again = transport
        .create_group(subject, "event-admin", StartPosition::Tail)
        .await
        .unwrap();
    assert_eq!(again, GroupCreation::AlreadyExists, "anchor group should exist");
}

pub async fn test_create_group_is_idempotent<T: StreamTransport>(transport: &T) {
    let subject = Subject::BlogUpdated;
    let first = transport
        .create_group(subject, "contract_idempotent", StartPosition::Tail)
        .await
        .unwrap();
    assert_eq!(first, GroupCreation::Created);

    transport.append(subject, b"after-create").await.unwrap();
    let second = transport
        .create_group(subject, "contract_idempotent", StartPosition::Beginning)
        .await
        .unwrap();
    assert_eq!(second, GroupCreation::AlreadyExists);

    // The existing cursor was not reset to the beginning.
    let entries = read_new(transport, subject, "contract_idempotent", "a").await;
    assert_eq!(entries.len(), 1, "only the entry appended after creation");
    assert_eq!(entries[0].payload, b"after-create");
}

pub async fn test_group_from_tail_skips_history<T: StreamTransport>(transport: &T) {
    let subject = Subject::BlogUpdated;
    transport.append(subject, b"history").await.unwrap();
    transport
        .create_group(subject, "contract_tail", StartPosition::Tail)
        .await
        .unwrap();

    assert!(read_new(transport, subject, "contract_tail", "a").await.is_empty());

    let id = transport.append(subject, b"fresh").await.unwrap();
    let entries = read_new(transport, subject, "contract_tail", "a").await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
}

pub async fn test_group_from_beginning_reads_history<T: StreamTransport>(transport: &T) {
    let subject = Subject::BlogUpdated;
    transport.append(subject, b"history").await.unwrap();
    transport
        .create_group(subject, "contract_beginning", StartPosition::Beginning)
        .await
        .unwrap();

    let entries = read_new(transport, subject, "contract_beginning", "a").await;
    assert!(!entries.is_empty(), "history should be delivered");
    assert!(
        entries.windows(2).all(|pair| pair[0].id < pair[1].id),
        "entries should arrive in id order"
    );
}

// =============================================================================
// Delivery
// =============================================================================

pub async fn test_append_assigns_increasing_ids<T: StreamTransport>(transport: &T) {
    let subject = Subject::UserCreated;
    let mut previous = None;
    for i in 0..3 {
        let id = transport
            .append(subject, format!("entry-{i}").as_bytes())
            .await
            .unwrap();
        if let Some(previous) = previous {
            assert!(id > previous, "ids must increase");
        }
        previous = Some(id);
    }
}

pub async fn test_new_entries_go_to_one_consumer_per_group<T: StreamTransport>(transport: &T) {
    let subject = Subject::UserNameUpdated;
    for group in ["contract_once_1", "contract_once_2"] {
        transport
            .create_group(subject, group, StartPosition::Tail)
            .await
            .unwrap();
    }
    transport.append(subject, b"one").await.unwrap();
    transport.append(subject, b"two").await.unwrap();

    let a = read_new(transport, subject, "contract_once_1", "a").await;
    let b = read_new(transport, subject, "contract_once_1", "b").await;
    assert_eq!(a.len(), 2);
    assert!(b.is_empty(), "entries already delivered within the group");

    let other = read_new(transport, subject, "contract_once_2", "a").await;
    assert_eq!(other.len(), 2, "each group gets its own copy");
}

pub async fn test_blocking_read_times_out_empty<T: StreamTransport>(transport: &T) {
    let subject = Subject::UserNameUpdated;
    transport
        .create_group(subject, "contract_block", StartPosition::Tail)
        .await
        .unwrap();

    let entries = transport
        .read_group(
            subject,
            "contract_block",
            "a",
            ReadCursor::New,
            10,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
    assert!(entries.is_empty());
}

pub async fn test_pending_read_and_ack<T: StreamTransport>(transport: &T) {
    let subject = Subject::UserNameUpdated;
    let group = "contract_ack";
    transport
        .create_group(subject, group, StartPosition::Tail)
        .await
        .unwrap();
    let id = transport.append(subject, b"payload").await.unwrap();
    read_new(transport, subject, group, "a").await;

    let pending = transport.list_pending(subject, group, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].consumer, "a");
    assert_eq!(pending[0].deliveries, 1);

    let redelivered = transport
        .read_group(
            subject,
            group,
            "a",
            ReadCursor::pending_from_start(),
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].payload, b"payload");

    let others = transport
        .read_group(
            subject,
            group,
            "b",
            ReadCursor::pending_from_start(),
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert!(others.is_empty(), "pending reads only return own entries");

    assert!(transport.ack(subject, group, id).await.unwrap());
    assert!(!transport.ack(subject, group, id).await.unwrap(), "second ack is a no-op");
    assert!(transport.list_pending(subject, group, 10).await.unwrap().is_empty());
}

pub async fn test_missing_group_is_reported<T: StreamTransport>(transport: &T) {
    let err = transport
        .read_group(
            Subject::BlogDeleted,
            "contract_never_created",
            "a",
            ReadCursor::New,
            10,
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::GroupNotFound { .. }),
        "unexpected error: {err}"
    );
    assert!(!err.is_fatal());
}

// =============================================================================
// Claims and consumers
// =============================================================================

pub async fn test_claim_respects_min_idle<T: StreamTransport>(transport: &T) {
    let subject = Subject::CommentCreated;
    let group = "contract_claim";
    transport
        .create_group(subject, group, StartPosition::Tail)
        .await
        .unwrap();
    let id = transport.append(subject, b"stuck").await.unwrap();
    read_new(transport, subject, group, "a").await;

    let early = transport
        .claim(subject, group, "b", Duration::from_secs(3600), &[id])
        .await
        .unwrap();
    assert!(early.is_empty(), "entry is not idle long enough");

    let claimed = transport
        .claim(subject, group, "b", Duration::ZERO, &[id])
        .await
        .unwrap();
    assert_eq!(claimed, vec![id]);

    let pending = transport.list_pending(subject, group, 10).await.unwrap();
    assert_eq!(pending[0].consumer, "b");

    let b_pending = transport
        .read_group(
            subject,
            group,
            "b",
            ReadCursor::pending_from_start(),
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(b_pending.len(), 1, "claimed entry is readable by its new owner");
}

pub async fn test_list_and_delete_consumers<T: StreamTransport>(transport: &T) {
    let subject = Subject::BlogDeleted;
    let group = "contract_consumers";
    transport
        .create_group(subject, group, StartPosition::Tail)
        .await
        .unwrap();
    read_new(transport, subject, group, "a").await;
    transport.append(subject, b"owned").await.unwrap();
    read_new(transport, subject, group, "b").await;

    let consumers = transport.list_consumers(subject, group).await.unwrap();
    let names: Vec<&str> = consumers.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"a") && names.contains(&"b"));
    let b = consumers.iter().find(|c| c.name == "b").unwrap();
    assert_eq!(b.pending, 1);

    let dropped = transport.delete_consumer(subject, group, "b").await.unwrap();
    assert_eq!(dropped, 1, "deleting returns the pending entries it dropped");
    let consumers = transport.list_consumers(subject, group).await.unwrap();
    assert!(consumers.iter().all(|c| c.name != "b"));
    assert!(transport.list_pending(subject, group, 10).await.unwrap().is_empty());
}

pub async fn test_list_groups_reports_delivery_progress<T: StreamTransport>(transport: &T) {
    let subject = Subject::CommentCreated;
    let group = "contract_progress";
    transport
        .create_group(subject, group, StartPosition::Tail)
        .await
        .unwrap();
    let first = transport.append(subject, b"first").await.unwrap();
    transport.append(subject, b"second").await.unwrap();
    transport
        .read_group(subject, group, "a", ReadCursor::New, 1, Duration::ZERO)
        .await
        .unwrap();

    let groups = transport.list_groups(subject).await.unwrap();
    let info = groups
        .iter()
        .find(|g| g.name == group)
        .expect("group should be listed");
    assert_eq!(info.last_delivered, first, "second entry not yet delivered");
    assert_eq!(info.pending, 1);
}

// =============================================================================
// Trimming
// =============================================================================

pub async fn test_trim_keeps_pending_entries<T: StreamTransport>(transport: &T) {
    let subject = Subject::CommentDeleted;
    let group = "contract_trim";
    transport
        .create_group(subject, group, StartPosition::Tail)
        .await
        .unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            transport
                .append(subject, format!("entry-{i}").as_bytes())
                .await
                .unwrap(),
        );
    }
    transport
        .read_group(subject, group, "a", ReadCursor::New, 2, Duration::ZERO)
        .await
        .unwrap();
    transport.ack(subject, group, ids[0]).await.unwrap();

    transport
        .trim(subject, TrimPolicy::max_len(1).protecting(Some(ids[1])))
        .await
        .unwrap();

    assert!(transport.stream_len(subject).await.unwrap() >= 4);
    let pending = transport
        .read_group(
            subject,
            group,
            "a",
            ReadCursor::pending_from_start(),
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, ids[1]);
    assert_eq!(pending[0].payload, b"entry-1", "protected entry keeps its payload");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all StreamTransport interface tests against a transport implementation.
#[macro_export]
macro_rules! run_stream_transport_tests {
    ($transport:expr) => {
        use $crate::transport::stream_transport_tests::*;

        // provisioning
        test_ensure_stream_is_idempotent($transport).await;
        println!("  test_ensure_stream_is_idempotent: PASSED");

        test_create_group_is_idempotent($transport).await;
        println!("  test_create_group_is_idempotent: PASSED");

        test_group_from_tail_skips_history($transport).await;
        println!("  test_group_from_tail_skips_history: PASSED");

        test_group_from_beginning_reads_history($transport).await;
        println!("  test_group_from_beginning_reads_history: PASSED");

        // delivery
        test_append_assigns_increasing_ids($transport).await;
        println!("  test_append_assigns_increasing_ids: PASSED");

        test_new_entries_go_to_one_consumer_per_group($transport).await;
        println!("  test_new_entries_go_to_one_consumer_per_group: PASSED");

        test_blocking_read_times_out_empty($transport).await;
        println!("  test_blocking_read_times_out_empty: PASSED");

        test_pending_read_and_ack($transport).await;
        println!("  test_pending_read_and_ack: PASSED");

        test_missing_group_is_reported($transport).await;
        println!("  test_missing_group_is_reported: PASSED");

        // claims and consumers
        test_claim_respects_min_idle($transport).await;
        println!("  test_claim_respects_min_idle: PASSED");

        test_list_and_delete_consumers($transport).await;
        println!("  test_list_and_delete_consumers: PASSED");

        test_list_groups_reports_delivery_progress($transport).await;
        println!("  test_list_groups_reports_delivery_progress: PASSED");

        // trimming
        test_trim_keeps_pending_entries($transport).await;
        println!("  test_trim_keeps_pending_entries: PASSED");
    };
}
