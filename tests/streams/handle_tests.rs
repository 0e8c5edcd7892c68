//! StreamHandle contract tests.
//!
//! Channels are derived from a per-run prefix so runs against a shared
//! server do not see each other's entries.

use std::time::Duration;

use funicular::stream::{
    fields, StreamEndpoint, StreamError, StreamManager, StreamValue, FROM_START,
    NEW_ENTRIES_ONLY, RANGE_MAX, RANGE_MIN,
};

fn channel(prefix: &str, name: &str) -> String {
    format!("{}_{}", prefix, name)
}

// =============================================================================
// StreamManager::add_client tests
// =============================================================================

pub async fn test_add_client_binds_category(
    manager: &StreamManager,
    endpoint: &StreamEndpoint,
    prefix: &str,
) {
    let category = channel(prefix, "orders");

    let handle = manager
        .add_client(endpoint, &category, "")
        .await
        .expect("add_client should succeed");
    assert_eq!(handle.channel(), category, "channel should default to category");

    let id = handle
        .produce(&fields([("k", "v")]))
        .await
        .expect("produce should succeed");
    assert!(!id.is_empty(), "produce should return an id");

    let entries = handle
        .range_read(RANGE_MIN, RANGE_MAX)
        .await
        .expect("range_read should succeed");
    let entry = entries
        .iter()
        .find(|e| e.id == id)
        .expect("range should contain produced entry");
    assert_eq!(entry.get("k"), Some(&StreamValue::from("v")));
}

pub async fn test_add_client_rejects_empty_category(
    manager: &StreamManager,
    endpoint: &StreamEndpoint,
    prefix: &str,
) {
    let err = manager
        .add_client(endpoint, "", &channel(prefix, "nowhere"))
        .await
        .expect_err("empty category should be rejected");
    assert!(matches!(err, StreamError::Validation(_)));
}

// =============================================================================
// StreamHandle read/write tests
// =============================================================================

pub async fn test_consume_in_order(manager: &StreamManager, endpoint: &StreamEndpoint, prefix: &str) {
    let handle = manager
        .add_client(endpoint, &channel(prefix, "consume"), "")
        .await
        .expect("add_client should succeed");

    let first = handle.produce(&fields([("n", 1)])).await.unwrap();
    let second = handle.produce(&fields([("n", 2)])).await.unwrap();

    let reads = handle
        .consume(FROM_START, Some(10), None)
        .await
        .expect("consume should succeed");
    assert_eq!(reads.len(), 1, "one channel was read");
    let ids: Vec<_> = reads[0].entries.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids, vec![first.clone(), second]);
    let n = reads[0].entries[0].get("n");
    assert_eq!(n, Some(&StreamValue::from("1")), "values read back in wire form");
    assert_eq!(n.and_then(StreamValue::as_i64), Some(1));

    let after_first = handle.consume(&first, None, None).await.unwrap();
    assert_eq!(after_first[0].entries.len(), 1);
}

pub async fn test_consume_block_times_out(
    manager: &StreamManager,
    endpoint: &StreamEndpoint,
    prefix: &str,
) {
    let handle = manager
        .add_client(endpoint, &channel(prefix, "idle"), "")
        .await
        .unwrap();

    let reads = handle
        .consume(NEW_ENTRIES_ONLY, None, Some(Duration::from_millis(50)))
        .await
        .expect("timed out read should succeed");
    assert!(reads.is_empty(), "nothing was produced");
}

pub async fn test_delete_entries(manager: &StreamManager, endpoint: &StreamEndpoint, prefix: &str) {
    let handle = manager
        .add_client(endpoint, &channel(prefix, "delete"), "")
        .await
        .unwrap();
    let keep = handle.produce(&fields([("k", "keep")])).await.unwrap();
    let drop = handle.produce(&fields([("k", "drop")])).await.unwrap();

    assert_eq!(handle.delete(&[drop.clone()]).await.unwrap(), 1);
    assert_eq!(handle.delete(&[drop]).await.unwrap(), 0, "already deleted");
    assert_eq!(handle.delete(&[]).await.unwrap(), 0);

    let entries = handle.range_read(RANGE_MIN, RANGE_MAX).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, keep);
}

pub async fn test_handles_share_channel(
    manager: &StreamManager,
    endpoint: &StreamEndpoint,
    prefix: &str,
) {
    let shared = channel(prefix, "shared");
    let producer = manager
        .add_client(endpoint, &channel(prefix, "producers"), &shared)
        .await
        .unwrap();
    let consumer = manager
        .add_client(endpoint, &channel(prefix, "consumers"), &shared)
        .await
        .unwrap();

    let id = producer.produce(&fields([("k", "v")])).await.unwrap();
    let entries = consumer.range_read(&id, &id).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
}

// =============================================================================
// Consumer group tests
// =============================================================================

pub async fn test_group_lifecycle(manager: &StreamManager, endpoint: &StreamEndpoint, prefix: &str) {
    let handle = manager
        .add_client(endpoint, &channel(prefix, "groups"), "")
        .await
        .unwrap();
    handle.produce(&fields([("k", "a")])).await.unwrap();
    handle.produce(&fields([("k", "b")])).await.unwrap();

    let reply = handle
        .create_group("workers", FROM_START)
        .await
        .expect("create_group should succeed");
    assert_eq!(reply, "OK");
    assert!(
        handle.create_group("workers", FROM_START).await.is_err(),
        "duplicate group should fail"
    );

    let reads = handle
        .consume_group("workers", "w1", None, None)
        .await
        .expect("consume_group should succeed");
    let ids: Vec<String> = reads[0].entries.iter().map(|e| e.id.clone()).collect();
    assert_eq!(ids.len(), 2);

    let summary = handle.pending("workers").await.unwrap();
    assert_eq!(summary.count, 2);
    assert_eq!(summary.for_consumer("w1"), 2);

    assert_eq!(handle.ack("workers", &ids).await.unwrap(), 2);
    assert_eq!(handle.pending("workers").await.unwrap().count, 0);

    assert_eq!(handle.destroy_group("workers").await.unwrap(), 1);
    assert_eq!(handle.destroy_group("workers").await.unwrap(), 0);
}

// =============================================================================
// StreamManager::close_all tests
// =============================================================================

pub async fn test_close_all(manager: &StreamManager, endpoint: &StreamEndpoint, prefix: &str) {
    let handle = manager
        .add_client(endpoint, &channel(prefix, "closing"), "")
        .await
        .unwrap();

    manager.close_all().await.expect("close_all should succeed");

    assert!(manager.is_empty().await);
    assert!(manager.categories().await.is_empty());
    assert!(handle.produce(&fields([("k", "v")])).await.is_err());

    manager.close_all().await.expect("empty close_all should succeed");
}

/// Run the full contract. `close_all` runs last since it releases every handle.
#[macro_export]
macro_rules! run_stream_handle_tests {
    ($manager:expr, $endpoint:expr, $prefix:expr) => {
        use $crate::streams::handle_tests::*;

        test_add_client_binds_category($manager, $endpoint, $prefix).await;
        println!("  test_add_client_binds_category: PASSED");

        test_add_client_rejects_empty_category($manager, $endpoint, $prefix).await;
        println!("  test_add_client_rejects_empty_category: PASSED");

        test_consume_in_order($manager, $endpoint, $prefix).await;
        println!("  test_consume_in_order: PASSED");

        test_consume_block_times_out($manager, $endpoint, $prefix).await;
        println!("  test_consume_block_times_out: PASSED");

        test_delete_entries($manager, $endpoint, $prefix).await;
        println!("  test_delete_entries: PASSED");

        test_handles_share_channel($manager, $endpoint, $prefix).await;
        println!("  test_handles_share_channel: PASSED");

        test_group_lifecycle($manager, $endpoint, $prefix).await;
        println!("  test_group_lifecycle: PASSED");

        test_close_all($manager, $endpoint, $prefix).await;
        println!("  test_close_all: PASSED");
    };
}
