//! In-memory stream backend integration tests.
//!
//! Run with: cargo test --test stream_mock

mod streams;

use std::sync::Arc;

use funicular::stream::{MockConnector, StreamEndpoint, StreamManager};

#[tokio::test]
async fn test_mock_stream_handles() {
    println!("=== Mock StreamHandle Tests ===");

    let manager = StreamManager::new(Arc::new(MockConnector::new()));
    let endpoint = StreamEndpoint::default();

    run_stream_handle_tests!(&manager, &endpoint, "mock");

    println!("=== All Mock StreamHandle tests PASSED ===");
}
