//! Category registry of stream handles.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    CloseError, CloseFailure, ClosePolicy, Result, StreamConnector, StreamEndpoint, StreamError,
    StreamHandle, StreamsConfig,
};

/// Registry of stream handles grouped by category.
///
/// A category is present only while it holds at least one handle. The
/// registry sits behind an async mutex, so a manager can be shared between
/// tasks; connections are opened outside the lock.
pub struct StreamManager {
    connector: Arc<dyn StreamConnector>,
    close_policy: ClosePolicy,
    clients: Mutex<BTreeMap<String, Vec<Arc<StreamHandle>>>>,
}

impl StreamManager {
    pub fn new(connector: Arc<dyn StreamConnector>) -> Self {
        Self::with_close_policy(connector, ClosePolicy::default())
    }

    pub fn with_close_policy(connector: Arc<dyn StreamConnector>, close_policy: ClosePolicy) -> Self {
        Self {
            connector,
            close_policy,
            clients: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &StreamsConfig, connector: Arc<dyn StreamConnector>) -> Self {
        Self::with_close_policy(connector, config.close_policy)
    }

    pub fn close_policy(&self) -> ClosePolicy {
        self.close_policy
    }

    /// Open a new handle and register it under `category`.
    ///
    /// An empty `channel` defaults to `category`. An empty `category` is
    /// rejected before any connection is attempted.
    pub async fn add_client(
        &self,
        endpoint: &StreamEndpoint,
        category: &str,
        channel: &str,
    ) -> Result<Arc<StreamHandle>> {
        if category.is_empty() {
            return Err(StreamError::Validation("category must be filled".to_string()));
        }
        let channel = if channel.is_empty() { category } else { channel };

        let conn = self
            .connector
            .connect(endpoint)
            .await
            .map_err(|source| StreamError::Delegate {
                operation: "CONNECT",
                channel: channel.to_string(),
                source,
            })?;
        let handle = Arc::new(StreamHandle::new(conn, channel));

        self.clients
            .lock()
            .await
            .entry(category.to_string())
            .or_default()
            .push(handle.clone());

        debug!(
            category = %category,
            channel = %channel,
            endpoint = %endpoint.address(),
            "Added stream client"
        );
        Ok(handle)
    }

    /// Close every registered handle.
    ///
    /// Categories are visited in name order, handles in insertion order. Each
    /// handle is dropped from the registry once its connection closes, and a
    /// category is deleted once it is empty. See [`ClosePolicy`] for what
    /// happens when a close fails; failed handles always stay registered.
    pub async fn close_all(&self) -> Result<()> {
        let mut clients = self.clients.lock().await;

        if clients.is_empty() {
            info!("Manager has no clients to close");
            return Ok(());
        }

        let mut failures = Vec::new();
        let categories: Vec<String> = clients.keys().cloned().collect();

        'categories: for category in categories {
            let Some(handles) = clients.remove(&category) else {
                continue;
            };
            let mut remaining = Vec::new();
            let mut pending = handles.into_iter();

            while let Some(handle) = pending.next() {
                match handle.close_connection().await {
                    Ok(()) => {
                        debug!(category = %category, channel = %handle.channel(), "Closed stream client");
                    }
                    Err(source) => {
                        warn!(
                            category = %category,
                            channel = %handle.channel(),
                            error = %source,
                            "Failed to close stream client"
                        );
                        failures.push(CloseFailure {
                            category: category.clone(),
                            channel: handle.channel().to_string(),
                            source,
                        });
                        remaining.push(handle);

                        if self.close_policy == ClosePolicy::FailFast {
                            remaining.extend(pending);
                            clients.insert(category, remaining);
                            break 'categories;
                        }
                    }
                }
            }

            if !remaining.is_empty() {
                clients.insert(category, remaining);
            }
        }

        if failures.is_empty() {
            info!("Closed all stream clients");
            Ok(())
        } else {
            Err(CloseError { failures }.into())
        }
    }

    /// Registered categories in name order.
    pub async fn categories(&self) -> Vec<String> {
        self.clients.lock().await.keys().cloned().collect()
    }

    /// Handles registered under `category`, in insertion order.
    pub async fn handles(&self, category: &str) -> Vec<Arc<StreamHandle>> {
        self.clients
            .lock()
            .await
            .get(category)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of registered handles.
    pub async fn len(&self) -> usize {
        self.clients.lock().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{fields, MockConnector, RANGE_MAX, RANGE_MIN};

    fn manager(policy: ClosePolicy) -> (StreamManager, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let manager = StreamManager::with_close_policy(connector.clone(), policy);
        (manager, connector)
    }

    #[tokio::test]
    async fn test_add_client_registers_one_more_handle() {
        let (manager, _) = manager(ClosePolicy::FailFast);
        let endpoint = StreamEndpoint::default();

        manager.add_client(&endpoint, "orders", "").await.unwrap();
        let before = manager.handles("orders").await.len();
        manager.add_client(&endpoint, "orders", "orders-eu").await.unwrap();

        assert_eq!(manager.handles("orders").await.len(), before + 1);
        assert_eq!(manager.categories().await, vec!["orders".to_string()]);
        assert_eq!(manager.len().await, 2);
    }

    #[tokio::test]
    async fn test_add_client_empty_category_rejected() {
        let (manager, connector) = manager(ClosePolicy::FailFast);

        for channel in ["", "orders"] {
            let err = manager
                .add_client(&StreamEndpoint::default(), "", channel)
                .await
                .unwrap_err();
            assert!(matches!(err, StreamError::Validation(_)));
        }

        assert!(manager.is_empty().await);
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_add_client_channel_defaults_to_category() {
        let (manager, _) = manager(ClosePolicy::FailFast);

        let handle = manager
            .add_client(&StreamEndpoint::default(), "orders", "")
            .await
            .unwrap();
        assert_eq!(handle.channel(), "orders");

        let handle = manager
            .add_client(&StreamEndpoint::default(), "orders", "payments")
            .await
            .unwrap();
        assert_eq!(handle.channel(), "payments");
    }

    #[tokio::test]
    async fn test_add_client_connect_failure_registers_nothing() {
        let (manager, connector) = manager(ClosePolicy::FailFast);
        connector.set_fail_on_connect(true);

        let err = manager
            .add_client(&StreamEndpoint::default(), "orders", "")
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Delegate { operation: "CONNECT", .. }));
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let (manager, connector) = manager(ClosePolicy::FailFast);
        let endpoint = StreamEndpoint::default();
        manager.add_client(&endpoint, "orders", "").await.unwrap();
        manager.add_client(&endpoint, "orders", "").await.unwrap();
        manager.add_client(&endpoint, "audit", "").await.unwrap();

        manager.close_all().await.unwrap();

        assert!(manager.is_empty().await);
        assert!(manager.categories().await.is_empty());
        for conn in connector.connections().await {
            assert!(conn.is_closed());
        }
    }

    #[tokio::test]
    async fn test_close_all_empty_registry_is_ok() {
        let (manager, _) = manager(ClosePolicy::FailFast);
        manager.close_all().await.unwrap();
        manager.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_all_fail_fast_leaves_tail_registered() {
        let (manager, connector) = manager(ClosePolicy::FailFast);
        let endpoint = StreamEndpoint::default();
        manager.add_client(&endpoint, "a-first", "").await.unwrap();
        manager.add_client(&endpoint, "b-second", "").await.unwrap();
        manager.add_client(&endpoint, "c-third", "").await.unwrap();
        connector.connection(1).await.unwrap().set_fail_on_close(true);

        let err = manager.close_all().await.unwrap_err();

        let StreamError::Close(close) = err else {
            panic!("expected close error");
        };
        assert_eq!(close.failures.len(), 1);
        assert_eq!(close.first().unwrap().category, "b-second");

        // The first handle closed; the failed one and the untouched tail remain.
        assert_eq!(
            manager.categories().await,
            vec!["b-second".to_string(), "c-third".to_string()]
        );
        assert!(connector.connection(0).await.unwrap().is_closed());
        assert!(!connector.connection(2).await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_all_fail_fast_within_one_category() {
        let (manager, connector) = manager(ClosePolicy::FailFast);
        let endpoint = StreamEndpoint::default();
        for _ in 0..3 {
            manager.add_client(&endpoint, "orders", "").await.unwrap();
        }
        connector.connection(1).await.unwrap().set_fail_on_close(true);

        assert!(manager.close_all().await.is_err());

        assert_eq!(manager.handles("orders").await.len(), 2);
        assert!(!connector.connection(2).await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_all_best_effort_reports_every_failure() {
        let (manager, connector) = manager(ClosePolicy::BestEffort);
        let endpoint = StreamEndpoint::default();
        manager.add_client(&endpoint, "a-first", "").await.unwrap();
        manager.add_client(&endpoint, "b-second", "").await.unwrap();
        manager.add_client(&endpoint, "c-third", "").await.unwrap();
        connector.connection(1).await.unwrap().set_fail_on_close(true);

        let err = manager.close_all().await.unwrap_err();

        let StreamError::Close(close) = err else {
            panic!("expected close error");
        };
        assert_eq!(close.failures.len(), 1);
        assert_eq!(manager.categories().await, vec!["b-second".to_string()]);
        assert!(connector.connection(2).await.unwrap().is_closed());

        // Retrying after the fault clears releases the survivor.
        connector.connection(1).await.unwrap().set_fail_on_close(false);
        manager.close_all().await.unwrap();
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_handles_share_endpoint_data() {
        let (manager, _) = manager(ClosePolicy::FailFast);
        let endpoint = StreamEndpoint::new("localhost", 6379, 0);

        let producer = manager.add_client(&endpoint, "orders", "").await.unwrap();
        let consumer = manager.add_client(&endpoint, "billing", "orders").await.unwrap();

        let id = producer.produce(&fields([("k", "v")])).await.unwrap();
        let entries = consumer.range_read(RANGE_MIN, RANGE_MAX).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
    }

    #[tokio::test]
    async fn test_concurrent_add_client() {
        let (manager, _) = manager(ClosePolicy::FailFast);
        let manager = Arc::new(manager);

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let category = format!("cat-{}", i % 4);
                    manager
                        .add_client(&StreamEndpoint::default(), &category, "")
                        .await
                        .map(|_| ())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(manager.len().await, 16);
        assert_eq!(manager.categories().await.len(), 4);
        assert_eq!(manager.handles("cat-0").await.len(), 4);
    }

    #[test]
    fn test_from_config_uses_close_policy() {
        let config = StreamsConfig {
            close_policy: ClosePolicy::BestEffort,
            ..Default::default()
        };
        let manager = StreamManager::from_config(&config, Arc::new(MockConnector::new()));
        assert_eq!(manager.close_policy(), ClosePolicy::BestEffort);
    }
}
