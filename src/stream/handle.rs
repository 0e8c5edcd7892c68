//! Stream handle bound to a single channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{
    FieldMap, PendingSummary, Result, StreamConnection, StreamEntry, StreamError, StreamRead,
};
use crate::error::DelegateError;

/// A stream connection bound to one channel (stream key).
///
/// Every operation is a single call into the stream database against the
/// bound channel. Failures come back as [`StreamError::Delegate`] annotated
/// with the command and channel; nothing is retried here.
pub struct StreamHandle {
    conn: Arc<dyn StreamConnection>,
    channel: String,
}

impl StreamHandle {
    pub fn new(conn: Arc<dyn StreamConnection>, channel: impl Into<String>) -> Self {
        Self {
            conn,
            channel: channel.into(),
        }
    }

    /// The channel this handle reads and writes.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn delegate(&self, operation: &'static str) -> impl FnOnce(DelegateError) -> StreamError + '_ {
        move |source| StreamError::Delegate {
            operation,
            channel: self.channel.clone(),
            source,
        }
    }

    /// Append an entry and return its generated id.
    pub async fn produce(&self, fields: &FieldMap) -> Result<String> {
        let id = self
            .conn
            .add(&self.channel, fields)
            .await
            .map_err(self.delegate("XADD"))?;

        debug!(channel = %self.channel, id = %id, fields = fields.len(), "Produced entry");
        Ok(id)
    }

    /// Read entries with ids after `last_id`.
    ///
    /// `block: None` returns immediately; `Some(Duration::ZERO)` waits until an
    /// entry arrives. Wrap the call in `tokio::time::timeout` or drop the future
    /// to cancel a blocked read.
    pub async fn consume(
        &self,
        last_id: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRead>> {
        self.conn
            .read(&self.channel, last_id, count, block)
            .await
            .map_err(self.delegate("XREAD"))
    }

    /// Read entries not yet delivered to `group` on behalf of `consumer`.
    ///
    /// Delivered entries stay pending for `consumer` until acknowledged.
    pub async fn consume_group(
        &self,
        group: &str,
        consumer: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> Result<Vec<StreamRead>> {
        self.conn
            .read_group(&self.channel, group, consumer, count, block)
            .await
            .map_err(self.delegate("XREADGROUP"))
    }

    /// Entries between `start` and `stop` inclusive, in id order.
    pub async fn range_read(&self, start: &str, stop: &str) -> Result<Vec<StreamEntry>> {
        self.conn
            .range(&self.channel, start, stop)
            .await
            .map_err(self.delegate("XRANGE"))
    }

    /// Remove entries by id. Unknown ids are ignored.
    pub async fn delete(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.conn
            .delete(&self.channel, ids)
            .await
            .map_err(self.delegate("XDEL"))
    }

    /// Create a consumer group starting after `start`. Fails if the group exists.
    pub async fn create_group(&self, group: &str, start: &str) -> Result<String> {
        let reply = self
            .conn
            .create_group(&self.channel, group, start)
            .await
            .map_err(self.delegate("XGROUP CREATE"))?;

        debug!(channel = %self.channel, group = %group, start = %start, "Created consumer group");
        Ok(reply)
    }

    /// Destroy a consumer group. Returns 1 if it existed, 0 otherwise.
    pub async fn destroy_group(&self, group: &str) -> Result<u64> {
        let destroyed = self
            .conn
            .destroy_group(&self.channel, group)
            .await
            .map_err(self.delegate("XGROUP DESTROY"))?;

        debug!(channel = %self.channel, group = %group, destroyed, "Destroyed consumer group");
        Ok(destroyed)
    }

    pub async fn pending(&self, group: &str) -> Result<PendingSummary> {
        self.conn
            .pending(&self.channel, group)
            .await
            .map_err(self.delegate("XPENDING"))
    }

    /// Acknowledge entries for `group`. Returns how many were pending.
    pub async fn ack(&self, group: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.conn
            .ack(&self.channel, group, ids)
            .await
            .map_err(self.delegate("XACK"))
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> Result<()> {
        self.conn.close().await.map_err(self.delegate("CLOSE"))
    }

    pub(crate) async fn close_connection(&self) -> std::result::Result<(), DelegateError> {
        self.conn.close().await
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockStreamConnection;
    use crate::stream::{fields, StreamValue, RANGE_MAX, RANGE_MIN};

    fn handle(channel: &str) -> (StreamHandle, Arc<MockStreamConnection>) {
        let conn = Arc::new(MockStreamConnection::new());
        let handle = StreamHandle::new(conn.clone(), channel);
        (handle, conn)
    }

    #[tokio::test]
    async fn test_produce_then_range_read() {
        let (handle, _conn) = handle("orders");

        let id = handle.produce(&fields([("k", "v")])).await.unwrap();
        assert!(!id.is_empty());

        let entries = handle.range_read(RANGE_MIN, RANGE_MAX).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].get("k"), Some(&StreamValue::from("v")));
    }

    #[tokio::test]
    async fn test_empty_id_lists_short_circuit() {
        let (handle, conn) = handle("orders");
        conn.close().await.unwrap();

        // No round trip, so the closed connection is never touched.
        assert_eq!(handle.delete(&[]).await.unwrap(), 0);
        assert_eq!(handle.ack("g", &[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_annotated_with_operation_and_channel() {
        let (handle, _conn) = handle("orders");

        let err = handle.create_group("g", "0").await.unwrap_err();
        match err {
            StreamError::Delegate {
                operation, channel, ..
            } => {
                assert_eq!(operation, "XGROUP CREATE");
                assert_eq!(channel, "orders");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let (handle, _conn) = handle("orders");

        handle.close().await.unwrap();

        let err = handle.produce(&fields([("k", "v")])).await.unwrap_err();
        assert!(matches!(err, StreamError::Delegate { operation: "XADD", .. }));
        assert!(handle.close().await.is_err());
    }
}
