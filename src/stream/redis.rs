//! Redis Streams connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::streams::{
    StreamId, StreamPendingReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use ::redis::{AsyncCommands, Client, Value};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    ConsumerPending, DelegateResult, FieldMap, PendingSummary, StreamConnection,
    StreamConnector, StreamEndpoint, StreamEntry, StreamRead, StreamValue,
};
use crate::error::DelegateError;

/// Id that asks XREADGROUP for entries never delivered to the group.
const UNDELIVERED: &str = ">";

/// Stream connection backed by a multiplexed Redis connection.
///
/// Clones of the underlying connection manager are handed to each command,
/// so concurrent callers share one socket. A blocking read occupies that
/// socket until it returns; use separate handles for producers and blocked
/// consumers.
pub struct RedisStreamConnection {
    conn: RwLock<Option<ConnectionManager>>,
}

impl RedisStreamConnection {
    /// Connect to a Redis server.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379/0)
    pub async fn connect(url: &str) -> DelegateResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for streams");

        Ok(Self::from_manager(conn))
    }

    /// Wrap an existing connection manager.
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn: RwLock::new(Some(conn)),
        }
    }

    async fn connection(&self) -> DelegateResult<ConnectionManager> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| DelegateError::msg("connection is closed"))
    }
}

fn read_options(count: Option<usize>, block: Option<Duration>) -> StreamReadOptions {
    let mut options = StreamReadOptions::default();
    if let Some(count) = count.filter(|c| *c > 0) {
        options = options.count(count);
    }
    if let Some(block) = block {
        options = options.block(block_millis(block));
    }
    options
}

/// BLOCK argument for `block`. Only a zero duration maps to 0 (wait forever);
/// any other duration waits at least 1 ms.
fn block_millis(block: Duration) -> usize {
    if block.is_zero() {
        return 0;
    }
    usize::try_from(block.as_millis()).unwrap_or(usize::MAX).max(1)
}

fn to_fields(map: HashMap<String, Value>) -> DelegateResult<FieldMap> {
    map.into_iter()
        .map(|(field, value)| -> DelegateResult<(String, StreamValue)> {
            let raw: Vec<u8> = ::redis::from_redis_value(&value)?;
            Ok((field, StreamValue::from_wire(raw)))
        })
        .collect()
}

fn to_entry(id: StreamId) -> DelegateResult<StreamEntry> {
    Ok(StreamEntry {
        id: id.id,
        fields: to_fields(id.map)?,
    })
}

fn to_reads(reply: Option<StreamReadReply>) -> DelegateResult<Vec<StreamRead>> {
    let Some(reply) = reply else {
        return Ok(Vec::new());
    };
    reply
        .keys
        .into_iter()
        .map(|key| -> DelegateResult<StreamRead> {
            Ok(StreamRead {
                channel: key.key,
                entries: key
                    .ids
                    .into_iter()
                    .map(to_entry)
                    .collect::<DelegateResult<Vec<_>>>()?,
            })
        })
        .collect()
}

fn to_pending(reply: StreamPendingReply) -> PendingSummary {
    match reply {
        StreamPendingReply::Empty => PendingSummary::default(),
        StreamPendingReply::Data(data) => PendingSummary {
            count: data.count as u64,
            lower: Some(data.start_id),
            higher: Some(data.end_id),
            consumers: data
                .consumers
                .into_iter()
                .map(|c| ConsumerPending {
                    consumer: c.name,
                    count: c.pending as u64,
                })
                .collect(),
        },
    }
}

#[async_trait]
impl StreamConnection for RedisStreamConnection {
    async fn add(&self, channel: &str, fields: &FieldMap) -> DelegateResult<String> {
        let mut conn = self.connection().await?;
        let items: Vec<(&str, Vec<u8>)> = fields
            .iter()
            .map(|(field, value)| (field.as_str(), value.to_wire()))
            .collect();

        let id: String = conn.xadd(channel, "*", &items).await?;
        Ok(id)
    }

    async fn read(
        &self,
        channel: &str,
        last_id: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> DelegateResult<Vec<StreamRead>> {
        let mut conn = self.connection().await?;
        let options = read_options(count, block);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[channel], &[last_id], &options)
            .await?;
        to_reads(reply)
    }

    async fn read_group(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> DelegateResult<Vec<StreamRead>> {
        let mut conn = self.connection().await?;
        let options = read_options(count, block).group(group, consumer);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[channel], &[UNDELIVERED], &options)
            .await?;
        to_reads(reply)
    }

    async fn range(&self, channel: &str, start: &str, stop: &str) -> DelegateResult<Vec<StreamEntry>> {
        let mut conn = self.connection().await?;
        let reply: StreamRangeReply = conn.xrange(channel, start, stop).await?;
        reply.ids.into_iter().map(to_entry).collect()
    }

    async fn delete(&self, channel: &str, ids: &[String]) -> DelegateResult<u64> {
        let mut conn = self.connection().await?;
        let removed: u64 = conn.xdel(channel, ids).await?;
        Ok(removed)
    }

    async fn create_group(&self, channel: &str, group: &str, start: &str) -> DelegateResult<String> {
        let mut conn = self.connection().await?;
        let reply: String = conn.xgroup_create(channel, group, start).await?;
        Ok(reply)
    }

    async fn destroy_group(&self, channel: &str, group: &str) -> DelegateResult<u64> {
        let mut conn = self.connection().await?;
        let destroyed: u64 = conn.xgroup_destroy(channel, group).await?;
        Ok(destroyed)
    }

    async fn pending(&self, channel: &str, group: &str) -> DelegateResult<PendingSummary> {
        let mut conn = self.connection().await?;
        let reply: StreamPendingReply = conn.xpending(channel, group).await?;
        Ok(to_pending(reply))
    }

    async fn ack(&self, channel: &str, group: &str, ids: &[String]) -> DelegateResult<u64> {
        let mut conn = self.connection().await?;
        let acked: u64 = conn.xack(channel, group, ids).await?;
        Ok(acked)
    }

    async fn close(&self) -> DelegateResult<()> {
        // Dropping the last manager clone shuts the socket down.
        match self.conn.write().await.take() {
            Some(_) => {
                debug!("Closed Redis stream connection");
                Ok(())
            }
            None => Err(DelegateError::msg("connection is closed")),
        }
    }
}

/// Opens a dedicated Redis connection per handle.
#[derive(Debug, Default, Clone)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamConnector for RedisConnector {
    async fn connect(&self, endpoint: &StreamEndpoint) -> DelegateResult<Arc<dyn StreamConnection>> {
        let conn = RedisStreamConnection::connect(&endpoint.connection_url()).await?;
        Ok(Arc::new(conn))
    }
}
