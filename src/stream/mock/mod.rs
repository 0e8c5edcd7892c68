//! In-memory stream database for testing.
//!
//! Follows Redis Streams semantics closely enough for handle and manager
//! tests: `<ms>-<seq>` ids, inclusive range reads with `-`/`+`, blocking reads,
//! consumer groups with a pending entries list. Connections to the same
//! endpoint share one database.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{
    ConsumerPending, DelegateResult, FieldMap, PendingSummary, StreamConnection,
    StreamConnector, StreamEndpoint, StreamEntry, StreamRead, StreamValue, RANGE_MAX, RANGE_MIN,
};
use crate::error::DelegateError;

/// Stream entry id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl EntryId {
    const MIN: EntryId = EntryId { ms: 0, seq: 0 };
    const MAX: EntryId = EntryId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    /// Parse `ms-seq` or `ms`; a bare `ms` takes `default_seq`.
    fn parse(raw: &str, default_seq: u64) -> DelegateResult<Self> {
        let invalid = || DelegateError::msg("ERR Invalid stream ID specified as stream command argument");
        let (ms, seq) = match raw.split_once('-') {
            Some((ms, seq)) => (
                ms.parse().map_err(|_| invalid())?,
                seq.parse().map_err(|_| invalid())?,
            ),
            None => (raw.parse().map_err(|_| invalid())?, default_seq),
        };
        Ok(EntryId { ms, seq })
    }

    fn range_start(raw: &str) -> DelegateResult<Self> {
        if raw == RANGE_MIN {
            Ok(EntryId::MIN)
        } else {
            EntryId::parse(raw, 0)
        }
    }

    fn range_end(raw: &str) -> DelegateResult<Self> {
        if raw == RANGE_MAX {
            Ok(EntryId::MAX)
        } else {
            EntryId::parse(raw, u64::MAX)
        }
    }

    fn next_after(last: EntryId) -> EntryId {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if now > last.ms {
            EntryId { ms: now, seq: 0 }
        } else {
            EntryId {
                ms: last.ms,
                seq: last.seq + 1,
            }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[derive(Default)]
struct MockGroup {
    last_delivered: EntryId,
    /// Pending entry id -> owning consumer.
    pending: BTreeMap<EntryId, String>,
}

/// Field values as stored: encoded bytes, the way the server holds them.
type WireFields = BTreeMap<String, Vec<u8>>;

fn encode(fields: &FieldMap) -> WireFields {
    fields
        .iter()
        .map(|(field, value)| (field.clone(), value.to_wire()))
        .collect()
}

fn decode(fields: &WireFields) -> FieldMap {
    fields
        .iter()
        .map(|(field, raw)| (field.clone(), StreamValue::from_wire(raw.clone())))
        .collect()
}

#[derive(Default)]
struct MockStream {
    entries: BTreeMap<EntryId, WireFields>,
    last_id: EntryId,
    groups: HashMap<String, MockGroup>,
}

impl MockStream {
    fn entries_after(&self, after: EntryId, count: Option<usize>) -> Vec<(EntryId, FieldMap)> {
        let limit = count.filter(|c| *c > 0).unwrap_or(usize::MAX);
        self.entries
            .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
            .take(limit)
            .map(|(id, f)| (*id, decode(f)))
            .collect()
    }
}

fn to_reads(channel: &str, entries: Vec<(EntryId, FieldMap)>) -> Vec<StreamRead> {
    if entries.is_empty() {
        return Vec::new();
    }
    vec![StreamRead {
        channel: channel.to_string(),
        entries: entries
            .into_iter()
            .map(|(id, fields)| StreamEntry {
                id: id.to_string(),
                fields,
            })
            .collect(),
    }]
}

fn missing_key() -> DelegateError {
    DelegateError::msg("ERR The XGROUP subcommand requires the key to exist")
}

fn no_group(channel: &str, group: &str, command: &str) -> DelegateError {
    DelegateError::msg(format!(
        "NOGROUP No such key '{}' or consumer group '{}' in {} with GROUP option",
        channel, group, command
    ))
}

/// Shared in-memory stream database.
#[derive(Default)]
pub struct MockStreamDb {
    streams: Mutex<HashMap<String, MockStream>>,
    appended: Notify,
}

impl MockStreamDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `attempt` until it yields entries or `block` runs out.
    async fn poll_until<F>(&self, block: Option<Duration>, mut attempt: F) -> DelegateResult<Vec<StreamRead>>
    where
        F: FnMut(&mut HashMap<String, MockStream>) -> DelegateResult<Vec<StreamRead>> + Send,
    {
        let deadline = block.filter(|d| !d.is_zero()).map(|d| Instant::now() + d);

        loop {
            let appended = self.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            {
                let mut streams = self.streams.lock().await;
                let found = attempt(&mut streams)?;
                if !found.is_empty() || block.is_none() {
                    return Ok(found);
                }
            }

            match deadline {
                None => appended.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, appended).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
            }
        }
    }
}

/// Mock stream connection.
pub struct MockStreamConnection {
    db: Arc<MockStreamDb>,
    closed: AtomicBool,
    fail_on_close: AtomicBool,
}

impl Default for MockStreamConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStreamConnection {
    /// Connection to a private database.
    pub fn new() -> Self {
        Self::with_db(Arc::new(MockStreamDb::new()))
    }

    pub fn with_db(db: Arc<MockStreamDb>) -> Self {
        Self {
            db,
            closed: AtomicBool::new(false),
            fail_on_close: AtomicBool::new(false),
        }
    }

    /// Make the next `close` calls fail without closing.
    pub fn set_fail_on_close(&self, fail: bool) {
        self.fail_on_close.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> DelegateResult<()> {
        if self.is_closed() {
            Err(DelegateError::msg("connection is closed"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StreamConnection for MockStreamConnection {
    async fn add(&self, channel: &str, fields: &FieldMap) -> DelegateResult<String> {
        self.ensure_open()?;
        if fields.is_empty() {
            return Err(DelegateError::msg(
                "ERR wrong number of arguments for 'xadd' command",
            ));
        }

        let id = {
            let mut streams = self.db.streams.lock().await;
            let stream = streams.entry(channel.to_string()).or_default();
            let id = EntryId::next_after(stream.last_id);
            stream.entries.insert(id, encode(fields));
            stream.last_id = id;
            id
        };
        self.db.appended.notify_waiters();

        Ok(id.to_string())
    }

    async fn read(
        &self,
        channel: &str,
        last_id: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> DelegateResult<Vec<StreamRead>> {
        self.ensure_open()?;

        // "$" is resolved once, when the call starts.
        let after = if last_id == super::NEW_ENTRIES_ONLY {
            let streams = self.db.streams.lock().await;
            streams.get(channel).map(|s| s.last_id).unwrap_or_default()
        } else {
            EntryId::parse(last_id, 0)?
        };

        self.db
            .poll_until(block, |streams| {
                let entries = streams
                    .get(channel)
                    .map(|s| s.entries_after(after, count))
                    .unwrap_or_default();
                Ok(to_reads(channel, entries))
            })
            .await
    }

    async fn read_group(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> DelegateResult<Vec<StreamRead>> {
        self.ensure_open()?;

        self.db
            .poll_until(block, |streams| {
                let stream = streams
                    .get_mut(channel)
                    .ok_or_else(|| no_group(channel, group, "XREADGROUP"))?;
                let after = stream
                    .groups
                    .get(group)
                    .map(|g| g.last_delivered)
                    .ok_or_else(|| no_group(channel, group, "XREADGROUP"))?;

                let entries = stream.entries_after(after, count);
                if let (Some(state), Some((last, _))) = (stream.groups.get_mut(group), entries.last()) {
                    state.last_delivered = *last;
                    for (id, _) in &entries {
                        state.pending.insert(*id, consumer.to_string());
                    }
                }
                Ok(to_reads(channel, entries))
            })
            .await
    }

    async fn range(&self, channel: &str, start: &str, stop: &str) -> DelegateResult<Vec<StreamEntry>> {
        self.ensure_open()?;
        let start = EntryId::range_start(start)?;
        let stop = EntryId::range_end(stop)?;
        if start > stop {
            return Ok(Vec::new());
        }

        let streams = self.db.streams.lock().await;
        Ok(streams
            .get(channel)
            .map(|s| {
                s.entries
                    .range(start..=stop)
                    .map(|(id, fields)| StreamEntry {
                        id: id.to_string(),
                        fields: decode(fields),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, channel: &str, ids: &[String]) -> DelegateResult<u64> {
        self.ensure_open()?;
        let ids = ids
            .iter()
            .map(|id| EntryId::parse(id, 0))
            .collect::<DelegateResult<Vec<_>>>()?;

        let mut streams = self.db.streams.lock().await;
        let Some(stream) = streams.get_mut(channel) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| stream.entries.remove(id).is_some())
            .count() as u64)
    }

    async fn create_group(&self, channel: &str, group: &str, start: &str) -> DelegateResult<String> {
        self.ensure_open()?;
        let mut streams = self.db.streams.lock().await;
        let stream = streams.get_mut(channel).ok_or_else(missing_key)?;

        if stream.groups.contains_key(group) {
            return Err(DelegateError::msg(
                "BUSYGROUP Consumer Group name already exists",
            ));
        }
        let last_delivered = if start == super::NEW_ENTRIES_ONLY {
            stream.last_id
        } else {
            EntryId::parse(start, 0)?
        };
        stream.groups.insert(
            group.to_string(),
            MockGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok("OK".to_string())
    }

    async fn destroy_group(&self, channel: &str, group: &str) -> DelegateResult<u64> {
        self.ensure_open()?;
        let mut streams = self.db.streams.lock().await;
        let stream = streams.get_mut(channel).ok_or_else(missing_key)?;
        Ok(stream.groups.remove(group).map(|_| 1).unwrap_or(0))
    }

    async fn pending(&self, channel: &str, group: &str) -> DelegateResult<PendingSummary> {
        self.ensure_open()?;
        let streams = self.db.streams.lock().await;
        let state = streams
            .get(channel)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(channel, group, "XPENDING"))?;

        let mut per_consumer: BTreeMap<&str, u64> = BTreeMap::new();
        for consumer in state.pending.values() {
            *per_consumer.entry(consumer.as_str()).or_default() += 1;
        }

        Ok(PendingSummary {
            count: state.pending.len() as u64,
            lower: state.pending.keys().next().map(|id| id.to_string()),
            higher: state.pending.keys().next_back().map(|id| id.to_string()),
            consumers: per_consumer
                .into_iter()
                .map(|(consumer, count)| ConsumerPending {
                    consumer: consumer.to_string(),
                    count,
                })
                .collect(),
        })
    }

    async fn ack(&self, channel: &str, group: &str, ids: &[String]) -> DelegateResult<u64> {
        self.ensure_open()?;
        let ids = ids
            .iter()
            .map(|id| EntryId::parse(id, 0))
            .collect::<DelegateResult<Vec<_>>>()?;

        let mut streams = self.db.streams.lock().await;
        let Some(state) = streams.get_mut(channel).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| state.pending.remove(id).is_some())
            .count() as u64)
    }

    async fn close(&self) -> DelegateResult<()> {
        if self.fail_on_close.load(Ordering::SeqCst) {
            return Err(DelegateError::msg("injected close failure"));
        }
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DelegateError::msg("connection is closed"));
        }
        Ok(())
    }
}

/// Mock connector: one shared database per endpoint.
///
/// Keeps every connection it opens, in order, so tests can inject failures
/// into a specific handle's connection.
#[derive(Default)]
pub struct MockConnector {
    dbs: Mutex<HashMap<StreamEndpoint, Arc<MockStreamDb>>>,
    opened: Mutex<Vec<Arc<MockStreamConnection>>>,
    fail_on_connect: AtomicBool,
    connects: AtomicUsize,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_connect(&self, fail: bool) {
        self.fail_on_connect.store(fail, Ordering::SeqCst);
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The `index`-th connection opened by this connector.
    pub async fn connection(&self, index: usize) -> Option<Arc<MockStreamConnection>> {
        self.opened.lock().await.get(index).cloned()
    }

    pub async fn connections(&self) -> Vec<Arc<MockStreamConnection>> {
        self.opened.lock().await.clone()
    }
}

#[async_trait]
impl StreamConnector for MockConnector {
    async fn connect(&self, endpoint: &StreamEndpoint) -> DelegateResult<Arc<dyn StreamConnection>> {
        if self.fail_on_connect.load(Ordering::SeqCst) {
            return Err(DelegateError::msg(format!(
                "Connection refused ({})",
                endpoint.address()
            )));
        }

        let db = self
            .dbs
            .lock()
            .await
            .entry(endpoint.clone())
            .or_default()
            .clone();
        let conn = Arc::new(MockStreamConnection::with_db(db));
        self.opened.lock().await.push(conn.clone());
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(conn)
    }
}
