//! Stream clients over an append-only stream database.
//!
//! This module contains:
//! - `StreamConnection` / `StreamConnector` traits: the stream database surface
//! - `StreamHandle`: a connection bound to one channel (stream key)
//! - `StreamManager`: category registry of handles with bulk teardown
//! - Implementations: Redis, in-memory mock

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DelegateError;

mod config;
mod handle;
mod manager;
pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;
mod value;

pub use config::{ClosePolicy, StreamEndpoint, StreamsConfig};
pub use handle::StreamHandle;
pub use manager::StreamManager;
pub use mock::{MockConnector, MockStreamConnection};
#[cfg(feature = "redis")]
pub use self::redis::{RedisConnector, RedisStreamConnection};
pub use value::{
    fields, ConsumerPending, FieldMap, PendingSummary, StreamEntry, StreamRead, StreamValue,
};

/// Id sentinel for the smallest possible entry id in a range read.
pub const RANGE_MIN: &str = "-";
/// Id sentinel for the greatest possible entry id in a range read.
pub const RANGE_MAX: &str = "+";
/// Consume only entries added after the call starts.
pub const NEW_ENTRIES_ONLY: &str = "$";
/// Consume from the beginning of the channel.
pub const FROM_START: &str = "0";

// ============================================================================
// Errors
// ============================================================================

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Result type for calls into the stream database.
pub type DelegateResult<T> = std::result::Result<T, DelegateError>;

/// Errors that can occur during stream operations.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Close(#[from] CloseError),

    #[error("{operation} on channel '{channel}' failed")]
    Delegate {
        operation: &'static str,
        channel: String,
        source: DelegateError,
    },
}

/// A handle that could not be closed.
#[derive(Debug)]
pub struct CloseFailure {
    pub category: String,
    pub channel: String,
    pub source: DelegateError,
}

/// Failures collected while closing a manager's handles.
///
/// Under [`ClosePolicy::FailFast`] this always holds exactly one failure.
#[derive(Debug, thiserror::Error)]
#[error(
    "an error occurred while closing {} stream client(s){}",
    .failures.len(),
    describe_failures(.failures)
)]
pub struct CloseError {
    pub failures: Vec<CloseFailure>,
}

impl CloseError {
    /// The first failure encountered.
    pub fn first(&self) -> Option<&CloseFailure> {
        self.failures.first()
    }
}

fn describe_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("; [{}/{}]: {}", f.category, f.channel, f.source))
        .collect()
}

// ============================================================================
// Traits
// ============================================================================

/// Interface to the stream database, one connection per implementation value.
///
/// Implementations:
/// - `RedisStreamConnection`: Redis Streams over a multiplexed connection
/// - `MockStreamConnection`: In-memory mock for testing
///
/// A `block` of `None` never blocks; `Some(Duration::ZERO)` blocks until an
/// entry arrives. Dropping the returned future cancels a blocked read.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// Append an entry with a generated id and return that id.
    async fn add(&self, channel: &str, fields: &FieldMap) -> DelegateResult<String>;

    /// Read entries with ids greater than `last_id`.
    async fn read(
        &self,
        channel: &str,
        last_id: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> DelegateResult<Vec<StreamRead>>;

    /// Read entries never delivered to `group`, assigning them to `consumer`.
    async fn read_group(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: Option<usize>,
        block: Option<Duration>,
    ) -> DelegateResult<Vec<StreamRead>>;

    /// Entries with ids in `[start, stop]`.
    async fn range(&self, channel: &str, start: &str, stop: &str)
        -> DelegateResult<Vec<StreamEntry>>;

    async fn delete(&self, channel: &str, ids: &[String]) -> DelegateResult<u64>;

    async fn create_group(&self, channel: &str, group: &str, start: &str)
        -> DelegateResult<String>;

    async fn destroy_group(&self, channel: &str, group: &str) -> DelegateResult<u64>;

    async fn pending(&self, channel: &str, group: &str) -> DelegateResult<PendingSummary>;

    async fn ack(&self, channel: &str, group: &str, ids: &[String]) -> DelegateResult<u64>;

    /// Release the connection. Closing twice is an error.
    async fn close(&self) -> DelegateResult<()>;
}

/// Opens stream connections for an endpoint.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, endpoint: &StreamEndpoint) -> DelegateResult<Arc<dyn StreamConnection>>;
}
