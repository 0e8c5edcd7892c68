//! Stream configuration types.

use serde::Deserialize;

/// Location of a stream database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(default)]
pub struct StreamEndpoint {
    pub host: String,
    pub port: u16,
    /// Logical database index.
    pub db: u8,
}

impl Default for StreamEndpoint {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
        }
    }
}

impl StreamEndpoint {
    pub fn new(host: impl Into<String>, port: u16, db: u8) -> Self {
        Self {
            host: host.into(),
            port,
            db,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connection URL understood by the Redis client.
    pub fn connection_url(&self) -> String {
        format!("redis://{}/{}", self.address(), self.db)
    }
}

/// How [`StreamManager::close_all`](super::StreamManager::close_all) reacts to
/// a handle that fails to close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Stop at the first failure. Handles not yet visited stay registered.
    #[default]
    FailFast,
    /// Close every handle and report all failures together.
    BestEffort,
}

/// Stream manager configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// Endpoint used when the caller does not supply one.
    pub endpoint: StreamEndpoint,
    pub close_policy: ClosePolicy,
}
