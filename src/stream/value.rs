//! Stream entry payload types.

use std::collections::BTreeMap;
use std::fmt;

/// A single field value in a stream entry.
///
/// The stream database stores every value as a byte string; the variants only
/// control how a value is encoded on the way in. On the way out, values come
/// back as [`StreamValue::String`] when they are valid UTF-8 and as
/// [`StreamValue::Bytes`] otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamValue {
    String(String),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

impl StreamValue {
    /// Decode a raw value read back from the stream database.
    pub fn from_wire(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(s) => StreamValue::String(s),
            Err(e) => StreamValue::Bytes(e.into_bytes()),
        }
    }

    /// Encoded form as stored by the stream database.
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            StreamValue::String(s) => s.as_bytes().to_vec(),
            StreamValue::Int(i) => i.to_string().into_bytes(),
            StreamValue::Float(f) => f.to_string().into_bytes(),
            StreamValue::Bytes(b) => b.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StreamValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Interpret the value as an integer, parsing string values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StreamValue::Int(i) => Some(*i),
            StreamValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Interpret the value as a float, parsing string values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StreamValue::Float(f) => Some(*f),
            StreamValue::Int(i) => Some(*i as f64),
            StreamValue::String(s) => s.parse().ok(),
            StreamValue::Bytes(_) => None,
        }
    }
}

impl fmt::Display for StreamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamValue::String(s) => f.write_str(s),
            StreamValue::Int(i) => write!(f, "{}", i),
            StreamValue::Float(v) => write!(f, "{}", v),
            StreamValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<String> for StreamValue {
    fn from(value: String) -> Self {
        StreamValue::String(value)
    }
}

impl From<&str> for StreamValue {
    fn from(value: &str) -> Self {
        StreamValue::String(value.to_string())
    }
}

impl From<i64> for StreamValue {
    fn from(value: i64) -> Self {
        StreamValue::Int(value)
    }
}

impl From<i32> for StreamValue {
    fn from(value: i32) -> Self {
        StreamValue::Int(value.into())
    }
}

impl From<u32> for StreamValue {
    fn from(value: u32) -> Self {
        StreamValue::Int(value.into())
    }
}

impl From<f64> for StreamValue {
    fn from(value: f64) -> Self {
        StreamValue::Float(value)
    }
}

impl From<Vec<u8>> for StreamValue {
    fn from(value: Vec<u8>) -> Self {
        StreamValue::Bytes(value)
    }
}

impl From<&[u8]> for StreamValue {
    fn from(value: &[u8]) -> Self {
        StreamValue::Bytes(value.to_vec())
    }
}

/// Field/value payload of a stream entry.
pub type FieldMap = BTreeMap<String, StreamValue>;

/// Build a [`FieldMap`] from `(field, value)` pairs.
pub fn fields<K, V, I>(pairs: I) -> FieldMap
where
    K: Into<String>,
    V: Into<StreamValue>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// One entry of a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: FieldMap,
}

impl StreamEntry {
    pub fn get(&self, field: &str) -> Option<&StreamValue> {
        self.fields.get(field)
    }
}

/// Entries returned for one stream by a consume call.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRead {
    pub channel: String,
    pub entries: Vec<StreamEntry>,
}

/// Pending entries held by one consumer of a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerPending {
    pub consumer: String,
    pub count: u64,
}

/// Summary of a consumer group's pending entries list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    /// Smallest pending id, `None` when nothing is pending.
    pub lower: Option<String>,
    /// Greatest pending id, `None` when nothing is pending.
    pub higher: Option<String>,
    pub consumers: Vec<ConsumerPending>,
}

impl PendingSummary {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Pending count for one consumer (0 if the consumer holds nothing).
    pub fn for_consumer(&self, consumer: &str) -> u64 {
        self.consumers
            .iter()
            .find(|c| c.consumer == consumer)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}
