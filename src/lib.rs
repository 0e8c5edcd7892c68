//! Funicular - client registries for object storage and stream databases.
//!
//! Two thin management layers over external SDKs:
//!
//! - [`storage`]: a [`storage::StorageManager`] that shares one S3
//!   connection context across [`storage::BucketHandle`]s for upload and
//!   download (feature `s3`).
//! - [`stream`]: a [`stream::StreamManager`] that groups
//!   [`stream::StreamHandle`]s by category, each bound to one stream channel,
//!   with a Redis backend (feature `redis`) and an in-memory one.

pub mod config;
pub mod error;
#[cfg(feature = "s3")]
pub mod storage;
pub mod stream;
pub mod utils;
