//! S3 bucket transfer handles.
//!
//! A [`StorageManager`] owns one [`ConnectionContext`] (credentials, region,
//! endpoint, retry limit) and mints [`BucketHandle`]s that share it. Handles
//! expose upload and download; retries, signing and checksums are the SDK's.

use std::fmt;
use std::sync::Arc;

use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DelegateError;

mod config;
mod handle;

pub use config::{
    StorageConfig, TransferOptions, DEFAULT_CONCURRENCY, DEFAULT_PART_SIZE, MIN_PART_SIZE,
};
pub use handle::{BucketHandle, UploadOutput};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid transfer options: {0}")]
    Validation(String),

    #[error("Bucket handle is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} s3://{bucket}/{key} failed")]
    Delegate {
        operation: &'static str,
        bucket: String,
        key: String,
        source: DelegateError,
    },
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

fn retry_config(max_retries: u8) -> RetryConfig {
    RetryConfig::standard().with_max_attempts(u32::from(max_retries) + 1)
}

/// Connection settings shared by every handle of a manager.
///
/// Immutable once built; handles get their own client over a clone of it.
#[derive(Clone)]
pub struct ConnectionContext {
    s3: aws_sdk_s3::Config,
    max_retries: u8,
    transfer: TransferOptions,
}

impl ConnectionContext {
    /// Load credentials and region from the environment, retrying each
    /// request up to `max_retries` times after the first attempt.
    pub async fn load(max_retries: u8) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .retry_config(retry_config(max_retries))
            .load()
            .await;

        Self {
            s3: aws_sdk_s3::Config::from(&sdk_config),
            max_retries,
            transfer: TransferOptions::default(),
        }
    }

    /// As [`ConnectionContext::load`], applying region, endpoint and transfer
    /// options from configuration.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        let transfer = config.transfer_options();
        transfer.validate().map_err(StorageError::Validation)?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .retry_config(retry_config(config.max_retries));
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            builder = builder
                .endpoint_url(endpoint)
                .force_path_style(true); // Required for MinIO and most S3-compatible services
        }

        Ok(Self {
            s3: builder.build(),
            max_retries: config.max_retries,
            transfer,
        })
    }

    /// Use an explicit S3 client configuration. The retry limit overrides
    /// whatever retry settings `s3` carries.
    pub fn from_s3_config(s3: aws_sdk_s3::Config, max_retries: u8) -> Self {
        Self {
            s3: s3.to_builder().retry_config(retry_config(max_retries)).build(),
            max_retries,
            transfer: TransferOptions::default(),
        }
    }

    pub fn with_transfer_options(mut self, transfer: TransferOptions) -> Result<Self> {
        transfer.validate().map_err(StorageError::Validation)?;
        self.transfer = transfer;
        Ok(self)
    }

    pub fn max_retries(&self) -> u8 {
        self.max_retries
    }

    pub fn transfer_options(&self) -> TransferOptions {
        self.transfer
    }

    pub fn s3_config(&self) -> &aws_sdk_s3::Config {
        &self.s3
    }

    fn client(&self) -> Client {
        Client::from_conf(self.s3.clone())
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("max_retries", &self.max_retries)
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

/// Registry of bucket handles over one shared connection context.
pub struct StorageManager {
    context: ConnectionContext,
    handles: Mutex<Vec<Arc<BucketHandle>>>,
}

impl StorageManager {
    /// Build a manager from the ambient AWS environment.
    pub async fn new(max_retries: u8) -> Self {
        Self::with_context(ConnectionContext::load(max_retries).await)
    }

    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        info!(
            max_retries = config.max_retries,
            region = ?config.region,
            endpoint = ?config.endpoint,
            "StorageManager: s3"
        );
        Ok(Self::with_context(ConnectionContext::from_config(config).await?))
    }

    pub fn with_context(context: ConnectionContext) -> Self {
        Self {
            context,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &ConnectionContext {
        &self.context
    }

    /// Mint a new handle bound to the shared context.
    ///
    /// The S3 client connects lazily, so this never touches the network.
    pub async fn add_bucket_manager(&self) -> Arc<BucketHandle> {
        let handle = Arc::new(BucketHandle::new(
            self.context.client(),
            self.context.transfer_options(),
        ));

        let mut handles = self.handles.lock().await;
        handles.push(handle.clone());
        debug!(handles = handles.len(), "Added bucket handle");

        handle
    }

    /// Registered handles in creation order.
    pub async fn handles(&self) -> Vec<Arc<BucketHandle>> {
        self.handles.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.handles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.lock().await.is_empty()
    }

    /// Close and drop every handle. Returns how many were released.
    pub async fn close_all(&self) -> usize {
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        if handles.is_empty() {
            info!("Manager has no bucket handles to close");
            return 0;
        }

        for handle in &handles {
            handle.close();
        }
        info!(closed = handles.len(), "Closed all bucket handles");
        handles.len()
    }
}
