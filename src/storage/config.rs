//! Object storage configuration.

use serde::Deserialize;

/// Smallest part S3 accepts in a multipart upload (except the last one).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
/// Default upload part size.
pub const DEFAULT_PART_SIZE: usize = MIN_PART_SIZE;
/// Default number of parts uploaded in parallel.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// S3 storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Retries after the first attempt for every S3 request.
    pub max_retries: u8,
    /// AWS region. Falls back to the environment when unset.
    pub region: Option<String>,
    /// Custom endpoint URL (for S3-compatible services like MinIO).
    pub endpoint: Option<String>,
    /// Multipart upload part size in bytes.
    pub part_size_bytes: usize,
    /// Parts uploaded in parallel.
    pub concurrency: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            region: None,
            endpoint: None,
            part_size_bytes: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl StorageConfig {
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            part_size: self.part_size_bytes,
            concurrency: self.concurrency,
        }
    }
}

/// Upload chunking applied by every bucket handle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub part_size: usize,
    pub concurrency: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl TransferOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.part_size < MIN_PART_SIZE {
            return Err(format!(
                "part size {} is below the S3 minimum of {} bytes",
                self.part_size, MIN_PART_SIZE
            ));
        }
        if self.concurrency == 0 {
            return Err("concurrency must be at least 1".to_string());
        }
        Ok(())
    }
}
