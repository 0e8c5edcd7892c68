//! Upload and download through one S3 client.

use std::sync::atomic::{AtomicBool, Ordering};

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{Result, StorageError, TransferOptions};
use crate::error::{BoxError, DelegateError};

/// Outcome of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutput {
    pub bucket: String,
    pub key: String,
    pub e_tag: Option<String>,
    /// Set only when the body was sent as a multipart upload.
    pub upload_id: Option<String>,
    pub parts: usize,
    pub size: u64,
}

/// Transfer handle bound to a manager's connection context.
///
/// Bodies no larger than one part go out as a single PutObject; anything
/// bigger is split into parts uploaded `concurrency` at a time. A failed
/// multipart upload is aborted before the error is returned.
pub struct BucketHandle {
    client: Client,
    transfer: TransferOptions,
    closed: AtomicBool,
}

fn delegate<E>(operation: &'static str, bucket: &str, key: &str) -> impl FnOnce(E) -> StorageError
where
    E: Into<BoxError>,
{
    let bucket = bucket.to_string();
    let key = key.to_string();
    move |e| StorageError::Delegate {
        operation,
        bucket,
        key,
        source: DelegateError::new(e),
    }
}

/// Fill a buffer with up to `part_size` bytes. Short only at end of input.
async fn read_part<R>(body: &mut R, part_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut part = Vec::with_capacity(part_size);
    (&mut *body).take(part_size as u64).read_to_end(&mut part).await?;
    Ok(part)
}

impl BucketHandle {
    pub(crate) fn new(client: Client, transfer: TransferOptions) -> Self {
        Self {
            client,
            transfer,
            closed: AtomicBool::new(false),
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        self.transfer
    }

    /// Release the handle. Later transfers fail with [`StorageError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Stream `body` into `bucket/key`.
    pub async fn upload<R>(&self, bucket: &str, key: &str, mut body: R) -> Result<UploadOutput>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.ensure_open()?;

        let first = read_part(&mut body, self.transfer.part_size).await?;
        if first.len() < self.transfer.part_size {
            return self.put_single(bucket, key, first).await;
        }

        self.upload_multipart(bucket, key, first, body).await
    }

    async fn put_single(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<UploadOutput> {
        let size = data.len() as u64;
        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(delegate("PutObject", bucket, key))?;

        debug!(bucket = %bucket, key = %key, size, "Uploaded object");

        Ok(UploadOutput {
            bucket: bucket.to_string(),
            key: key.to_string(),
            e_tag: output.e_tag().map(str::to_string),
            upload_id: None,
            parts: 1,
            size,
        })
    }

    async fn upload_multipart<R>(
        &self,
        bucket: &str,
        key: &str,
        first: Vec<u8>,
        body: R,
    ) -> Result<UploadOutput>
    where
        R: AsyncRead + Unpin + Send,
    {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(delegate("CreateMultipartUpload", bucket, key))?;
        let upload_id = created
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Delegate {
                operation: "CreateMultipartUpload",
                bucket: bucket.to_string(),
                key: key.to_string(),
                source: DelegateError::msg("response carried no upload id"),
            })?;

        let uploaded = match self.upload_parts(bucket, key, &upload_id, first, body).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                self.abort(bucket, key, &upload_id).await;
                return Err(e);
            }
        };

        let mut parts: Vec<CompletedPart> = Vec::with_capacity(uploaded.len());
        let mut size = 0u64;
        for (part, len) in uploaded {
            parts.push(part);
            size += len;
        }
        parts.sort_by_key(|p| p.part_number());
        let part_count = parts.len();

        let completed = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await;
        let output = match completed {
            Ok(output) => output,
            Err(e) => {
                self.abort(bucket, key, &upload_id).await;
                return Err(delegate("CompleteMultipartUpload", bucket, key)(e));
            }
        };

        debug!(
            bucket = %bucket,
            key = %key,
            upload_id = %upload_id,
            parts = part_count,
            size,
            "Uploaded multipart object"
        );

        Ok(UploadOutput {
            bucket: bucket.to_string(),
            key: key.to_string(),
            e_tag: output.e_tag().map(str::to_string),
            upload_id: Some(upload_id),
            parts: part_count,
            size,
        })
    }

    /// Read parts off `body` and upload them with bounded parallelism.
    async fn upload_parts<R>(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        first: Vec<u8>,
        body: R,
    ) -> Result<Vec<(CompletedPart, u64)>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let part_size = self.transfer.part_size;
        let chunks = stream::unfold((Some(first), body), move |(pending, mut body)| async move {
            let chunk = match pending {
                Some(chunk) => Ok(chunk),
                None => read_part(&mut body, part_size).await,
            };
            match chunk {
                Ok(chunk) if chunk.is_empty() => None,
                chunk => Some((chunk, (None, body))),
            }
        });

        chunks
            .zip(stream::iter(1i32..))
            .map(move |(chunk, part_number)| async move {
                self.upload_part(bucket, key, upload_id, part_number, chunk?)
                    .await
            })
            .buffer_unordered(self.transfer.concurrency)
            .try_collect()
            .await
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        chunk: Vec<u8>,
    ) -> Result<(CompletedPart, u64)> {
        let len = chunk.len() as u64;
        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(chunk))
            .send()
            .await
            .map_err(delegate("UploadPart", bucket, key))?;

        let part = CompletedPart::builder()
            .set_e_tag(output.e_tag().map(str::to_string))
            .part_number(part_number)
            .build();
        Ok((part, len))
    }

    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        let aborted = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = aborted {
            warn!(
                bucket = %bucket,
                key = %key,
                upload_id = %upload_id,
                error = %e,
                "Failed to abort multipart upload"
            );
        }
    }

    /// Copy `bucket/key` into `writer`. Returns the number of bytes written.
    pub async fn download<W>(&self, bucket: &str, key: &str, mut writer: W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.ensure_open()?;

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(delegate("GetObject", bucket, key))?;

        let mut body = output.body;
        let mut written = 0u64;
        while let Some(bytes) = body
            .try_next()
            .await
            .map_err(delegate("GetObject", bucket, key))?
        {
            writer.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        writer.flush().await?;

        debug!(bucket = %bucket, key = %key, size = written, "Downloaded object");
        Ok(written)
    }
}

impl std::fmt::Debug for BucketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketHandle")
            .field("transfer", &self.transfer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
