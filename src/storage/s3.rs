//! S3 object store implementation using the AWS SDK

use super::traits::{
    ByteReader, CompletedObject, ObjectEntry, ObjectStat, ObjectStore, PartRecord, StoreError,
};
use crate::config::StoreConfig;
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{retry::RetryConfig, timeout::TimeoutConfig, BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

/// How many attempts the SDK makes per operation (first try + retries).
/// Transient failures (timeouts, dispatch errors, 5xx) back off
/// exponentially between attempts; the per-attempt and per-operation
/// timeouts below bound the total budget, so the caller observes at most
/// one error per upload attempt.
const MAX_ATTEMPTS: u32 = 4;

const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(120);
const OPERATION_TIMEOUT: Duration = Duration::from_secs(600);

/// S3-compatible store for ingested recordings
pub struct S3Store {
    client: Client,
    bucket: String,
    /// Part buffer for streaming puts; also the threshold below which a
    /// payload goes up as a single PutObject.
    part_size: u64,
}

impl S3Store {
    /// Build the SDK client directly from configuration (custom endpoint and
    /// path-style addressing for MinIO/LocalStack, explicit credentials when
    /// provided, default chain otherwise).
    pub fn new(config: &StoreConfig, part_size: u64) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .force_path_style(config.force_path_style)
            .retry_config(RetryConfig::standard().with_max_attempts(MAX_ATTEMPTS))
            .timeout_config(
                TimeoutConfig::builder()
                    .connect_timeout(Duration::from_secs(10))
                    .operation_attempt_timeout(ATTEMPT_TIMEOUT)
                    .operation_timeout(OPERATION_TIMEOUT)
                    .build(),
            );

        if let Some(ref endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        if let (Some(ref key_id), Some(ref secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(key_id, secret, None, None, "sermon-ingest-config");
            builder = builder.credentials_provider(credentials);
        }

        let client = Client::from_conf(builder.build());

        debug!(bucket = %config.bucket, "S3Store initialized");

        Self {
            client,
            bucket: config.bucket.clone(),
            part_size: part_size.max(5 * 1024 * 1024),
        }
    }

    /// Classify an SDK error into the closed `StoreError` set.
    fn classify<E>(op: &'static str, err: SdkError<E>) -> StoreError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                StoreError::Transient(format!("{op}: {}", DisplayErrorContext(&err)))
            }
            SdkError::ServiceError(ctx) => {
                let status = ctx.raw().status().as_u16();
                let code = ctx.err().code().unwrap_or("Unknown").to_string();
                if status >= 500 || status == 429 {
                    StoreError::Transient(format!("{op}: {code} (http {status})"))
                } else if code == "QuotaExceeded" || code == "StorageFull" {
                    StoreError::InsufficientStorage(format!("{op}: {code}"))
                } else {
                    StoreError::Terminal(format!("{op}: {code} (http {status})"))
                }
            }
            _ => StoreError::Terminal(format!("{op}: {}", DisplayErrorContext(&err))),
        }
    }

    /// Fill `buf` from `reader`, stopping at EOF. Returns bytes read.
    async fn fill_block(reader: &mut ByteReader, buf: &mut [u8]) -> Result<usize, StoreError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// After exactly `declared_size` bytes were consumed, the stream must be
    /// at EOF; a single extra readable byte fails the size contract.
    async fn expect_eof(reader: &mut ByteReader, declared: u64) -> Result<(), StoreError> {
        let mut probe = [0u8; 1];
        if reader.read(&mut probe).await? > 0 {
            return Err(StoreError::SizeMismatch {
                declared,
                actual: declared + 1,
            });
        }
        Ok(())
    }

    /// Streaming put above the single-block threshold: SDK multipart upload
    /// with one block in flight at a time.
    async fn put_stream_multipart(
        &self,
        name: &str,
        mut reader: ByteReader,
        declared_size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let upload_id = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .content_type(content_type)
            .set_metadata(Some(user_metadata))
            .send()
            .await
            .map_err(|e| Self::classify("create_multipart_upload", e))?
            .upload_id
            .ok_or_else(|| StoreError::Terminal("store returned no upload id".into()))?;

        // If the caller's future is dropped mid-stream (client disconnect),
        // the guard releases the store-side upload.
        let mut guard = UploadAbortGuard {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: name.to_string(),
            upload_id: upload_id.clone(),
            armed: true,
        };

        let result = self
            .stream_parts(name, &upload_id, &mut reader, declared_size)
            .await;

        let completed_parts = match result {
            Ok(parts) => parts,
            Err(err) => {
                guard.disarm();
                if let Err(abort_err) = self.multipart_abort(name, &upload_id).await {
                    warn!(name, error = %abort_err, "failed to abort multipart upload after error");
                }
                return Err(err);
            }
        };

        // Guard stays armed through completion: a drop or failure here still
        // releases the upload.
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Self::classify("complete_multipart_upload", e))?;

        guard.disarm();
        Ok(())
    }

    async fn stream_parts(
        &self,
        name: &str,
        upload_id: &str,
        reader: &mut ByteReader,
        declared_size: u64,
    ) -> Result<Vec<CompletedPart>, StoreError> {
        let mut completed = Vec::new();
        let mut sent: u64 = 0;
        let mut part_number: i32 = 1;

        while sent < declared_size {
            let chunk = (declared_size - sent).min(self.part_size) as usize;
            let mut buf = vec![0u8; chunk];
            let filled = Self::fill_block(reader, &mut buf).await?;
            if filled < chunk {
                return Err(StoreError::SizeMismatch {
                    declared: declared_size,
                    actual: sent + filled as u64,
                });
            }

            let out = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(name)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| Self::classify("upload_part", e))?;

            completed.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(out.e_tag().unwrap_or_default())
                    .build(),
            );

            sent += chunk as u64;
            part_number += 1;
        }

        Self::expect_eof(reader, declared_size).await?;
        Ok(completed)
    }
}

/// Releases a store-side multipart upload when the owning future is dropped
/// mid-stream. Disarmed on the completion and explicit-abort paths.
struct UploadAbortGuard {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    armed: bool,
}

impl UploadAbortGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UploadAbortGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let client = self.client.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let key = std::mem::take(&mut self.key);
        let upload_id = std::mem::take(&mut self.upload_id);
        tokio::spawn(async move {
            if let Err(err) = client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(&key)
                .upload_id(upload_id)
                .send()
                .await
            {
                warn!(key, error = %DisplayErrorContext(&err), "abort after cancellation failed");
            }
        });
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn ensure_bucket(&self) -> Result<(), StoreError> {
        let head = self.client.head_bucket().bucket(&self.bucket).send().await;
        match head {
            Ok(_) => return Ok(()),
            Err(SdkError::ServiceError(ctx)) if ctx.raw().status().as_u16() == 404 => {}
            Err(e) => return Err(Self::classify("head_bucket", e)),
        }

        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Self::classify("create_bucket", e))?;
        debug!(bucket = %self.bucket, "created ingest bucket");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stat(&self, name: &str) -> Result<Option<ObjectStat>, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
        {
            Ok(out) => Ok(Some(ObjectStat {
                size: out.content_length().unwrap_or(0) as u64,
                etag: out.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                last_modified: out.last_modified().and_then(to_chrono),
            })),
            Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(None),
            Err(e) => Err(Self::classify("head_object", e)),
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Self::classify("list_objects_v2", e))?;

            for object in response.contents() {
                let Some(name) = object.key() else { continue };
                entries.push(ObjectEntry {
                    name: name.to_string(),
                    size: object.size().unwrap_or(0) as u64,
                    etag: object
                        .e_tag()
                        .unwrap_or_default()
                        .trim_matches('"')
                        .to_string(),
                    last_modified: object.last_modified().and_then(to_chrono),
                });
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn head_metadata(&self, name: &str) -> Result<HashMap<String, String>, StoreError> {
        let out = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(ctx) if ctx.err().is_not_found() => {
                    StoreError::NotFound(name.to_string())
                }
                _ => Self::classify("head_object", e),
            })?;
        Ok(out.metadata().cloned().unwrap_or_default())
    }

    #[instrument(skip(self, reader, user_metadata))]
    async fn put_stream(
        &self,
        name: &str,
        mut reader: ByteReader,
        declared_size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        if declared_size > self.part_size {
            return self
                .put_stream_multipart(name, reader, declared_size, content_type, user_metadata)
                .await;
        }

        // Small payload: exactly one block, single PutObject.
        let mut buf = vec![0u8; declared_size as usize];
        let filled = Self::fill_block(&mut reader, &mut buf).await?;
        if (filled as u64) < declared_size {
            return Err(StoreError::SizeMismatch {
                declared: declared_size,
                actual: filled as u64,
            });
        }
        Self::expect_eof(&mut reader, declared_size).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .content_type(content_type)
            .content_length(declared_size as i64)
            .set_metadata(Some(user_metadata))
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| Self::classify("put_object", e))?;

        debug!(name, size = declared_size, "stored object");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_stream(&self, name: &str) -> Result<ByteReader, StoreError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(ctx) if ctx.err().is_no_such_key() => {
                    StoreError::NotFound(name.to_string())
                }
                _ => Self::classify("get_object", e),
            })?;
        Ok(Box::new(out.body.into_async_read()))
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| Self::classify("delete_object", e))?;
        debug!(name, "deleted object");
        Ok(())
    }

    #[instrument(skip(self, user_metadata))]
    async fn set_metadata(
        &self,
        name: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        // Single-request CopyObject caps out at 5 GiB. Beyond that the
        // rewrite would need a full multipart copy; the in-memory index
        // still carries the hash, so skip and warn instead.
        if let Some(stat) = self.stat(name).await? {
            if stat.size > 5 * 1024 * 1024 * 1024 {
                warn!(name, size = stat.size, "object too large for metadata rewrite");
                return Ok(());
            }
        }

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .key(name)
            .copy_source(format!("{}/{}", self.bucket, urlencoding::encode(name)))
            .metadata_directive(aws_sdk_s3::types::MetadataDirective::Replace)
            .set_metadata(Some(user_metadata))
            .send()
            .await
            .map_err(|e| Self::classify("copy_object", e))?;
        debug!(name, "rewrote object metadata");
        Ok(())
    }

    #[instrument(skip(self, user_metadata))]
    async fn multipart_init(
        &self,
        name: &str,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<String, StoreError> {
        let out = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .content_type(content_type)
            .set_metadata(Some(user_metadata))
            .send()
            .await
            .map_err(|e| Self::classify("create_multipart_upload", e))?;
        out.upload_id
            .ok_or_else(|| StoreError::Terminal("store returned no upload id".into()))
    }

    #[instrument(skip(self))]
    async fn multipart_part_url(
        &self,
        name: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Terminal(format!("presigning config: {e}")))?;
        let presigned = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .presigned(presigning)
            .await
            .map_err(|e| Self::classify("presign_upload_part", e))?;
        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self))]
    async fn multipart_parts(
        &self,
        name: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, StoreError> {
        let out = self
            .client
            .list_parts()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(ctx) if ctx.err().code() == Some("NoSuchUpload") => {
                    StoreError::UploadNotFound(upload_id.to_string())
                }
                _ => Self::classify("list_parts", e),
            })?;

        let mut parts: Vec<PartRecord> = out
            .parts()
            .iter()
            .filter_map(|p| {
                Some(PartRecord {
                    part_number: p.part_number()? as u32,
                    etag: p.e_tag()?.trim_matches('"').to_string(),
                    size: p.size().unwrap_or(0) as u64,
                })
            })
            .collect();
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    #[instrument(skip(self, parts))]
    async fn multipart_complete(
        &self,
        name: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompletedObject, StoreError> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let out = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(ctx) if ctx.err().code() == Some("NoSuchUpload") => {
                    StoreError::UploadNotFound(upload_id.to_string())
                }
                _ => Self::classify("complete_multipart_upload", e),
            })?;

        let etag = out.e_tag().unwrap_or_default().trim_matches('"').to_string();

        // CompleteMultipartUpload reports no size; one HeadObject closes the gap.
        let size = self
            .stat(name)
            .await?
            .map(|s| s.size)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        Ok(CompletedObject { etag, size })
    }

    #[instrument(skip(self))]
    async fn multipart_abort(&self, name: &str, upload_id: &str) -> Result<(), StoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Self::classify("abort_multipart_upload", e))?;
        debug!(name, upload_id, "aborted multipart upload");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn presign_put(
        &self,
        name: &str,
        ttl: Duration,
        content_type: &str,
    ) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Terminal(format!("presigning config: {e}")))?;
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .content_type(content_type)
            .presigned(presigning)
            .await
            .map_err(|e| Self::classify("presign_put_object", e))?;
        Ok(presigned.uri().to_string())
    }

    #[instrument(skip(self))]
    async fn presign_get(&self, name: &str, ttl: Duration) -> Result<String, StoreError> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StoreError::Terminal(format!("presigning config: {e}")))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .presigned(presigning)
            .await
            .map_err(|e| Self::classify("presign_get_object", e))?;
        Ok(presigned.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_size_floor() {
        // The store-mandated minimum for non-final parts is 5 MiB; a
        // smaller configured part size is clamped up.
        let store = S3Store::new(&StoreConfig::default(), 1024);
        assert_eq!(store.part_size, 5 * 1024 * 1024);

        let store = S3Store::new(&StoreConfig::default(), 8 * 1024 * 1024);
        assert_eq!(store.part_size, 8 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_fill_block_short_read() {
        let data: &[u8] = b"hello";
        let mut reader: ByteReader = Box::new(data);
        let mut buf = vec![0u8; 16];
        let n = S3Store::fill_block(&mut reader, &mut buf).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[tokio::test]
    async fn test_expect_eof_detects_excess() {
        let data: &[u8] = b"x";
        let mut reader: ByteReader = Box::new(data);
        let err = S3Store::expect_eof(&mut reader, 10).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::SizeMismatch {
                declared: 10,
                actual: 11
            }
        ));

        let empty: &[u8] = b"";
        let mut reader: ByteReader = Box::new(empty);
        assert!(S3Store::expect_eof(&mut reader, 10).await.is_ok());
    }
}
