//! Object store trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Errors that can occur during object store operations.
///
/// Every error is pre-classified: `is_transient()` tells the caller whether
/// the failure class is worth a retry. The S3 adapter already retries
/// transient failures internally (bounded backoff), so a `Transient` value
/// reaching a caller means the retry budget is exhausted.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("multipart upload not found: {0}")]
    UploadNotFound(String),

    #[error("declared size {declared} but stream carried {actual} bytes")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("store rejected request: {0}")]
    Terminal(String),

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Io(_))
    }
}

/// Result of a `stat` call.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub name: String,
    pub size: u64,
    pub etag: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A completed or recorded multipart part.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Result of assembling a multipart upload.
#[derive(Debug, Clone)]
pub struct CompletedObject {
    pub etag: String,
    pub size: u64,
}

/// Boxed byte reader handed across the trait boundary.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Thin, typed wrapper over S3-compatible operations.
///
/// This trait is object-safe and used as `Arc<dyn ObjectStore>`; tests
/// substitute an in-memory implementation.
///
/// All names are keys within the single configured ingest bucket.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the ingest bucket if it does not already exist.
    async fn ensure_bucket(&self) -> Result<(), StoreError>;

    /// Size/etag probe; `None` when the object does not exist.
    async fn stat(&self, name: &str) -> Result<Option<ObjectStat>, StoreError>;

    /// List all objects under `prefix` (internally paginated).
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError>;

    /// User metadata of one object (HeadObject).
    async fn head_metadata(&self, name: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Stream `reader` into the store under `name`.
    ///
    /// `declared_size` is authoritative: the reader is drained to exactly
    /// that count and the call fails on early or late EOF. At most one
    /// fixed-size block of the payload is resident at any time.
    async fn put_stream(
        &self,
        name: &str,
        reader: ByteReader,
        declared_size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Open a streaming reader over a stored object.
    async fn get_stream(&self, name: &str) -> Result<ByteReader, StoreError>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Replace an object's user metadata in place (server-side copy; the
    /// payload bytes are not transferred or altered). Used to attach the
    /// content hash once the stream has been traversed.
    async fn set_metadata(
        &self,
        name: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    // === Multipart ===

    /// Begin a multipart upload, returning the store-side upload id.
    async fn multipart_init(
        &self,
        name: &str,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<String, StoreError>;

    /// Presigned URL for uploading one part directly to the store.
    async fn multipart_part_url(
        &self,
        name: &str,
        upload_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Result<String, StoreError>;

    /// Parts the store has already received for an open upload (resume support).
    async fn multipart_parts(
        &self,
        name: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, StoreError>;

    /// Assemble `parts` (sorted by part number) into the final object.
    async fn multipart_complete(
        &self,
        name: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompletedObject, StoreError>;

    /// Abort an upload and release its parts at the store.
    async fn multipart_abort(&self, name: &str, upload_id: &str) -> Result<(), StoreError>;

    // === Presigning ===

    /// Short-lived signed PUT URL. Carries no transformation parameters.
    async fn presign_put(
        &self,
        name: &str,
        ttl: Duration,
        content_type: &str,
    ) -> Result<String, StoreError>;

    /// Short-lived signed GET URL.
    async fn presign_get(&self, name: &str, ttl: Duration) -> Result<String, StoreError>;
}
