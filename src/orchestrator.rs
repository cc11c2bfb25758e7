//! Upload orchestrator: the per-upload state machine.
//!
//! Routes every upload through one of three modes — direct presign, proxy
//! stream, multipart — and drives the store adapter, hash index, integrity
//! pipeline, and session registry. Duplicate policy is enforced twice: a
//! cheap name+size pre-check before any byte moves, and the authoritative
//! hash check at commit time. The streaming paths are optimistic: the hash
//! is unknown until the stream ends, so a losing duplicate is deleted after
//! the fact and the caller is pointed at the existing object.

use crate::config::Config;
use crate::hash_index::{HashIndex, IndexLookup, IndexStats};
use crate::integrity::{hash_reader, HashingReader};
use crate::metrics::Metrics;
use crate::notify::{CommitEvent, CommitNotifier};
use crate::session::{SessionError, SessionRegistry, SessionStatus, UploadSession};
use crate::storage::{ByteReader, ObjectStore, PartRecord, StoreError};
use crate::types::{
    self, AudioObjectMetadata, SanitizedName, UploadMode, UploadTicket, WAV_CONTENT_TYPE,
};
use chrono::Utc;
use md5::{Digest, Md5};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Errors surfaced by orchestrator operations. The HTTP layer maps each
/// variant onto a status code; see `api::errors`.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),

    #[error("duplicate of existing object {existing}")]
    Duplicate { existing: String },

    #[error("hash index is still warming up")]
    NotReady,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<SessionError> for UploadError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => UploadError::NotFound(format!("session {id}")),
            SessionError::NotOpen { .. } => UploadError::Validation(err.to_string()),
            SessionError::InvalidPart(msg) => UploadError::Validation(msg),
            SessionError::Incomplete(msg) => UploadError::Validation(msg),
        }
    }
}

/// A ticket plus the policy facts the HTTP layer echoes to the client.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedTicket {
    #[serde(flatten)]
    pub ticket: UploadTicket,
    pub is_large_file: bool,
}

/// A committed upload, whichever mode carried it.
#[derive(Debug, Clone, Serialize)]
pub struct CommittedUpload {
    pub object_name: String,
    pub content_hash: String,
    pub size: u64,
}

/// Result of `multipart_init`.
#[derive(Debug, Clone, Serialize)]
pub struct MultipartInit {
    pub session_id: String,
    pub object_name: String,
    pub total_parts: u32,
    pub chunk_size: u64,
    /// Presigned per-part URLs, index 0 = part 1. Capped; further parts are
    /// fetched incrementally via `multipart_part_url`.
    pub part_urls: Vec<String>,
}

/// One answer of `check_by_name`.
#[derive(Debug, Clone, Serialize)]
pub struct NameCheck {
    pub filename: String,
    pub size: u64,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_name: Option<String>,
}

/// Part URLs are pre-generated at init only up to this count; larger
/// sessions fetch each URL on demand.
const MAX_PREISSUED_PART_URLS: u32 = 1000;

pub struct UploadOrchestrator {
    store: Arc<dyn ObjectStore>,
    index: Arc<HashIndex>,
    sessions: Arc<SessionRegistry>,
    notifier: CommitNotifier,
    metrics: Option<Arc<Metrics>>,
    /// Caps concurrent proxy-path uploads; direct-presign bypasses it since
    /// the service is not in that data path.
    upload_slots: Arc<Semaphore>,
    config: Config,
}

impl UploadOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        index: Arc<HashIndex>,
        sessions: Arc<SessionRegistry>,
        notifier: CommitNotifier,
        metrics: Option<Arc<Metrics>>,
        config: Config,
    ) -> Self {
        let slots = config.effective_upload_concurrency();
        Self {
            store,
            index,
            sessions,
            notifier,
            metrics,
            upload_slots: Arc::new(Semaphore::new(slots)),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<HashIndex> {
        &self.index
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn hash_stats(&self) -> IndexStats {
        self.index.stats()
    }

    // =======================================================================
    // Validation and policy
    // =======================================================================

    fn validate_request(&self, filename: &str, declared_size: u64) -> Result<SanitizedName, UploadError> {
        let name = SanitizedName::parse(filename)
            .map_err(|e| UploadError::Validation(e.to_string()))?;
        if !name.is_wav() {
            return Err(UploadError::Validation(format!(
                "unsupported extension {:?}; only .wav recordings are ingested",
                name.ext
            )));
        }
        if declared_size == 0 {
            return Err(UploadError::Validation(
                "declared size must be greater than zero".into(),
            ));
        }
        if declared_size > self.config.max_object_size {
            return Err(UploadError::Validation(format!(
                "declared size {} exceeds the {}-byte limit",
                declared_size, self.config.max_object_size
            )));
        }
        Ok(name)
    }

    /// Pre-upload duplicate gate: index readiness, then name+size match.
    fn duplicate_pregate(&self, name: &SanitizedName, declared_size: u64) -> Result<(), UploadError> {
        if !self.index.ready() {
            return Err(UploadError::NotReady);
        }
        if let Some(existing) = self.index.lookup_name(&name.full(), declared_size) {
            self.count_duplicate("name");
            return Err(UploadError::Duplicate { existing });
        }
        Ok(())
    }

    fn is_large(&self, declared_size: u64) -> bool {
        declared_size >= self.config.large_file_threshold
    }

    fn count_duplicate(&self, layer: &str) {
        if let Some(m) = &self.metrics {
            m.duplicates_detected_total.with_label_values(&[layer]).inc();
        }
    }

    fn record_outcome(&self, mode: UploadMode, outcome: &str) {
        if let Some(m) = &self.metrics {
            m.uploads_total
                .with_label_values(&[mode.as_str(), outcome])
                .inc();
        }
    }

    fn record_commit(&self, mode: UploadMode, size: u64, started: Instant) {
        if let Some(m) = &self.metrics {
            m.uploads_total
                .with_label_values(&[mode.as_str(), "committed"])
                .inc();
            m.upload_bytes_total.inc_by(size);
            m.upload_duration_seconds
                .with_label_values(&[mode.as_str()])
                .observe(started.elapsed().as_secs_f64());
        }
    }

    // =======================================================================
    // Tickets
    // =======================================================================

    /// Issue one upload ticket: not-ready gate, name+size duplicate gate,
    /// then mode selection by size against the large-file threshold.
    #[instrument(skip(self))]
    pub async fn issue_ticket(
        &self,
        filename: &str,
        declared_size: u64,
    ) -> Result<IssuedTicket, UploadError> {
        let name = self.validate_request(filename, declared_size)?;
        self.duplicate_pregate(&name, declared_size)?;

        let target = types::canonical_object_name(&name, Utc::now());
        let is_large = self.is_large(declared_size);

        let (mode, upload_url) = if is_large {
            // Service-mediated path; the ticket URL is the proxy endpoint.
            // Clients that want resumability call multipart_init instead.
            let full_name = name.full();
            let encoded = urlencoding::encode(&full_name);
            (UploadMode::Proxy, format!("/upload/proxy?filename={encoded}"))
        } else {
            let url = self
                .store
                .presign_put(&target, self.config.presign_ttl, WAV_CONTENT_TYPE)
                .await?;
            (UploadMode::Direct, url)
        };

        Ok(IssuedTicket {
            ticket: UploadTicket {
                ticket_id: Uuid::new_v4().to_string(),
                mode,
                target_object_name: target,
                upload_url,
                expires_at: Utc::now()
                    + chrono::Duration::from_std(self.config.presign_ttl)
                        .unwrap_or_else(|_| chrono::Duration::hours(1)),
            },
            is_large_file: is_large,
        })
    }

    /// Issue tickets for a whole queue in one call. Per-file failures do not
    /// fail the batch.
    pub async fn issue_tickets_batch(
        &self,
        files: &[(String, u64)],
    ) -> Vec<(String, Result<IssuedTicket, UploadError>)> {
        let mut results = Vec::with_capacity(files.len());
        for (filename, size) in files {
            let result = self.issue_ticket(filename, *size).await;
            results.push((filename.clone(), result));
        }
        results
    }

    // =======================================================================
    // Proxy streaming
    // =======================================================================

    /// Stream a request body through the integrity pipeline into the store.
    ///
    /// Optimistic dedup: the object is uploaded first, then the computed
    /// hash races into the index; the loser is deleted. Cancellation (the
    /// caller dropping this future) leaves no object behind — the store
    /// adapter releases its in-flight upload and the delete guard covers
    /// the commit window.
    #[instrument(skip(self, reader))]
    pub async fn proxy_stream(
        &self,
        filename: &str,
        declared_size: u64,
        reader: ByteReader,
        content_type: Option<&str>,
    ) -> Result<CommittedUpload, UploadError> {
        let started = Instant::now();
        let name = self.validate_request(filename, declared_size)?;
        if let Some(ct) = content_type {
            // Browsers append charset etc.; match on the essence only.
            let essence = ct.split(';').next().unwrap_or(ct).trim();
            if !essence.eq_ignore_ascii_case(WAV_CONTENT_TYPE) {
                return Err(UploadError::Validation(format!(
                    "content type {essence:?} is not {WAV_CONTENT_TYPE}"
                )));
            }
        }
        self.duplicate_pregate(&name, declared_size)?;

        let _slot = self.acquire_slot().await;
        let target = types::canonical_object_name(&name, Utc::now());

        let (tee, digest) = HashingReader::new(reader);
        let mut guard = DeleteGuard::new(self.store.clone(), &target);

        let put_result = self
            .store
            .put_stream(
                &target,
                Box::new(tee),
                declared_size,
                WAV_CONTENT_TYPE,
                HashMap::from([(
                    types::meta_keys::ORIGINAL_FILENAME.to_string(),
                    name.full(),
                )]),
            )
            .await;

        if let Err(err) = put_result {
            // The adapter has already released its partial upload; the
            // guard's deferred delete would be redundant noise.
            guard.disarm();
            self.record_outcome(UploadMode::Proxy, "error");
            return Err(self.integrity_or_store(err));
        }

        let (hash, bytes) = digest.snapshot();
        debug_assert_eq!(bytes, declared_size);

        // Authoritative duplicate check. First writer wins; losing the race
        // means deleting the object we just stored.
        let winner = self.index.insert(&hash, &target);
        if winner != target {
            self.store.delete(&target).await?;
            guard.disarm();
            self.count_duplicate("hash");
            self.record_outcome(UploadMode::Proxy, "duplicate");
            info!(existing = %winner, rejected = %target, "proxy upload deduplicated by hash");
            return Err(UploadError::Duplicate { existing: winner });
        }

        let meta = AudioObjectMetadata::new(
            name.full(),
            target.clone(),
            declared_size,
            hash.clone(),
            Utc::now(),
        );
        if let Err(err) = self.store.set_metadata(&target, meta.to_user_metadata()).await {
            // The object is good and indexed; only the durable hash tag is
            // missing. Not worth failing the upload over.
            warn!(name = %target, error = %err, "metadata rewrite failed after commit");
        }
        self.index.insert_name(&target, declared_size);
        guard.disarm();

        self.record_commit(UploadMode::Proxy, declared_size, started);
        self.notifier.record_commit(CommitEvent {
            object_name: target.clone(),
            original_filename: name.full(),
            size: declared_size,
            content_hash: hash.clone(),
            mode: UploadMode::Proxy,
            committed_at: Utc::now(),
        });
        info!(name = %target, size = declared_size, "proxy upload committed");

        Ok(CommittedUpload {
            object_name: target,
            content_hash: hash,
            size: declared_size,
        })
    }

    async fn acquire_slot(&self) -> InflightSlot {
        // Semaphore is never closed, so acquire cannot fail.
        let permit = self
            .upload_slots
            .clone()
            .acquire_owned()
            .await
            .expect("upload semaphore closed");
        if let Some(m) = &self.metrics {
            m.inflight_proxy_uploads.inc();
        }
        InflightSlot {
            _permit: permit,
            metrics: self.metrics.clone(),
        }
    }

    fn integrity_or_store(&self, err: StoreError) -> UploadError {
        match err {
            StoreError::SizeMismatch { declared, actual } => UploadError::Integrity(format!(
                "declared size {declared} but stream carried {actual} bytes"
            )),
            other => UploadError::Store(other),
        }
    }

    // =======================================================================
    // Multipart sessions
    // =======================================================================

    /// Open a resumable session: initiate the store-side upload, register
    /// the session, and pre-issue per-part URLs.
    #[instrument(skip(self))]
    pub async fn multipart_init(
        &self,
        filename: &str,
        declared_size: u64,
        chunk_size: Option<u64>,
        expected_hash: Option<String>,
    ) -> Result<MultipartInit, UploadError> {
        let name = self.validate_request(filename, declared_size)?;
        self.duplicate_pregate(&name, declared_size)?;

        if let Some(ref hash) = expected_hash {
            if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(UploadError::Validation(
                    "expectedHash must be 64 hex characters".into(),
                ));
            }
        }
        let chunk = chunk_size.unwrap_or(self.config.part_size);
        if chunk < crate::session::MIN_PART_SIZE && declared_size > chunk {
            return Err(UploadError::Validation(format!(
                "chunk size {} is below the {}-byte store minimum",
                chunk,
                crate::session::MIN_PART_SIZE
            )));
        }
        let total_parts = declared_size.div_ceil(chunk).max(1);
        if total_parts > crate::session::MAX_PARTS as u64 {
            return Err(UploadError::Validation(format!(
                "{total_parts} parts exceed the {} part limit; use a larger chunk size",
                crate::session::MAX_PARTS
            )));
        }

        let target = types::canonical_object_name(&name, Utc::now());
        let upload_id = self
            .store
            .multipart_init(
                &target,
                WAV_CONTENT_TYPE,
                HashMap::from([(
                    types::meta_keys::ORIGINAL_FILENAME.to_string(),
                    name.full(),
                )]),
            )
            .await?;

        let session = self.sessions.create(
            name.full(),
            target.clone(),
            upload_id.clone(),
            declared_size,
            chunk,
            expected_hash.map(|h| h.to_ascii_lowercase()),
            HashMap::new(),
        );

        let preissue = session.total_parts.min(MAX_PREISSUED_PART_URLS);
        let mut part_urls = Vec::with_capacity(preissue as usize);
        for part_number in 1..=preissue {
            let url = self
                .store
                .multipart_part_url(&target, &upload_id, part_number, self.config.presign_ttl)
                .await?;
            part_urls.push(url);
        }

        info!(
            session_id = %session.session_id,
            name = %target,
            total_parts = session.total_parts,
            "multipart session opened"
        );

        Ok(MultipartInit {
            session_id: session.session_id,
            object_name: target,
            total_parts: session.total_parts,
            chunk_size: chunk,
            part_urls,
        })
    }

    /// Incremental per-part URL issuance.
    #[instrument(skip(self))]
    pub async fn multipart_part_url(
        &self,
        session_id: &str,
        part_number: u32,
    ) -> Result<String, UploadError> {
        let session = self.sessions.get(session_id)?;
        if session.status != SessionStatus::Open {
            return Err(UploadError::Validation(format!(
                "session is {}",
                session.status.as_str()
            )));
        }
        if part_number == 0 || part_number > session.total_parts {
            return Err(UploadError::Validation(format!(
                "part number must be between 1 and {}",
                session.total_parts
            )));
        }
        let url = self
            .store
            .multipart_part_url(
                &session.canonical_object_name,
                &session.upload_id,
                part_number,
                self.config.presign_ttl,
            )
            .await?;
        self.sessions.touch(session_id)?;
        Ok(url)
    }

    /// Parts the store has already received — the resume listing. A session
    /// whose store-side upload has vanished transitions to aborted.
    #[instrument(skip(self))]
    pub async fn multipart_parts(&self, session_id: &str) -> Result<Vec<PartRecord>, UploadError> {
        let session = self.sessions.get(session_id)?;
        if session.status.is_terminal() {
            return Err(UploadError::Validation(format!(
                "session is {}",
                session.status.as_str()
            )));
        }
        match self
            .store
            .multipart_parts(&session.canonical_object_name, &session.upload_id)
            .await
        {
            Ok(parts) => Ok(parts),
            Err(StoreError::UploadNotFound(_)) => {
                self.sessions.close(session_id, SessionStatus::Aborted)?;
                Err(UploadError::NotFound(format!(
                    "upload for session {session_id} no longer exists at the store"
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Assemble a session. Parts are reconciled into the registry, validated
    /// (sorted, gap-free, sizes summing to the declared size), submitted to
    /// the store, and the result is re-read through the integrity pipeline
    /// before the session commits.
    #[instrument(skip(self, parts))]
    pub async fn multipart_complete(
        &self,
        session_id: &str,
        parts: Vec<PartRecord>,
    ) -> Result<CommittedUpload, UploadError> {
        let started = Instant::now();
        let lock = self.sessions.completion_lock(session_id);
        let _serialized = lock.lock().await;

        let session = self.sessions.get(session_id)?;
        if session.status != SessionStatus::Open {
            return Err(UploadError::Validation(format!(
                "session is {}",
                session.status.as_str()
            )));
        }

        // Reconcile client-reported parts into the registry; duplicates of
        // already-recorded parts are fine, conflicting records are not.
        for part in parts {
            match self.sessions.append_part(session_id, part.clone()) {
                Ok(()) => {}
                Err(SessionError::InvalidPart(ref msg)) if msg.contains("already recorded") => {
                    let recorded = self
                        .sessions
                        .get(session_id)?
                        .completed_parts
                        .iter()
                        .find(|p| p.part_number == part.part_number)
                        .cloned();
                    if recorded.as_ref().map(|p| p.etag.trim_matches('"').to_string())
                        != Some(part.etag.trim_matches('"').to_string())
                    {
                        return Err(UploadError::Validation(format!(
                            "part {} reported with a different etag than recorded",
                            part.part_number
                        )));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        let snapshot = self.sessions.begin_assembling(session_id)?;
        let target = snapshot.canonical_object_name.clone();

        let completed = match self
            .store
            .multipart_complete(&target, &snapshot.upload_id, &snapshot.completed_parts)
            .await
        {
            Ok(completed) => completed,
            Err(err) => {
                self.abort_session_upload(&snapshot).await;
                self.sessions.close(session_id, SessionStatus::Aborted)?;
                self.record_outcome(UploadMode::Multipart, "error");
                return Err(err.into());
            }
        };

        // Advisory only: the store's multipart ETag is MD5-of-part-MD5s.
        if let Some(expected_etag) = aggregate_multipart_etag(&snapshot.completed_parts) {
            if expected_etag != completed.etag {
                warn!(
                    name = %target,
                    expected = %expected_etag,
                    actual = %completed.etag,
                    "multipart etag aggregate mismatch"
                );
            }
        }

        if completed.size != snapshot.declared_size {
            self.store.delete(&target).await?;
            self.sessions.close(session_id, SessionStatus::Aborted)?;
            self.record_outcome(UploadMode::Multipart, "error");
            return Err(UploadError::Integrity(format!(
                "assembled object is {} bytes but {} were declared",
                completed.size, snapshot.declared_size
            )));
        }

        // One read-back pass yields the authoritative content hash (and
        // verifies the client's declared hash when one was supplied).
        let stream = self.store.get_stream(&target).await?;
        let (hash, bytes) = hash_reader(stream, self.config.io_buffer_size)
            .await
            .map_err(|e| UploadError::Internal(format!("re-read of {target} failed: {e}")))?;

        let verdict = crate::types::IntegrityVerdict::evaluate(
            snapshot.expected_hash.as_deref(),
            hash.clone(),
            snapshot.declared_size,
            bytes,
        );
        if !verdict.ok {
            self.store.delete(&target).await?;
            self.sessions.close(session_id, SessionStatus::Aborted)?;
            self.record_outcome(UploadMode::Multipart, "integrity_failure");
            return Err(UploadError::Integrity(
                verdict.reason.unwrap_or_else(|| "hash mismatch".into()),
            ));
        }

        let winner = self.index.insert(&hash, &target);
        if winner != target {
            self.store.delete(&target).await?;
            self.sessions.close(session_id, SessionStatus::Aborted)?;
            self.count_duplicate("hash");
            self.record_outcome(UploadMode::Multipart, "duplicate");
            return Err(UploadError::Duplicate { existing: winner });
        }

        let meta = AudioObjectMetadata::new(
            snapshot.original_filename.clone(),
            target.clone(),
            snapshot.declared_size,
            hash.clone(),
            Utc::now(),
        );
        if let Err(err) = self.store.set_metadata(&target, meta.to_user_metadata()).await {
            warn!(name = %target, error = %err, "metadata rewrite failed after commit");
        }
        self.index.insert_name(&target, snapshot.declared_size);
        self.sessions.close(session_id, SessionStatus::Committed)?;

        self.record_commit(UploadMode::Multipart, snapshot.declared_size, started);
        self.notifier.record_commit(CommitEvent {
            object_name: target.clone(),
            original_filename: snapshot.original_filename.clone(),
            size: snapshot.declared_size,
            content_hash: hash.clone(),
            mode: UploadMode::Multipart,
            committed_at: Utc::now(),
        });
        info!(session_id, name = %target, size = snapshot.declared_size, "multipart upload committed");

        Ok(CommittedUpload {
            object_name: target,
            content_hash: hash,
            size: snapshot.declared_size,
        })
    }

    /// Explicit abort: release the store-side upload and close the session.
    #[instrument(skip(self))]
    pub async fn multipart_abort(&self, session_id: &str) -> Result<(), UploadError> {
        let lock = self.sessions.completion_lock(session_id);
        let _serialized = lock.lock().await;

        let session = self.sessions.get(session_id)?;
        if session.status.is_terminal() {
            return Ok(());
        }
        self.abort_session_upload(&session).await;
        self.sessions.close(session_id, SessionStatus::Aborted)?;
        self.record_outcome(UploadMode::Multipart, "aborted");
        info!(session_id, "multipart session aborted");
        Ok(())
    }

    async fn abort_session_upload(&self, session: &UploadSession) {
        if let Err(err) = self
            .store
            .multipart_abort(&session.canonical_object_name, &session.upload_id)
            .await
        {
            warn!(
                session_id = %session.session_id,
                error = %err,
                "store-side multipart abort failed"
            );
        }
    }

    // =======================================================================
    // Direct finalization
    // =======================================================================

    /// A direct-presign client signals its PUT finished. The service reads
    /// its own stat first (read-your-write against the store), hashes the
    /// object by streaming it back, dedupes, and indexes.
    #[instrument(skip(self))]
    pub async fn finalize_direct(&self, object_name: &str) -> Result<CommittedUpload, UploadError> {
        let started = Instant::now();
        if !self.index.ready() {
            return Err(UploadError::NotReady);
        }
        let name = SanitizedName::parse(object_name)
            .map_err(|e| UploadError::Validation(e.to_string()))?;

        let stat = self
            .store
            .stat(&name.full())
            .await?
            .ok_or_else(|| UploadError::NotFound(format!("object {object_name}")))?;

        let stream = self.store.get_stream(&name.full()).await?;
        let (hash, bytes) = hash_reader(stream, self.config.io_buffer_size)
            .await
            .map_err(|e| UploadError::Internal(format!("read-back of {object_name} failed: {e}")))?;
        if bytes != stat.size {
            return Err(UploadError::Integrity(format!(
                "object stat reports {} bytes but the stream carried {}",
                stat.size, bytes
            )));
        }

        let target = name.full();
        let winner = self.index.insert(&hash, &target);
        if winner != target {
            self.store.delete(&target).await?;
            self.count_duplicate("hash");
            self.record_outcome(UploadMode::Direct, "duplicate");
            info!(existing = %winner, rejected = %target, "direct upload deduplicated by hash");
            return Err(UploadError::Duplicate { existing: winner });
        }

        let original = types::normalized_base_name(&target);
        let meta = AudioObjectMetadata::new(original.clone(), target.clone(), bytes, hash.clone(), Utc::now());
        if let Err(err) = self.store.set_metadata(&target, meta.to_user_metadata()).await {
            warn!(name = %target, error = %err, "metadata rewrite failed after finalize");
        }
        self.index.insert_name(&target, bytes);

        self.record_commit(UploadMode::Direct, bytes, started);
        self.notifier.record_commit(CommitEvent {
            object_name: target.clone(),
            original_filename: original,
            size: bytes,
            content_hash: hash.clone(),
            mode: UploadMode::Direct,
            committed_at: Utc::now(),
        });
        info!(name = %target, size = bytes, "direct upload finalized");

        Ok(CommittedUpload {
            object_name: target,
            content_hash: hash,
            size: bytes,
        })
    }

    // =======================================================================
    // Duplicate queries
    // =======================================================================

    /// Cheap pre-check by normalized base name and size.
    pub fn check_by_name(&self, files: &[(String, u64)]) -> Result<Vec<NameCheck>, UploadError> {
        if !self.index.ready() {
            return Err(UploadError::NotReady);
        }
        Ok(files
            .iter()
            .map(|(filename, size)| {
                let matched = self.index.lookup_name(filename, *size);
                NameCheck {
                    filename: filename.clone(),
                    size: *size,
                    exists: matched.is_some(),
                    matched_name: matched,
                }
            })
            .collect())
    }

    /// O(1) authoritative-layer query.
    pub fn check_by_hash(&self, hash: &str) -> Result<Option<String>, UploadError> {
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(UploadError::Validation(
                "hash must be 64 hex characters".into(),
            ));
        }
        match self.index.lookup(hash) {
            IndexLookup::NotReady => Err(UploadError::NotReady),
            IndexLookup::Miss => Ok(None),
            IndexLookup::Hit(name) => Ok(Some(name)),
        }
    }

    // =======================================================================
    // Background maintenance
    // =======================================================================

    /// Expire idle sessions and force-abort their store-side uploads.
    pub async fn sweep_sessions(&self) {
        let expired = self.sessions.sweep(self.config.session_idle_ttl);
        for session in expired {
            info!(session_id = %session.session_id, "sweeping idle session");
            self.abort_session_upload(&session).await;
        }
    }

    /// Startup reconciliation for a restored registry: sessions whose
    /// store-side upload is gone are dropped; live ones get their part
    /// lists re-synced from the store.
    pub async fn reconcile_sessions(&self) {
        for session in self.sessions.list() {
            if session.status.is_terminal() {
                continue;
            }
            match self
                .store
                .multipart_parts(&session.canonical_object_name, &session.upload_id)
                .await
            {
                Ok(parts) => {
                    for part in parts {
                        // Already-recorded parts are rejected by append_part;
                        // that is exactly the idempotence we want here.
                        let _ = self.sessions.append_part(&session.session_id, part);
                    }
                }
                Err(StoreError::UploadNotFound(_)) => {
                    warn!(
                        session_id = %session.session_id,
                        "restored session has no store-side upload; dropping"
                    );
                    let _ = self
                        .sessions
                        .close(&session.session_id, SessionStatus::Aborted);
                    self.sessions.remove(&session.session_id);
                }
                Err(err) => {
                    warn!(
                        session_id = %session.session_id,
                        error = %err,
                        "session reconciliation deferred; store unavailable"
                    );
                }
            }
        }
    }
}

/// Holds an upload slot; returns it (and decrements the gauge) on drop.
struct InflightSlot {
    _permit: tokio::sync::OwnedSemaphorePermit,
    metrics: Option<Arc<Metrics>>,
}

impl Drop for InflightSlot {
    fn drop(&mut self) {
        if let Some(m) = &self.metrics {
            m.inflight_proxy_uploads.dec();
        }
    }
}

/// Deletes the target object if the owning operation is dropped or fails
/// between the store write and the commit. Disarmed once the commit lands
/// (or once cleanup has been done explicitly).
struct DeleteGuard {
    store: Arc<dyn ObjectStore>,
    name: String,
    armed: bool,
}

impl DeleteGuard {
    fn new(store: Arc<dyn ObjectStore>, name: &str) -> Self {
        Self {
            store,
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DeleteGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let name = std::mem::take(&mut self.name);
        tokio::spawn(async move {
            if let Err(err) = store.delete(&name).await {
                warn!(name, error = %err, "cleanup delete after cancellation failed");
            }
        });
    }
}

/// The multipart ETag an S3-compatible store derives: hex MD5 of the
/// concatenated raw part MD5s, suffixed with the part count. Returns `None`
/// when any part etag is not a plain 32-hex MD5 (encrypted stores).
fn aggregate_multipart_etag(parts: &[PartRecord]) -> Option<String> {
    let mut concat = Vec::with_capacity(parts.len() * 16);
    for part in parts {
        let etag = part.etag.trim_matches('"');
        if etag.len() != 32 {
            return None;
        }
        concat.extend_from_slice(&hex::decode(etag).ok()?);
    }
    let digest = Md5::digest(&concat);
    Some(format!("{}-{}", hex::encode(digest), parts.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_multipart_etag() {
        let parts = vec![
            PartRecord {
                part_number: 1,
                etag: hex::encode(Md5::digest(b"part-one")),
                size: 8,
            },
            PartRecord {
                part_number: 2,
                etag: hex::encode(Md5::digest(b"part-two")),
                size: 8,
            },
        ];

        let aggregate = aggregate_multipart_etag(&parts).unwrap();
        assert!(aggregate.ends_with("-2"));

        let mut concat = Vec::new();
        concat.extend_from_slice(&Md5::digest(b"part-one"));
        concat.extend_from_slice(&Md5::digest(b"part-two"));
        let expected = format!("{}-2", hex::encode(Md5::digest(&concat)));
        assert_eq!(aggregate, expected);
    }

    #[test]
    fn test_aggregate_rejects_non_md5_etags() {
        let parts = vec![PartRecord {
            part_number: 1,
            etag: "not-an-md5".into(),
            size: 8,
        }];
        assert!(aggregate_multipart_etag(&parts).is_none());
    }
}
