//! In-memory registry of resumable multipart upload sessions.
//!
//! The registry owns session state only — part bytes travel straight from
//! the client to the store via presigned part URLs, so a session costs a
//! fixed-size record regardless of payload size. Sessions may be persisted
//! to a JSON file to survive restart; recovery re-syncs against the store
//! and drops sessions whose underlying multipart upload is gone.

use crate::storage::PartRecord;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Store-mandated minimum size for every part except the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// S3 caps multipart uploads at 10000 parts.
pub const MAX_PARTS: u32 = 10_000;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {id} is {status}; operation requires an open session")]
    NotOpen { id: String, status: &'static str },

    #[error("invalid part: {0}")]
    InvalidPart(String),

    #[error("incomplete upload: {0}")]
    Incomplete(String),
}

/// Session lifecycle. Transitions are monotone; `Committed`, `Aborted`, and
/// `Expired` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Assembling,
    Committed,
    Aborted,
    /// Swept after idling past the TTL (a flavor of abort; the store-side
    /// upload is released the same way).
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Committed | SessionStatus::Aborted | SessionStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Open => "open",
            SessionStatus::Assembling => "assembling",
            SessionStatus::Committed => "committed",
            SessionStatus::Aborted => "aborted",
            SessionStatus::Expired => "expired",
        }
    }
}

/// One in-flight resumable upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub original_filename: String,
    pub canonical_object_name: String,
    /// Store-side multipart upload id
    pub upload_id: String,
    pub declared_size: u64,
    pub chunk_size: u64,
    pub total_parts: u32,
    pub bytes_received: u64,
    /// Sorted by part number, gap-free at commit time
    pub completed_parts: Vec<PartRecord>,
    pub expected_hash: Option<String>,
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Thread-safe session registry.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, UploadSession>>,
    /// Per-session completion locks so `append_part` and `close` cannot
    /// interleave for the same session.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    min_part_size: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::with_min_part_size(MIN_PART_SIZE)
    }

    pub fn with_min_part_size(min_part_size: u64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            min_part_size,
        }
    }

    /// Allocate an opaque session id (64-char hex).
    fn new_session_id() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        hex::encode(bytes)
    }

    /// Record a freshly initiated multipart upload. The caller has already
    /// initiated the store-side upload; its id is persisted in the record.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        original_filename: String,
        canonical_object_name: String,
        upload_id: String,
        declared_size: u64,
        chunk_size: u64,
        expected_hash: Option<String>,
        metadata: HashMap<String, String>,
    ) -> UploadSession {
        let now = Utc::now();
        let total_parts = declared_size.div_ceil(chunk_size).max(1) as u32;
        let session = UploadSession {
            session_id: Self::new_session_id(),
            original_filename,
            canonical_object_name,
            upload_id,
            declared_size,
            chunk_size,
            total_parts,
            bytes_received: 0,
            completed_parts: Vec::new(),
            expected_hash,
            metadata,
            created_at: now,
            last_activity_at: now,
            status: SessionStatus::Open,
        };
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        session
    }

    pub fn get(&self, session_id: &str) -> Result<UploadSession, SessionError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// The completion lock for a session. Callers hold it across any
    /// sequence of registry mutations plus store calls that must not
    /// interleave with a concurrent close.
    pub fn completion_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Record one uploaded part. Validates the part number range, rejects
    /// duplicates, and enforces the store minimum on non-final parts (the
    /// final part is detected by position against the declared size).
    pub fn append_part(&self, session_id: &str, part: PartRecord) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Open {
            return Err(SessionError::NotOpen {
                id: session_id.to_string(),
                status: session.status.as_str(),
            });
        }
        if part.part_number == 0 || part.part_number > MAX_PARTS {
            return Err(SessionError::InvalidPart(format!(
                "part number must be between 1 and {MAX_PARTS}"
            )));
        }
        if part.part_number > session.total_parts {
            return Err(SessionError::InvalidPart(format!(
                "part {} exceeds the {} parts of a {}-byte upload",
                part.part_number, session.total_parts, session.declared_size
            )));
        }
        if session
            .completed_parts
            .iter()
            .any(|p| p.part_number == part.part_number)
        {
            return Err(SessionError::InvalidPart(format!(
                "part {} already recorded",
                part.part_number
            )));
        }
        let is_final = part.part_number == session.total_parts;
        if !is_final && part.size < self.min_part_size {
            return Err(SessionError::InvalidPart(format!(
                "part {} is {} bytes; non-final parts must be at least {}",
                part.part_number, part.size, self.min_part_size
            )));
        }

        session.bytes_received += part.size;
        let idx = session
            .completed_parts
            .partition_point(|p| p.part_number < part.part_number);
        session.completed_parts.insert(idx, part);
        session.last_activity_at = Utc::now();
        Ok(())
    }

    /// Refresh `last_activity_at` (part-URL issuance counts as activity).
    pub fn touch(&self, session_id: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.last_activity_at = Utc::now();
        Ok(())
    }

    /// Validate completeness and transition `open → assembling`, returning a
    /// snapshot whose parts are sorted and gap-free and whose sizes sum to
    /// the declared size.
    pub fn begin_assembling(&self, session_id: &str) -> Result<UploadSession, SessionError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Open {
            return Err(SessionError::NotOpen {
                id: session_id.to_string(),
                status: session.status.as_str(),
            });
        }
        if session.completed_parts.is_empty() {
            return Err(SessionError::Incomplete("no parts recorded".into()));
        }
        for (i, part) in session.completed_parts.iter().enumerate() {
            let expected = i as u32 + 1;
            if part.part_number != expected {
                return Err(SessionError::Incomplete(format!(
                    "part {} missing (found part {} in its place)",
                    expected, part.part_number
                )));
            }
        }
        let total: u64 = session.completed_parts.iter().map(|p| p.size).sum();
        if total != session.declared_size {
            return Err(SessionError::Incomplete(format!(
                "parts sum to {} bytes but {} were declared",
                total, session.declared_size
            )));
        }
        debug_assert_eq!(session.bytes_received, total);

        session.status = SessionStatus::Assembling;
        session.last_activity_at = Utc::now();
        Ok(session.clone())
    }

    /// Transition to a terminal state. Re-closing a terminal session is a
    /// no-op (terminal states are absorbing); `assembling` may fall back to
    /// `aborted` on completion failure but never to `open`.
    pub fn close(&self, session_id: &str, final_state: SessionStatus) -> Result<(), SessionError> {
        debug_assert!(final_state.is_terminal());
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        if session.status.is_terminal() {
            return Ok(());
        }
        session.status = final_state;
        session.last_activity_at = Utc::now();
        Ok(())
    }

    pub fn list(&self) -> Vec<UploadSession> {
        let mut sessions: Vec<UploadSession> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Expire sessions idle past `ttl`. Open/assembling sessions transition
    /// to `Expired` and are returned so the caller can force-abort them at
    /// the store; terminal records past the TTL are dropped outright.
    pub fn sweep(&self, ttl: Duration) -> Vec<UploadSession> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(6));
        let mut expired = Vec::new();
        let mut dropped = Vec::new();

        {
            let mut sessions = self.sessions.write();
            for (id, session) in sessions.iter_mut() {
                if session.last_activity_at >= cutoff {
                    continue;
                }
                if session.status.is_terminal() {
                    dropped.push(id.clone());
                } else {
                    session.status = SessionStatus::Expired;
                    expired.push(session.clone());
                }
            }
            for id in &dropped {
                sessions.remove(id);
            }
        }

        let mut locks = self.locks.lock();
        for id in &dropped {
            locks.remove(id);
        }

        expired
    }

    /// Remove a terminal session record (and its lock).
    pub fn remove(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
        self.locks.lock().remove(session_id);
    }

    // === Durable persistence ===

    /// Write all sessions to `path` as JSON (atomic rename).
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let sessions = self.list();
        let json = serde_json::to_vec_pretty(&sessions)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)
    }

    /// Restore sessions from `path`. Missing file yields an empty registry.
    /// The caller must reconcile restored sessions against the store before
    /// serving them.
    pub fn load_from(path: &Path) -> std::io::Result<Self> {
        let registry = Self::new();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(registry),
            Err(e) => return Err(e),
        };
        let sessions: Vec<UploadSession> = serde_json::from_slice(&data)?;
        let mut map = registry.sessions.write();
        for session in sessions {
            map.insert(session.session_id.clone(), session);
        }
        drop(map);
        Ok(registry)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn part(n: u32, size: u64) -> PartRecord {
        PartRecord {
            part_number: n,
            etag: format!("etag-{n}"),
            size,
        }
    }

    fn open_session(registry: &SessionRegistry, declared: u64, chunk: u64) -> UploadSession {
        registry.create(
            "sermon.wav".into(),
            "sermon_1712345678.wav".into(),
            "upload-1".into(),
            declared,
            chunk,
            None,
            HashMap::new(),
        )
    }

    #[test]
    fn test_create_computes_total_parts() {
        let registry = SessionRegistry::new();
        let session = open_session(&registry, 25 * MB, 5 * MB);
        assert_eq!(session.total_parts, 5);
        assert_eq!(session.status, SessionStatus::Open);
        assert_eq!(session.session_id.len(), 64);

        let session = open_session(&registry, 26 * MB, 5 * MB);
        assert_eq!(session.total_parts, 6);
    }

    #[test]
    fn test_append_out_of_order_kept_sorted() {
        let registry = SessionRegistry::new();
        let session = open_session(&registry, 25 * MB, 5 * MB);

        for n in [1u32, 3, 2, 4, 5] {
            registry
                .append_part(&session.session_id, part(n, 5 * MB))
                .unwrap();
        }

        let session = registry.get(&session.session_id).unwrap();
        assert_eq!(session.bytes_received, 25 * MB);
        let numbers: Vec<u32> = session
            .completed_parts
            .iter()
            .map(|p| p.part_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_append_validations() {
        let registry = SessionRegistry::new();
        let session = open_session(&registry, 25 * MB, 5 * MB);
        let id = &session.session_id;

        assert!(registry.append_part(id, part(0, 5 * MB)).is_err());
        assert!(registry.append_part(id, part(6, 5 * MB)).is_err());
        // Non-final part below the store minimum
        assert!(registry.append_part(id, part(1, MB)).is_err());

        registry.append_part(id, part(1, 5 * MB)).unwrap();
        // Duplicate
        assert!(registry.append_part(id, part(1, 5 * MB)).is_err());

        assert!(matches!(
            registry.append_part("missing", part(1, 5 * MB)),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_final_part_may_be_small() {
        let registry = SessionRegistry::new();
        // 12 MiB in 5 MiB chunks: parts of 5, 5, 2 MiB
        let session = open_session(&registry, 12 * MB, 5 * MB);
        let id = &session.session_id;

        registry.append_part(id, part(1, 5 * MB)).unwrap();
        registry.append_part(id, part(2, 5 * MB)).unwrap();
        registry.append_part(id, part(3, 2 * MB)).unwrap();

        let snapshot = registry.begin_assembling(id).unwrap();
        assert_eq!(snapshot.status, SessionStatus::Assembling);
    }

    #[test]
    fn test_gap_rejected() {
        let registry = SessionRegistry::new();
        let session = open_session(&registry, 20 * MB, 5 * MB);
        let id = &session.session_id;

        registry.append_part(id, part(1, 5 * MB)).unwrap();
        registry.append_part(id, part(2, 5 * MB)).unwrap();
        registry.append_part(id, part(4, 5 * MB)).unwrap();

        let err = registry.begin_assembling(id).unwrap_err();
        assert!(matches!(err, SessionError::Incomplete(_)));
        // Still open: the client can upload the missing part and retry.
        assert_eq!(registry.get(id).unwrap().status, SessionStatus::Open);
    }

    #[test]
    fn test_size_sum_must_match_declared() {
        let registry = SessionRegistry::new();
        let session = open_session(&registry, 20 * MB, 5 * MB);
        let id = &session.session_id;

        registry.append_part(id, part(1, 5 * MB)).unwrap();
        registry.append_part(id, part(2, 5 * MB)).unwrap();
        registry.append_part(id, part(3, 5 * MB)).unwrap();
        registry.append_part(id, part(4, 4 * MB)).unwrap();

        assert!(registry.begin_assembling(id).is_err());
    }

    #[test]
    fn test_terminal_states_absorb() {
        let registry = SessionRegistry::new();
        let session = open_session(&registry, 10 * MB, 5 * MB);
        let id = &session.session_id;

        registry.close(id, SessionStatus::Aborted).unwrap();
        assert_eq!(registry.get(id).unwrap().status, SessionStatus::Aborted);

        // No resurrection
        registry.close(id, SessionStatus::Committed).unwrap();
        assert_eq!(registry.get(id).unwrap().status, SessionStatus::Aborted);
        assert!(registry.append_part(id, part(1, 5 * MB)).is_err());
        assert!(registry.begin_assembling(id).is_err());
    }

    #[test]
    fn test_sweep_expires_idle_sessions() {
        let registry = SessionRegistry::new();
        let session = open_session(&registry, 10 * MB, 5 * MB);
        let id = session.session_id.clone();

        // Fresh session is untouched by the sweep.
        assert!(registry.sweep(Duration::from_secs(3600)).is_empty());

        // Backdate activity past the TTL.
        registry
            .sessions
            .write()
            .get_mut(&id)
            .unwrap()
            .last_activity_at = Utc::now() - chrono::Duration::hours(2);

        let expired = registry.sweep(Duration::from_secs(3600));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].session_id, id);
        assert_eq!(registry.get(&id).unwrap().status, SessionStatus::Expired);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let registry = SessionRegistry::new();
        let session = open_session(&registry, 25 * MB, 5 * MB);
        registry
            .append_part(&session.session_id, part(1, 5 * MB))
            .unwrap();
        registry.save_to(&path).unwrap();

        let restored = SessionRegistry::load_from(&path).unwrap();
        let loaded = restored.get(&session.session_id).unwrap();
        assert_eq!(loaded.canonical_object_name, session.canonical_object_name);
        assert_eq!(loaded.completed_parts.len(), 1);
        assert_eq!(loaded.bytes_received, 5 * MB);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::load_from(&dir.path().join("absent.json")).unwrap();
        assert!(registry.list().is_empty());
    }
}
