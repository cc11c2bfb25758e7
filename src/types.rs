//! Core types for the sermon ingestion pipeline: canonical object naming,
//! user-metadata schema, upload tickets, and integrity verdicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Tool version identifier — uses crate name and version from Cargo.toml
pub const INGEST_TOOL: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Content type for every ingested object. The pipeline never rewrites it.
pub const WAV_CONTENT_TYPE: &str = "audio/wav";

/// S3 user-metadata key names (stored as `x-amz-meta-{KEY}` on each object).
/// Used by storage/s3.rs when writing objects and by the hash-index warm
/// load when reading them back. Hyphenated because metadata keys travel as
/// HTTP header suffixes.
pub mod meta_keys {
    pub const CONTENT_HASH: &str = "content-hash";
    pub const ORIGINAL_FILENAME: &str = "original-filename";
    pub const RENAMED_FILENAME: &str = "renamed-filename";
    pub const FILE_SIZE: &str = "file-size";
    pub const UPLOAD_TIMESTAMP: &str = "upload-timestamp";
    pub const STATUS: &str = "status";
    pub const TOOL: &str = "tool";
}

/// Errors that can occur when validating a client-supplied filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameError(pub(crate) String);

impl fmt::Display for FilenameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FilenameError {}

/// A client-supplied filename reduced to a safe base name.
///
/// Path separators are stripped (only the final segment survives), NUL and
/// control bytes are rejected, and `.` / `..` are refused outright. The
/// extension is preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedName {
    /// Base name without extension
    pub stem: String,
    /// Extension including the leading dot (empty when none)
    pub ext: String,
}

impl SanitizedName {
    pub fn parse(raw: &str) -> Result<Self, FilenameError> {
        if raw.contains('\0') {
            return Err(FilenameError("filename must not contain NUL bytes".into()));
        }
        // Strip path separators: keep only the final segment.
        let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
        if base.is_empty() {
            return Err(FilenameError("filename must not be empty".into()));
        }
        if base == "." || base == ".." {
            return Err(FilenameError("invalid filename".into()));
        }
        if base.chars().any(|c| c.is_control()) {
            return Err(FilenameError(
                "filename must not contain control characters".into(),
            ));
        }

        let (stem, ext) = match base.rfind('.') {
            // A leading dot is part of the stem (".hidden" has no extension).
            Some(idx) if idx > 0 => (base[..idx].to_string(), base[idx..].to_string()),
            _ => (base.to_string(), String::new()),
        };
        Ok(Self { stem, ext })
    }

    /// Whether the extension is `.wav` (case-insensitive).
    pub fn is_wav(&self) -> bool {
        self.ext.eq_ignore_ascii_case(".wav")
    }

    pub fn full(&self) -> String {
        format!("{}{}", self.stem, self.ext)
    }
}

impl fmt::Display for SanitizedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.stem, self.ext)
    }
}

/// Derive the canonical object name: `<sanitized_stem>_<epoch_nanos><ext>`.
///
/// Deterministic given (filename, timestamp); nanosecond resolution keeps
/// bursty upload windows collision-free.
pub fn canonical_object_name(name: &SanitizedName, ts: DateTime<Utc>) -> String {
    let nanos = ts.timestamp_nanos_opt().unwrap_or_else(|| ts.timestamp());
    format!("{}_{}{}", name.stem, nanos, name.ext)
}

/// Strip the trailing `_<digits>` run a canonical name carries, recovering
/// the original base name. Names without a timestamp suffix pass through.
///
/// `sermon_1712345678.wav` → `sermon.wav`; `sermon.wav` → `sermon.wav`.
pub fn normalized_base_name(object_name: &str) -> String {
    let (stem, ext) = match object_name.rfind('.') {
        Some(idx) if idx > 0 => (&object_name[..idx], &object_name[idx..]),
        _ => (object_name, ""),
    };
    match stem.rfind('_') {
        Some(idx) if idx + 1 < stem.len() && stem[idx + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            format!("{}{}", &stem[..idx], ext)
        }
        _ => object_name.to_string(),
    }
}

/// Side-car metadata attached to every committed audio object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioObjectMetadata {
    pub original_filename: String,
    pub renamed_filename: String,
    pub file_size: u64,
    /// SHA-256 of the full byte stream, 64 hex chars
    pub content_hash: String,
    pub content_type: String,
    pub upload_timestamp: DateTime<Utc>,
    pub status: String,
}

impl AudioObjectMetadata {
    pub fn new(
        original_filename: String,
        renamed_filename: String,
        file_size: u64,
        content_hash: String,
        upload_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            original_filename,
            renamed_filename,
            file_size,
            content_hash,
            content_type: WAV_CONTENT_TYPE.to_string(),
            upload_timestamp,
            status: "uploaded".to_string(),
        }
    }

    /// Flatten into the user-metadata map stored on the object.
    pub fn to_user_metadata(&self) -> HashMap<String, String> {
        use meta_keys as mk;
        HashMap::from([
            (mk::CONTENT_HASH.to_string(), self.content_hash.clone()),
            (
                mk::ORIGINAL_FILENAME.to_string(),
                self.original_filename.clone(),
            ),
            (
                mk::RENAMED_FILENAME.to_string(),
                self.renamed_filename.clone(),
            ),
            (mk::FILE_SIZE.to_string(), self.file_size.to_string()),
            (
                mk::UPLOAD_TIMESTAMP.to_string(),
                self.upload_timestamp.to_rfc3339(),
            ),
            (mk::STATUS.to_string(), self.status.clone()),
            (mk::TOOL.to_string(), INGEST_TOOL.to_string()),
        ])
    }
}

/// How an upload ticket tells the client to move its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Client PUTs straight to the store via a presigned URL.
    Direct,
    /// Bytes stream through the service (hash computed in-line).
    Proxy,
    /// Resumable multipart session with per-part presigned URLs.
    Multipart,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMode::Direct => "direct",
            UploadMode::Proxy => "proxy",
            UploadMode::Multipart => "multipart",
        }
    }
}

/// Transient upload ticket handed to the client. The service never retains
/// tickets after issuance; possession of the URL is the only credential.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub ticket_id: String,
    pub mode: UploadMode,
    pub target_object_name: String,
    /// Presigned PUT URL for `Direct` mode, proxy path otherwise
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of the integrity pipeline at stream end.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityVerdict {
    pub expected_hash: Option<String>,
    pub actual_hash: String,
    pub size_expected: u64,
    pub size_actual: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IntegrityVerdict {
    pub fn evaluate(
        expected_hash: Option<&str>,
        actual_hash: String,
        size_expected: u64,
        size_actual: u64,
    ) -> Self {
        let mut reason = None;
        if size_expected != size_actual {
            reason = Some(format!(
                "declared size {} but received {} bytes",
                size_expected, size_actual
            ));
        } else if let Some(expected) = expected_hash {
            if !expected.eq_ignore_ascii_case(&actual_hash) {
                reason = Some(format!(
                    "declared hash {} but computed {}",
                    expected, actual_hash
                ));
            }
        }
        Self {
            expected_hash: expected_hash.map(|s| s.to_ascii_lowercase()),
            ok: reason.is_none(),
            actual_hash,
            size_expected,
            size_actual,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_sanitize_plain() {
        let name = SanitizedName::parse("sermon.wav").unwrap();
        assert_eq!(name.stem, "sermon");
        assert_eq!(name.ext, ".wav");
        assert!(name.is_wav());
    }

    #[test]
    fn test_sanitize_strips_path() {
        let name = SanitizedName::parse("../../etc/sunday morning.WAV").unwrap();
        assert_eq!(name.stem, "sunday morning");
        assert!(name.is_wav());

        let name = SanitizedName::parse("C:\\Users\\av\\evening.wav").unwrap();
        assert_eq!(name.full(), "evening.wav");
    }

    #[test]
    fn test_sanitize_rejects_bad_input() {
        assert!(SanitizedName::parse("").is_err());
        assert!(SanitizedName::parse("..").is_err());
        assert!(SanitizedName::parse("a\0b.wav").is_err());
        assert!(SanitizedName::parse("trailing/").is_err());
    }

    #[test]
    fn test_no_extension() {
        let name = SanitizedName::parse("README").unwrap();
        assert_eq!(name.stem, "README");
        assert_eq!(name.ext, "");
        assert!(!name.is_wav());
    }

    #[test]
    fn test_canonical_name_deterministic() {
        let name = SanitizedName::parse("sermon.wav").unwrap();
        let ts = Utc.timestamp_opt(1_700_000_000, 123).unwrap();
        let a = canonical_object_name(&name, ts);
        let b = canonical_object_name(&name, ts);
        assert_eq!(a, b);
        assert!(a.starts_with("sermon_"));
        assert!(a.ends_with(".wav"));
    }

    #[test]
    fn test_normalize_strips_timestamp() {
        assert_eq!(normalized_base_name("sermon_1712345678.wav"), "sermon.wav");
        assert_eq!(
            normalized_base_name("sermon_1712345678901234567.wav"),
            "sermon.wav"
        );
        assert_eq!(normalized_base_name("sermon.wav"), "sermon.wav");
        // Underscore followed by non-digits is part of the name
        assert_eq!(normalized_base_name("sermon_am.wav"), "sermon_am.wav");
        // Bare trailing underscore is not a timestamp
        assert_eq!(normalized_base_name("sermon_.wav"), "sermon_.wav");
    }

    #[test]
    fn test_metadata_user_map_keys() {
        let meta = AudioObjectMetadata::new(
            "sermon.wav".into(),
            "sermon_1712345678.wav".into(),
            1024,
            "ab".repeat(32),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );
        let map = meta.to_user_metadata();
        assert_eq!(map.get(meta_keys::CONTENT_HASH).unwrap(), &"ab".repeat(32));
        assert_eq!(map.get(meta_keys::FILE_SIZE).unwrap(), "1024");
        assert_eq!(map.get(meta_keys::STATUS).unwrap(), "uploaded");
    }

    #[test]
    fn test_verdict_size_mismatch() {
        let v = IntegrityVerdict::evaluate(None, "aa".repeat(32), 100, 90);
        assert!(!v.ok);
        assert!(v.reason.unwrap().contains("declared size"));
    }

    #[test]
    fn test_verdict_hash_compare_case_insensitive() {
        let hash = "ab".repeat(32);
        let v = IntegrityVerdict::evaluate(Some(&hash.to_uppercase()), hash.clone(), 5, 5);
        assert!(v.ok);

        let v = IntegrityVerdict::evaluate(Some(&"cd".repeat(32)), hash, 5, 5);
        assert!(!v.ok);
    }

    proptest! {
        /// Sanitized names never contain path separators regardless of input.
        #[test]
        fn prop_sanitize_no_separators(raw in "\\PC{0,64}") {
            if let Ok(name) = SanitizedName::parse(&raw) {
                prop_assert!(!name.full().contains('/'));
                prop_assert!(!name.full().contains('\\'));
                prop_assert!(!name.full().is_empty());
            }
        }

        /// Canonicalize-then-normalize recovers the sanitized base name.
        #[test]
        fn prop_normalize_inverts_canonical(stem in "[a-zA-Z][a-zA-Z0-9 -]{0,20}", secs in 0i64..4_000_000_000i64) {
            let name = SanitizedName::parse(&format!("{stem}.wav")).unwrap();
            let ts = chrono::Utc.timestamp_opt(secs, 0).unwrap();
            let canonical = canonical_object_name(&name, ts);
            prop_assert_eq!(normalized_base_name(&canonical), name.full());
        }
    }
}
