//! Ingest API request handlers
//!
//! Split into submodules by domain:
//! - `upload` — ticket issuance, proxy streaming, direct finalization
//! - `multipart` — resumable session lifecycle
//! - `duplicates` — pre-upload duplicate queries and index stats
//! - `status` — health check

mod duplicates;
mod multipart;
mod status;
mod upload;

use crate::metrics::Metrics;
use crate::orchestrator::UploadOrchestrator;
use std::sync::Arc;

// Re-export all public handlers so the router doesn't reach into submodules.
pub use duplicates::{check_by_hash, check_by_name, hash_stats};
pub use multipart::{
    multipart_abort, multipart_complete, multipart_init, multipart_part_url, multipart_parts,
};
pub use status::{health_check, HealthResponse};
pub use upload::{finalize_direct, presign, presign_batch, proxy_upload};

// Re-export for use by metrics module
pub(crate) use status::get_peak_rss_bytes;

/// Application state shared across handlers
pub struct AppState {
    pub orchestrator: Arc<UploadOrchestrator>,
    pub metrics: Option<Arc<Metrics>>,
}
