//! Health-check handler.

use super::AppState;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub index_ready: bool,
    pub open_sessions: usize,
    pub peak_rss_bytes: u64,
}

/// Memory high-water mark of this process in bytes, from
/// `getrusage(RUSAGE_SELF)`. The kernel tracks the peak itself, so a spike
/// during a large upload shows up here even if it was gone before the next
/// `/health` poll.
pub(crate) fn get_peak_rss_bytes() -> u64 {
    // SAFETY: getrusage only writes into the zeroed `usage` struct we hand
    // it and cannot fail for RUSAGE_SELF; nothing aliases the local.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return 0;
        }
        let ru_maxrss = usage.ru_maxrss as u64;
        // ru_maxrss unit differs by platform: kilobytes on Linux, bytes on macOS.
        if cfg!(target_os = "macos") {
            ru_maxrss
        } else {
            ru_maxrss * 1024
        }
    }
}

/// Health check handler
/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let open_sessions = state
        .orchestrator
        .sessions()
        .list()
        .iter()
        .filter(|s| !s.status.is_terminal())
        .count();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        index_ready: state.orchestrator.index().ready(),
        open_sessions,
        peak_rss_bytes: get_peak_rss_bytes(),
    })
}
