//! Duplicate-query handlers and index statistics.

use super::AppState;
use crate::api::errors::ApiError;
use crate::hash_index::IndexStats;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct FileProbe {
    pub filename: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NameCheckEntry {
    pub filename: String,
    pub size: u64,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NameCheckResponse {
    pub results: Vec<NameCheckEntry>,
}

/// POST /duplicates/by-name — cheap best-effort pre-check by normalized
/// base name and exact size.
#[instrument(skip(state, probes), fields(files = probes.len()))]
pub async fn check_by_name(
    State(state): State<Arc<AppState>>,
    Json(probes): Json<Vec<FileProbe>>,
) -> Result<Json<NameCheckResponse>, ApiError> {
    let files: Vec<(String, u64)> = probes.iter().map(|p| (p.filename.clone(), p.size)).collect();
    let checks = state.orchestrator.check_by_name(&files)?;
    Ok(Json(NameCheckResponse {
        results: checks
            .into_iter()
            .map(|c| NameCheckEntry {
                filename: c.filename,
                size: c.size,
                exists: c.exists,
                matched_name: c.matched_name,
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct HashCheckResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// GET /duplicates/by-hash/:hash — O(1) via the hash index.
#[instrument(skip(state))]
pub async fn check_by_hash(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
) -> Result<Json<HashCheckResponse>, ApiError> {
    let name = state.orchestrator.check_by_hash(&hash)?;
    Ok(Json(HashCheckResponse {
        exists: name.is_some(),
        name,
    }))
}

/// GET /hash/stats
pub async fn hash_stats(State(state): State<Arc<AppState>>) -> Json<IndexStats> {
    Json(state.orchestrator.hash_stats())
}
