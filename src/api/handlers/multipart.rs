//! Resumable multipart session handlers.

use super::AppState;
use crate::api::errors::ApiError;
use crate::storage::PartRecord;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInitRequest {
    pub filename: String,
    pub file_size: u64,
    pub chunk_size: Option<u64>,
    pub expected_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInitResponse {
    pub session_id: String,
    pub object_name: String,
    pub total_parts: u32,
    pub chunk_size: u64,
    pub part_urls: Vec<String>,
}

/// POST /upload/multipart/init
#[instrument(skip(state))]
pub async fn multipart_init(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MultipartInitRequest>,
) -> Result<Json<MultipartInitResponse>, ApiError> {
    let init = state
        .orchestrator
        .multipart_init(&req.filename, req.file_size, req.chunk_size, req.expected_hash)
        .await?;
    Ok(Json(MultipartInitResponse {
        session_id: init.session_id,
        object_name: init.object_name,
        total_parts: init.total_parts,
        chunk_size: init.chunk_size,
        part_urls: init.part_urls,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrlQuery {
    pub session_id: String,
    pub part_number: u32,
}

#[derive(Debug, Serialize)]
pub struct PartUrlResponse {
    pub url: String,
}

/// GET /upload/multipart/part?sessionId=…&partNumber=…
#[instrument(skip(state))]
pub async fn multipart_part_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PartUrlQuery>,
) -> Result<Json<PartUrlResponse>, ApiError> {
    let url = state
        .orchestrator
        .multipart_part_url(&query.session_id, query.part_number)
        .await?;
    Ok(Json(PartUrlResponse { url }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

impl From<PartRecord> for PartInfo {
    fn from(p: PartRecord) -> Self {
        Self {
            part_number: p.part_number,
            etag: p.etag,
            size: p.size,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PartsResponse {
    pub parts: Vec<PartInfo>,
}

/// GET /upload/multipart/parts?sessionId=… — resume support: what the store
/// has already received.
#[instrument(skip(state))]
pub async fn multipart_parts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<PartsResponse>, ApiError> {
    let parts = state.orchestrator.multipart_parts(&query.session_id).await?;
    Ok(Json(PartsResponse {
        parts: parts.into_iter().map(PartInfo::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub session_id: String,
    pub parts: Vec<PartInfo>,
}

impl From<PartInfo> for PartRecord {
    fn from(p: PartInfo) -> Self {
        Self {
            part_number: p.part_number,
            etag: p.etag,
            size: p.size,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CompleteResponse {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

/// POST /upload/multipart/complete
#[instrument(skip(state, req), fields(session_id = %req.session_id, parts = req.parts.len()))]
pub async fn multipart_complete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<CompleteResponse>, ApiError> {
    let committed = state
        .orchestrator
        .multipart_complete(
            &req.session_id,
            req.parts.into_iter().map(PartRecord::from).collect(),
        )
        .await?;
    Ok(Json(CompleteResponse {
        name: committed.object_name,
        hash: committed.content_hash,
        size: committed.size,
    }))
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

/// DELETE /upload/multipart?sessionId=…
#[instrument(skip(state))]
pub async fn multipart_abort(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<AbortResponse>, ApiError> {
    state.orchestrator.multipart_abort(&query.session_id).await?;
    Ok(Json(AbortResponse { aborted: true }))
}
