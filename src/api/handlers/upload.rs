//! Upload-path handlers: ticket issuance, proxy streaming, direct finalization.

use super::AppState;
use crate::api::errors::ApiError;
use crate::orchestrator::{IssuedTicket, UploadError};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tracing::{info, instrument};

/// Body of POST /upload/presign (and each element of the batch form).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub filename: String,
    pub file_size: u64,
}

/// Ticket response echoed to the browser.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub upload_url: String,
    pub upload_method: String,
    pub target_name: String,
    pub is_duplicate: bool,
    pub is_large_file: bool,
    pub expires: DateTime<Utc>,
}

impl From<IssuedTicket> for PresignResponse {
    fn from(issued: IssuedTicket) -> Self {
        Self {
            upload_url: issued.ticket.upload_url,
            upload_method: issued.ticket.mode.as_str().to_string(),
            target_name: issued.ticket.target_object_name,
            is_duplicate: false,
            is_large_file: issued.is_large_file,
            expires: issued.ticket.expires_at,
        }
    }
}

/// POST /upload/presign
#[instrument(skip(state))]
pub async fn presign(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresignRequest>,
) -> Result<Json<PresignResponse>, ApiError> {
    let issued = state
        .orchestrator
        .issue_ticket(&req.filename, req.file_size)
        .await?;
    Ok(Json(issued.into()))
}

#[derive(Debug, Deserialize)]
pub struct PresignBatchRequest {
    pub files: Vec<PresignRequest>,
}

/// Per-file entry of the batch response. Duplicates and per-file errors do
/// not fail the batch; each file reports its own outcome.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Ticket(PresignResponse),
    Duplicate {
        #[serde(rename = "isDuplicate")]
        is_duplicate: bool,
        #[serde(rename = "existingName")]
        existing_name: String,
    },
    Failed {
        error: String,
        code: &'static str,
    },
}

#[derive(Debug, Serialize)]
pub struct PresignBatchResponse {
    pub results: HashMap<String, BatchEntry>,
}

/// POST /upload/presign/batch
#[instrument(skip(state, req), fields(files = req.files.len()))]
pub async fn presign_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PresignBatchRequest>,
) -> Result<Json<PresignBatchResponse>, ApiError> {
    let files: Vec<(String, u64)> = req
        .files
        .iter()
        .map(|f| (f.filename.clone(), f.file_size))
        .collect();

    let mut results = HashMap::with_capacity(files.len());
    for (filename, outcome) in state.orchestrator.issue_tickets_batch(&files).await {
        let entry = match outcome {
            Ok(issued) => BatchEntry::Ticket(issued.into()),
            Err(UploadError::Duplicate { existing }) => BatchEntry::Duplicate {
                is_duplicate: true,
                existing_name: existing,
            },
            // Index warm-up gates the whole batch, not individual files.
            Err(UploadError::NotReady) => return Err(ApiError::NotReady),
            Err(err) => {
                let api: ApiError = err.into();
                BatchEntry::Failed {
                    error: api.to_string(),
                    code: api.code(),
                }
            }
        };
        results.insert(filename, entry);
    }

    Ok(Json(PresignBatchResponse { results }))
}

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct ProxyResponse {
    pub name: String,
    pub hash: String,
    pub size: u64,
}

/// PUT /upload/proxy?filename=…
///
/// The request body is wired straight into the orchestrator's streaming
/// path — no intermediate buffering. `Content-Length` is required; the
/// declared size is held against the stream byte-for-byte.
#[instrument(skip(state, headers, body))]
pub async fn proxy_upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ProxyResponse>, ApiError> {
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| ApiError::BadRequest("Content-Length header is required".into()))?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let reader = StreamReader::new(
        body.into_data_stream()
            .map_err(|err| std::io::Error::other(err.to_string())),
    );

    let committed = state
        .orchestrator
        .proxy_stream(
            &query.filename,
            declared_size,
            Box::new(reader),
            content_type.as_deref(),
        )
        .await?;

    Ok(Json(ProxyResponse {
        name: committed.object_name,
        hash: committed.content_hash,
        size: committed.size,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    /// The stored object name from the ticket (`targetName`).
    pub filename: String,
}

#[derive(Debug, Serialize)]
pub struct FinalizeResponse {
    pub name: String,
    pub hash: String,
    pub size: u64,
    pub ok: bool,
}

/// POST /upload/finalize — a direct-presign client reports its PUT finished;
/// the service verifies, dedupes, and indexes the object.
#[instrument(skip(state))]
pub async fn finalize_direct(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<FinalizeResponse>, ApiError> {
    let committed = state.orchestrator.finalize_direct(&req.filename).await?;
    info!(name = %committed.object_name, "direct upload finalized");
    Ok(Json(FinalizeResponse {
        name: committed.object_name,
        hash: committed.content_hash,
        size: committed.size,
        ok: true,
    }))
}
