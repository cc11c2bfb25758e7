//! API error taxonomy and JSON responses

use crate::orchestrator::UploadError;
use crate::storage::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Seconds a client should back off when the hash index is still warming.
const NOT_READY_RETRY_AFTER: u64 = 5;

/// Errors surfaced by the HTTP layer
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("duplicate of existing object {existing}")]
    Conflict { existing: String },

    #[error("hash index is still warming up")]
    NotReady,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("object store rejected the request: {0}")]
    StoreRejected(String),

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code carried in the response body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Conflict { .. } => "duplicate",
            ApiError::NotReady => "not_ready",
            ApiError::NotFound(_) => "not_found",
            ApiError::Integrity(_) => "integrity_failure",
            ApiError::StoreUnavailable(_) => "store_unavailable",
            ApiError::StoreRejected(_) => "store_rejected",
            ApiError::InsufficientStorage(_) => "insufficient_storage",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Integrity(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::StoreUnavailable(_) => StatusCode::BAD_GATEWAY,
            ApiError::StoreRejected(_) => StatusCode::BAD_GATEWAY,
            ApiError::InsufficientStorage(_) => StatusCode::INSUFFICIENT_STORAGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        match &self {
            ApiError::Conflict { existing } => {
                body["existing"] = serde_json::Value::String(existing.clone());
            }
            ApiError::NotReady => {
                body["retry_after"] = serde_json::Value::from(NOT_READY_RETRY_AFTER);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::NotReady) {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from_static("5"),
            );
        }
        response
    }
}

impl From<UploadError> for ApiError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(msg) => ApiError::BadRequest(msg),
            UploadError::Duplicate { existing } => ApiError::Conflict { existing },
            UploadError::NotReady => ApiError::NotReady,
            UploadError::NotFound(what) => ApiError::NotFound(what),
            UploadError::Integrity(msg) => ApiError::Integrity(msg),
            UploadError::Store(store) => store.into(),
            UploadError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => ApiError::NotFound(format!("object {name}")),
            StoreError::UploadNotFound(id) => ApiError::NotFound(format!("upload {id}")),
            StoreError::SizeMismatch { declared, actual } => ApiError::Integrity(format!(
                "declared size {declared} but stream carried {actual} bytes"
            )),
            StoreError::InsufficientStorage(msg) => ApiError::InsufficientStorage(msg),
            err @ StoreError::Transient(_) | err @ StoreError::Io(_) => {
                ApiError::StoreUnavailable(err.to_string())
            }
            StoreError::Terminal(msg) => ApiError::StoreRejected(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Conflict {
                existing: "a.wav".into()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::NotReady.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::NotFound("s".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Integrity("h".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::StoreUnavailable("t".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::InsufficientStorage("q".into()).status_code(),
            StatusCode::INSUFFICIENT_STORAGE
        );
        assert_eq!(
            ApiError::Internal("i".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_upload_error_conversion() {
        let err: ApiError = UploadError::Duplicate {
            existing: "sermon_1.wav".into(),
        }
        .into();
        assert!(matches!(err, ApiError::Conflict { ref existing } if existing == "sermon_1.wav"));

        let err: ApiError = UploadError::Store(StoreError::Transient("timeout".into())).into();
        assert!(matches!(err, ApiError::StoreUnavailable(_)));

        let err: ApiError = UploadError::Store(StoreError::SizeMismatch {
            declared: 10,
            actual: 7,
        })
        .into();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
