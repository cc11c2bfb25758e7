//! HTTP surface: routes, error mapping, correlation ids.

mod errors;
pub mod handlers;
mod request_id;

pub use errors::ApiError;
pub use request_id::{request_id_middleware, RequestId};

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post, put};
use axum::{middleware, Router};
use handlers::AppState;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the complete ingest router. Shared by `main` and the integration
/// tests, which serve it on an ephemeral port against an in-memory store.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route("/hash/stats", get(handlers::hash_stats))
        .route("/upload/presign", post(handlers::presign))
        .route("/upload/presign/batch", post(handlers::presign_batch))
        // The proxy body is a raw multi-gigabyte stream; the default body
        // limit must not apply (the declared-size check guards it instead).
        .route(
            "/upload/proxy",
            put(handlers::proxy_upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/upload/finalize", post(handlers::finalize_direct))
        .route("/upload/multipart/init", post(handlers::multipart_init))
        .route("/upload/multipart/part", get(handlers::multipart_part_url))
        .route("/upload/multipart/parts", get(handlers::multipart_parts))
        .route(
            "/upload/multipart/complete",
            post(handlers::multipart_complete),
        )
        .route("/upload/multipart", delete(handlers::multipart_abort))
        .route("/duplicates/by-name", post(handlers::check_by_name))
        .route("/duplicates/by-hash/:hash", get(handlers::check_by_hash))
        .layer(TraceLayer::new_for_http())
        // HTTP metrics middleware (records request counts, durations, sizes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::metrics::http_metrics_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        // CORS must be outermost so the browser queue can talk to us from
        // the static site origin.
        .layer(CorsLayer::permissive())
        .with_state(state)
}
