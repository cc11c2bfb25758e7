//! Prometheus metrics for the sermon ingest server.
//!
//! All metric types use atomics internally (no locks on the hot path).
//! The `Metrics` struct is `Clone`-cheap (Arc-based registry + Arc-based collectors).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder, TEXT_FORMAT,
};
use std::sync::Arc;
use std::time::Instant;

use crate::api::handlers::AppState;

/// All Prometheus metrics for the ingest server.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // -- Process & Build --
    pub process_start_time_seconds: Gauge,
    pub build_info: GaugeVec,
    pub process_peak_rss_bytes: Gauge,

    // -- HTTP Requests --
    pub http_requests_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub http_request_size_bytes: HistogramVec,
    pub http_response_size_bytes: HistogramVec,

    // -- Uploads --
    pub uploads_total: IntCounterVec,
    pub upload_bytes_total: IntCounter,
    pub upload_duration_seconds: HistogramVec,
    pub duplicates_detected_total: IntCounterVec,
    pub inflight_proxy_uploads: Gauge,

    // -- Sessions & Index --
    pub open_sessions: Gauge,
    pub hash_index_entries: Gauge,
    pub hash_index_ready: Gauge,

    // -- Notifications --
    pub notifications_total: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        // -- Process & Build --
        let process_start_time_seconds =
            Gauge::new("process_start_time_seconds", "Start time of the process").unwrap();
        registry
            .register(Box::new(process_start_time_seconds.clone()))
            .unwrap();

        let build_info = GaugeVec::new(
            Opts::new("sermon_ingest_build_info", "Build information"),
            &["version"],
        )
        .unwrap();
        registry.register(Box::new(build_info.clone())).unwrap();

        let process_peak_rss_bytes = Gauge::new(
            "process_peak_rss_bytes",
            "Peak resident set size in bytes (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(process_peak_rss_bytes.clone()))
            .unwrap();

        // Register standard process metrics (RSS, CPU, open FDs on Linux)
        #[cfg(target_os = "linux")]
        {
            let pc = prometheus::process_collector::ProcessCollector::for_self();
            let _ = registry.register(Box::new(pc));
        }

        // -- HTTP Requests --
        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "sermon_ingest_http_requests_total",
                "Total HTTP requests by method, status, and operation",
            ),
            &["method", "status", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_requests_total.clone()))
            .unwrap();

        let body_size_buckets = prometheus::exponential_buckets(1024.0, 10.0, 7).unwrap();
        // [1KB, 10KB, 100KB, 1MB, 10MB, 100MB, 1GB]

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sermon_ingest_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "operation"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .unwrap();

        let http_request_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "sermon_ingest_http_request_size_bytes",
                "HTTP request body size in bytes",
            )
            .buckets(body_size_buckets.clone()),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_request_size_bytes.clone()))
            .unwrap();

        let http_response_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "sermon_ingest_http_response_size_bytes",
                "HTTP response body size in bytes",
            )
            .buckets(body_size_buckets),
            &["method"],
        )
        .unwrap();
        registry
            .register(Box::new(http_response_size_bytes.clone()))
            .unwrap();

        // -- Uploads --
        let uploads_total = IntCounterVec::new(
            Opts::new(
                "sermon_ingest_uploads_total",
                "Upload operations by mode and outcome",
            ),
            &["mode", "outcome"],
        )
        .unwrap();
        registry.register(Box::new(uploads_total.clone())).unwrap();

        let upload_bytes_total = IntCounter::new(
            "sermon_ingest_upload_bytes_total",
            "Total payload bytes committed to the store",
        )
        .unwrap();
        registry
            .register(Box::new(upload_bytes_total.clone()))
            .unwrap();

        let upload_duration_buckets = vec![
            0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
        ];
        let upload_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "sermon_ingest_upload_duration_seconds",
                "Upload duration in seconds",
            )
            .buckets(upload_duration_buckets),
            &["mode"],
        )
        .unwrap();
        registry
            .register(Box::new(upload_duration_seconds.clone()))
            .unwrap();

        let duplicates_detected_total = IntCounterVec::new(
            Opts::new(
                "sermon_ingest_duplicates_detected_total",
                "Duplicate detections by layer (name or hash)",
            ),
            &["layer"],
        )
        .unwrap();
        registry
            .register(Box::new(duplicates_detected_total.clone()))
            .unwrap();

        let inflight_proxy_uploads = Gauge::new(
            "sermon_ingest_inflight_proxy_uploads",
            "Proxy-path uploads currently streaming through the service",
        )
        .unwrap();
        registry
            .register(Box::new(inflight_proxy_uploads.clone()))
            .unwrap();

        // -- Sessions & Index --
        let open_sessions = Gauge::new(
            "sermon_ingest_open_sessions",
            "Multipart sessions currently open (updated on scrape)",
        )
        .unwrap();
        registry.register(Box::new(open_sessions.clone())).unwrap();

        let hash_index_entries = Gauge::new(
            "sermon_ingest_hash_index_entries",
            "Entries in the content-hash index (updated on scrape)",
        )
        .unwrap();
        registry
            .register(Box::new(hash_index_entries.clone()))
            .unwrap();

        let hash_index_ready = Gauge::new(
            "sermon_ingest_hash_index_ready",
            "1 once the hash-index warm load has completed",
        )
        .unwrap();
        registry
            .register(Box::new(hash_index_ready.clone()))
            .unwrap();

        // -- Notifications --
        let notifications_total = IntCounterVec::new(
            Opts::new(
                "sermon_ingest_notifications_total",
                "Commit notifications by kind (single or batch)",
            ),
            &["kind"],
        )
        .unwrap();
        registry
            .register(Box::new(notifications_total.clone()))
            .unwrap();

        Metrics {
            registry,
            process_start_time_seconds,
            build_info,
            process_peak_rss_bytes,
            http_requests_total,
            http_request_duration_seconds,
            http_request_size_bytes,
            http_response_size_bytes,
            uploads_total,
            upload_bytes_total,
            upload_duration_seconds,
            duplicates_detected_total,
            inflight_proxy_uploads,
            open_sessions,
            hash_index_entries,
            hash_index_ready,
            notifications_total,
        }
    }
}

/// Classify a request path into a bounded operation label.
pub fn classify_operation(method: &str, path: &str) -> &'static str {
    match path {
        "/health" => return "health",
        "/metrics" => return "metrics",
        "/hash/stats" => return "hash_stats",
        "/upload/presign" => return "presign",
        "/upload/presign/batch" => return "presign_batch",
        "/upload/proxy" => return "proxy_upload",
        "/upload/finalize" => return "finalize",
        "/upload/multipart/init" => return "multipart_init",
        "/upload/multipart/part" => return "multipart_part_url",
        "/upload/multipart/parts" => return "multipart_parts",
        "/upload/multipart/complete" => return "multipart_complete",
        "/upload/multipart" => {
            return if method == "DELETE" {
                "multipart_abort"
            } else {
                "multipart"
            }
        }
        "/duplicates/by-name" => return "duplicates_by_name",
        _ => {}
    }
    if path.starts_with("/duplicates/by-hash/") {
        return "duplicates_by_hash";
    }
    "unknown"
}

/// Axum middleware that records HTTP request metrics.
pub async fn http_metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => return next.run(request).await,
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let operation = classify_operation(&method, &path);

    // Record request size from Content-Length if available
    if let Some(cl) = request
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_request_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    let start = Instant::now();
    let response = next.run(request).await;
    let duration = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    metrics
        .http_requests_total
        .with_label_values(&[&method, &status, operation])
        .inc();
    metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, operation])
        .observe(duration);

    // Record response size from Content-Length if available
    if let Some(cl) = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<f64>().ok())
    {
        metrics
            .http_response_size_bytes
            .with_label_values(&[&method])
            .observe(cl);
    }

    response
}

/// Handler for GET /metrics — returns Prometheus text format.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let metrics = match &state.metrics {
        Some(m) => m,
        None => {
            return (StatusCode::NOT_FOUND, "Metrics not enabled").into_response();
        }
    };

    // Update on-demand gauges (all O(1) reads)
    metrics
        .process_peak_rss_bytes
        .set(crate::api::handlers::get_peak_rss_bytes() as f64);
    let index_stats = state.orchestrator.hash_stats();
    metrics.hash_index_entries.set(index_stats.count as f64);
    metrics
        .hash_index_ready
        .set(if index_stats.ready { 1.0 } else { 0.0 });
    let open = state
        .orchestrator
        .sessions()
        .list()
        .iter()
        .filter(|s| !s.status.is_terminal())
        .count();
    metrics.open_sessions.set(open as f64);

    let encoder = TextEncoder::new();
    let metric_families = metrics.registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (StatusCode::OK, [("content-type", TEXT_FORMAT)], buffer).into_response()
}
