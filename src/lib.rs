//! Sermon Ingest - upload ingestion engine for large WAV recordings
//!
//! This library provides the core functionality for the sermon ingest server:
//! upload tickets, streaming proxy ingestion, resumable multipart sessions,
//! and the content-hash duplicate index over an S3-compatible object store.

pub mod api;
pub mod config;
pub mod hash_index;
pub mod integrity;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod session;
pub mod storage;
pub mod types;
