//! Process-wide content-hash index.
//!
//! Maps SHA-256 content hashes to canonical object names for O(1) duplicate
//! queries, with a side map keyed by (normalized base name, size) backing the
//! cheap pre-upload check. Warm-loaded from a full bucket listing at startup;
//! maintained incrementally on every commit.
//!
//! The index is an acceleration layer, not the source of truth — the object
//! store is. Hits are always truthful; a miss is only meaningful once the
//! warm load has finished, which is why lookups distinguish `NotReady`.

use crate::storage::ObjectStore;
use crate::types::{self, meta_keys};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Result of a hash lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexLookup {
    /// Warm load still running and the hash is not (yet) known.
    NotReady,
    /// Index is warm and the hash is absent.
    Miss,
    /// The hash maps to this canonical object name.
    Hit(String),
}

/// Index statistics for `/hash/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub ready: bool,
    pub count: usize,
    pub name_count: usize,
    /// Seconds the last warm load took (absent until it finishes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_duration_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh: Option<DateTime<Utc>>,
}

pub struct HashIndex {
    by_hash: DashMap<String, String>,
    /// (normalized base name, size) → canonical name
    by_name: DashMap<(String, u64), String>,
    ready: AtomicBool,
    load_duration: Mutex<Option<Duration>>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HashIndex {
    pub fn new() -> Self {
        Self {
            by_hash: DashMap::new(),
            by_name: DashMap::new(),
            ready: AtomicBool::new(false),
            load_duration: Mutex::new(None),
            last_refresh: Mutex::new(None),
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// O(1) duplicate query. A `Hit` is valid even mid-load (commits insert
    /// eagerly); a miss can only be asserted once the index is warm.
    pub fn lookup(&self, hash: &str) -> IndexLookup {
        let key = hash.to_ascii_lowercase();
        if let Some(entry) = self.by_hash.get(&key) {
            return IndexLookup::Hit(entry.value().clone());
        }
        if !self.ready() {
            return IndexLookup::NotReady;
        }
        IndexLookup::Miss
    }

    /// Register a committed object. First writer wins: a hash already mapped
    /// keeps its canonical name, and the winning name is returned so callers
    /// can detect that they lost the race.
    pub fn insert(&self, hash: &str, canonical_name: &str) -> String {
        let winner = self
            .by_hash
            .entry(hash.to_ascii_lowercase())
            .or_insert_with(|| canonical_name.to_string());
        winner.value().clone()
    }

    /// Cheap pre-upload check: does any object share this normalized base
    /// name and exact size?
    pub fn lookup_name(&self, filename: &str, size: u64) -> Option<String> {
        let base = types::normalized_base_name(filename);
        self.by_name
            .get(&(base, size))
            .map(|entry| entry.value().clone())
    }

    pub fn insert_name(&self, canonical_name: &str, size: u64) {
        let base = types::normalized_base_name(canonical_name);
        self.by_name
            .entry((base, size))
            .or_insert_with(|| canonical_name.to_string());
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            ready: self.ready(),
            count: self.by_hash.len(),
            name_count: self.by_name.len(),
            load_duration_secs: self.load_duration.lock().map(|d| d.as_secs_f64()),
            last_refresh: *self.last_refresh.lock(),
        }
    }

    /// Rebuild the index from a full bucket listing. Name entries come from
    /// the listing itself; content hashes require one HeadObject per object,
    /// fanned out with bounded concurrency.
    pub async fn warm_load(
        self: &Arc<Self>,
        store: Arc<dyn ObjectStore>,
        concurrency: usize,
    ) -> Result<(), crate::storage::StoreError> {
        let started = Instant::now();
        let entries = store.list("").await?;
        let total = entries.len();

        for entry in &entries {
            self.insert_name(&entry.name, entry.size);
        }

        let mut heads = futures::stream::iter(entries.into_iter().map(|entry| {
            let store = store.clone();
            async move {
                let meta = store.head_metadata(&entry.name).await;
                (entry.name, meta)
            }
        }))
        .buffer_unordered(concurrency.max(1));

        let mut hashed = 0usize;
        while let Some((name, meta)) = heads.next().await {
            match meta {
                Ok(meta) => {
                    if let Some(hash) = meta.get(meta_keys::CONTENT_HASH) {
                        self.insert(hash, &name);
                        hashed += 1;
                    }
                }
                Err(err) => {
                    // Objects that disappear mid-load or predate the hash
                    // metadata stay out of the index; the store remains the
                    // source of truth for them.
                    warn!(name, error = %err, "warm load: metadata unavailable");
                }
            }
        }
        drop(heads);

        let elapsed = started.elapsed();
        *self.load_duration.lock() = Some(elapsed);
        *self.last_refresh.lock() = Some(Utc::now());
        self.ready.store(true, Ordering::Release);

        info!(
            objects = total,
            hashed,
            elapsed_ms = elapsed.as_millis() as u64,
            "hash index warm load complete"
        );
        Ok(())
    }

    /// Full rebuild: drops readiness, clears both maps, reloads.
    pub async fn refresh(
        self: &Arc<Self>,
        store: Arc<dyn ObjectStore>,
        concurrency: usize,
    ) -> Result<(), crate::storage::StoreError> {
        self.ready.store(false, Ordering::Release);
        self.by_hash.clear();
        self.by_name.clear();
        self.warm_load(store, concurrency).await
    }
}
