//! Shared test harness: an in-memory `ObjectStore` and an in-process server.
//!
//! The in-memory store implements the full adapter contract — including the
//! declared-size discipline of `put_stream` — so orchestrator and HTTP tests
//! exercise the real upload paths without a network or a MinIO container.
//! Presigned URLs are opaque `mem://` markers; tests that would "PUT to the
//! URL" call the store's direct helpers instead, which is exactly what the
//! store would observe.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};
use parking_lot::Mutex;
use sermon_ingest::api::handlers::AppState;
use sermon_ingest::config::Config;
use sermon_ingest::hash_index::HashIndex;
use sermon_ingest::notify::{CommitNotifier, NullSink};
use sermon_ingest::orchestrator::UploadOrchestrator;
use sermon_ingest::session::SessionRegistry;
use sermon_ingest::storage::{
    ByteReader, CompletedObject, ObjectEntry, ObjectStat, ObjectStore, PartRecord, StoreError,
};
use sermon_ingest::types::meta_keys;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub const MB: u64 = 1024 * 1024;

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
    content_type: String,
    metadata: HashMap<String, String>,
}

struct MemUpload {
    name: String,
    content_type: String,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, (Vec<u8>, String)>,
}

/// In-memory S3 stand-in.
#[derive(Default)]
pub struct MemStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, MemUpload>>,
    upload_counter: AtomicU64,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of a stored object, if present.
    pub fn object_bytes(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(name).map(|o| o.data.clone())
    }

    pub fn object_metadata(&self, name: &str) -> Option<HashMap<String, String>> {
        self.objects.lock().get(name).map(|o| o.metadata.clone())
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    /// What a client's presigned PUT would leave behind: the raw object,
    /// no user metadata.
    pub fn put_direct(&self, name: &str, data: &[u8]) {
        self.objects.lock().insert(
            name.to_string(),
            StoredObject {
                data: data.to_vec(),
                etag: hex::encode(Md5::digest(data)),
                content_type: "audio/wav".to_string(),
                metadata: HashMap::new(),
            },
        );
    }

    /// Seed an object complete with ingest metadata, as a prior run of the
    /// service would have left it.
    pub fn seed_object(&self, name: &str, data: &[u8]) -> String {
        let hash = hex::encode(sha2::Sha256::digest(data));
        let metadata = HashMap::from([
            (meta_keys::CONTENT_HASH.to_string(), hash.clone()),
            (meta_keys::ORIGINAL_FILENAME.to_string(), name.to_string()),
            (
                meta_keys::UPLOAD_TIMESTAMP.to_string(),
                Utc::now().to_rfc3339(),
            ),
        ]);
        self.objects.lock().insert(
            name.to_string(),
            StoredObject {
                data: data.to_vec(),
                etag: hex::encode(Md5::digest(data)),
                content_type: "audio/wav".to_string(),
                metadata,
            },
        );
        hash
    }

    /// What a client's presigned part PUT would do. Returns the part etag.
    pub fn put_part(&self, upload_id: &str, part_number: u32, data: &[u8]) -> String {
        let etag = hex::encode(Md5::digest(data));
        let mut uploads = self.uploads.lock();
        let upload = uploads.get_mut(upload_id).expect("unknown upload id");
        upload
            .parts
            .insert(part_number, (data.to_vec(), etag.clone()));
        etag
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn ensure_bucket(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectStat>, StoreError> {
        Ok(self.objects.lock().get(name).map(|o| ObjectStat {
            size: o.data.len() as u64,
            etag: o.etag.clone(),
            last_modified: Some(Utc::now()),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        let mut entries: Vec<ObjectEntry> = self
            .objects
            .lock()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, o)| ObjectEntry {
                name: name.clone(),
                size: o.data.len() as u64,
                etag: o.etag.clone(),
                last_modified: Some(Utc::now()),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn head_metadata(&self, name: &str) -> Result<HashMap<String, String>, StoreError> {
        self.objects
            .lock()
            .get(name)
            .map(|o| o.metadata.clone())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn put_stream(
        &self,
        name: &str,
        mut reader: ByteReader,
        declared_size: u64,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        // Same discipline as the S3 adapter: drain exactly declared_size,
        // then require EOF.
        let mut data = vec![0u8; declared_size as usize];
        let mut filled = 0usize;
        while filled < data.len() {
            let n = reader.read(&mut data[filled..]).await?;
            if n == 0 {
                return Err(StoreError::SizeMismatch {
                    declared: declared_size,
                    actual: filled as u64,
                });
            }
            filled += n;
        }
        let mut probe = [0u8; 1];
        if reader.read(&mut probe).await? > 0 {
            return Err(StoreError::SizeMismatch {
                declared: declared_size,
                actual: declared_size + 1,
            });
        }

        let etag = hex::encode(Md5::digest(&data));
        self.objects.lock().insert(
            name.to_string(),
            StoredObject {
                data,
                etag,
                content_type: content_type.to_string(),
                metadata: user_metadata,
            },
        );
        Ok(())
    }

    async fn get_stream(&self, name: &str) -> Result<ByteReader, StoreError> {
        let data = self
            .object_bytes(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.objects.lock().remove(name);
        Ok(())
    }

    async fn set_metadata(
        &self,
        name: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        object.metadata = user_metadata;
        Ok(())
    }

    async fn multipart_init(
        &self,
        name: &str,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<String, StoreError> {
        let id = format!("mem-upload-{}", self.upload_counter.fetch_add(1, Ordering::SeqCst));
        self.uploads.lock().insert(
            id.clone(),
            MemUpload {
                name: name.to_string(),
                content_type: content_type.to_string(),
                metadata: user_metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn multipart_part_url(
        &self,
        name: &str,
        upload_id: &str,
        part_number: u32,
        _ttl: Duration,
    ) -> Result<String, StoreError> {
        if !self.uploads.lock().contains_key(upload_id) {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }
        Ok(format!("mem://{name}/{upload_id}/{part_number}"))
    }

    async fn multipart_parts(
        &self,
        _name: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, StoreError> {
        let uploads = self.uploads.lock();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| StoreError::UploadNotFound(upload_id.to_string()))?;
        Ok(upload
            .parts
            .iter()
            .map(|(&n, (data, etag))| PartRecord {
                part_number: n,
                etag: etag.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn multipart_complete(
        &self,
        name: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompletedObject, StoreError> {
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get(upload_id)
            .ok_or_else(|| StoreError::UploadNotFound(upload_id.to_string()))?;

        let mut assembled = Vec::new();
        let mut md5_concat = Vec::new();
        for part in parts {
            let (data, etag) = upload.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::Terminal(format!("part {} was never uploaded", part.part_number))
            })?;
            if part.etag.trim_matches('"') != etag {
                return Err(StoreError::Terminal(format!(
                    "etag mismatch for part {}",
                    part.part_number
                )));
            }
            assembled.extend_from_slice(data);
            md5_concat.extend_from_slice(&hex::decode(etag).unwrap());
        }

        let etag = format!("{}-{}", hex::encode(Md5::digest(&md5_concat)), parts.len());
        let size = assembled.len() as u64;
        let object = StoredObject {
            data: assembled,
            etag: etag.clone(),
            content_type: upload.content_type.clone(),
            metadata: upload.metadata.clone(),
        };
        let name = name.to_string();
        drop(uploads);

        self.objects.lock().insert(name, object);
        self.uploads.lock().remove(upload_id);
        Ok(CompletedObject { etag, size })
    }

    async fn multipart_abort(&self, _name: &str, upload_id: &str) -> Result<(), StoreError> {
        self.uploads.lock().remove(upload_id);
        Ok(())
    }

    async fn presign_put(
        &self,
        name: &str,
        _ttl: Duration,
        _content_type: &str,
    ) -> Result<String, StoreError> {
        Ok(format!("mem://put/{name}"))
    }

    async fn presign_get(&self, name: &str, _ttl: Duration) -> Result<String, StoreError> {
        Ok(format!("mem://get/{name}"))
    }
}

/// Everything a test needs: the fake store, the wired orchestrator, and an
/// in-process HTTP server bound to an ephemeral port.
pub struct TestContext {
    pub store: Arc<MemStore>,
    pub index: Arc<HashIndex>,
    pub sessions: Arc<SessionRegistry>,
    pub orchestrator: Arc<UploadOrchestrator>,
    pub base_url: String,
    pub client: reqwest::Client,
}

/// Config tuned for tests: a small large-file threshold so both ticket modes
/// are reachable with megabyte payloads.
pub fn test_config() -> Config {
    Config {
        large_file_threshold: 10 * MB,
        max_object_size: 256 * MB,
        part_size: 5 * MB,
        ..Config::default()
    }
}

impl TestContext {
    /// Standard context: warm index, default test config.
    pub async fn start() -> Self {
        Self::start_with(test_config(), true).await
    }

    /// Context with a cold index (warm load never run) for 503 gating tests.
    pub async fn start_cold() -> Self {
        Self::start_with(test_config(), false).await
    }

    pub async fn start_with(config: Config, warm: bool) -> Self {
        let store = Arc::new(MemStore::new());
        Self::start_on(store, config, warm).await
    }

    /// Build on a pre-seeded store (warm-load tests).
    pub async fn start_on(store: Arc<MemStore>, config: Config, warm: bool) -> Self {
        let index = Arc::new(HashIndex::new());
        let sessions = Arc::new(SessionRegistry::new());
        let notifier = CommitNotifier::spawn(
            Arc::new(NullSink),
            config.batch_notify_threshold,
            config.batch_notify_window,
        );

        let store_dyn: Arc<dyn ObjectStore> = store.clone();
        if warm {
            index
                .warm_load(store_dyn.clone(), config.warm_load_concurrency)
                .await
                .expect("warm load against MemStore cannot fail");
        }

        let orchestrator = Arc::new(UploadOrchestrator::new(
            store_dyn,
            index.clone(),
            sessions.clone(),
            notifier,
            None,
            config,
        ));

        let state = Arc::new(AppState {
            orchestrator: orchestrator.clone(),
            metrics: None,
        });
        let app = sermon_ingest::api::router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("test server");
        });

        Self {
            store,
            index,
            sessions,
            orchestrator,
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Deterministic pseudo-random payload (xorshift; no RNG dependency needed).
pub fn generate_binary(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha2::Sha256::digest(data))
}
