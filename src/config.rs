//! Configuration for the sermon ingest server

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Object store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Files at or above this size are steered away from direct-presign
    /// toward the proxy/multipart modes (bytes)
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: u64,

    /// Hard ceiling on a single upload (bytes)
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u64,

    /// Commits inside one notify window are aggregated into a single event
    /// once their count reaches this threshold
    #[serde(default = "default_batch_notify_threshold")]
    pub batch_notify_threshold: usize,

    /// Aggregation window for batch notifications
    #[serde(with = "humantime_duration", default = "default_batch_notify_window")]
    pub batch_notify_window: Duration,

    /// Multipart sessions idle longer than this are swept and force-aborted
    #[serde(with = "humantime_duration", default = "default_session_idle_ttl")]
    pub session_idle_ttl: Duration,

    /// Parallel HeadObject calls during the hash-index warm load
    #[serde(default = "default_warm_load_concurrency")]
    pub warm_load_concurrency: usize,

    /// In-flight cap for proxy-path uploads (0 = max(2, cores))
    #[serde(default)]
    pub max_concurrent_uploads: usize,

    /// Fixed I/O copy block size (bytes)
    #[serde(default = "default_io_buffer_size")]
    pub io_buffer_size: usize,

    /// Multipart part size for streaming puts and session chunking (bytes)
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Lifetime of presigned upload/part URLs
    #[serde(with = "humantime_duration", default = "default_presign_ttl")]
    pub presign_ttl: Duration,

    /// Webhook endpoint for commit notifications (disabled when unset)
    #[serde(default)]
    pub notify_webhook_url: Option<String>,

    /// Durable session-registry file (sessions survive restart when set)
    #[serde(default)]
    pub session_file: Option<PathBuf>,

    /// Tokio blocking-thread cap (None = tokio default)
    #[serde(default)]
    pub blocking_threads: Option<usize>,
}

/// S3-compatible object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Endpoint URL (MinIO, LocalStack, or any S3-compatible service).
    /// If not specified, uses the AWS default endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bucket holding ingested recordings
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,

    /// Use path-style URLs (required for MinIO, LocalStack)
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,

    /// Access key ID (optional, can use env/instance credentials)
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Secret access key (optional, can use env/instance credentials)
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:8080".parse().unwrap()
}

fn default_large_file_threshold() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_max_object_size() -> u64 {
    8 * 1024 * 1024 * 1024 // 8 GiB — a ~12h uncompressed stereo WAV
}

fn default_batch_notify_threshold() -> usize {
    3
}

fn default_batch_notify_window() -> Duration {
    Duration::from_secs(10)
}

fn default_session_idle_ttl() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_warm_load_concurrency() -> usize {
    8
}

fn default_io_buffer_size() -> usize {
    64 * 1024
}

fn default_part_size() -> u64 {
    8 * 1024 * 1024
}

fn default_presign_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_bucket() -> String {
    "sermons".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: default_bucket(),
            region: default_region(),
            force_path_style: default_force_path_style(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            store: StoreConfig::default(),
            large_file_threshold: default_large_file_threshold(),
            max_object_size: default_max_object_size(),
            batch_notify_threshold: default_batch_notify_threshold(),
            batch_notify_window: default_batch_notify_window(),
            session_idle_ttl: default_session_idle_ttl(),
            warm_load_concurrency: default_warm_load_concurrency(),
            max_concurrent_uploads: 0,
            io_buffer_size: default_io_buffer_size(),
            part_size: default_part_size(),
            presign_ttl: default_presign_ttl(),
            notify_webhook_url: None,
            session_file: None,
            blocking_threads: None,
        }
    }
}

/// Serialize/deserialize `std::time::Duration` as humantime strings ("15m", "1h").
mod humantime_duration {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("SERMON_INGEST_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Ok(bucket) = std::env::var("SERMON_INGEST_S3_BUCKET") {
            config.store.bucket = bucket;
        }
        if let Ok(endpoint) = std::env::var("SERMON_INGEST_S3_ENDPOINT") {
            config.store.endpoint = Some(endpoint);
        }
        if let Ok(region) = std::env::var("SERMON_INGEST_S3_REGION") {
            config.store.region = region;
        }
        if let Ok(v) = std::env::var("SERMON_INGEST_S3_FORCE_PATH_STYLE") {
            config.store.force_path_style = v == "true" || v == "1";
        }
        config.store.access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok();
        config.store.secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok();

        if let Ok(v) = std::env::var("SERMON_INGEST_LARGE_FILE_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                config.large_file_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("SERMON_INGEST_MAX_OBJECT_SIZE") {
            if let Ok(parsed) = v.parse() {
                config.max_object_size = parsed;
            }
        }
        if let Ok(v) = std::env::var("SERMON_INGEST_BATCH_NOTIFY_THRESHOLD") {
            if let Ok(parsed) = v.parse() {
                config.batch_notify_threshold = parsed;
            }
        }
        if let Ok(v) = std::env::var("SERMON_INGEST_SESSION_IDLE_TTL") {
            if let Ok(parsed) = humantime::parse_duration(&v) {
                config.session_idle_ttl = parsed;
            }
        }
        if let Ok(v) = std::env::var("SERMON_INGEST_MAX_CONCURRENT_UPLOADS") {
            if let Ok(parsed) = v.parse() {
                config.max_concurrent_uploads = parsed;
            }
        }
        if let Ok(url) = std::env::var("SERMON_INGEST_NOTIFY_WEBHOOK_URL") {
            config.notify_webhook_url = Some(url);
        }
        if let Ok(path) = std::env::var("SERMON_INGEST_SESSION_FILE") {
            config.session_file = Some(PathBuf::from(path));
        }

        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SERMON_INGEST_CONFIG") {
            if let Ok(config) = Self::from_file(&path) {
                return config;
            }
        }

        for path in &["sermon-ingest.toml", "/etc/sermon-ingest/config.toml"] {
            if std::path::Path::new(path).exists() {
                if let Ok(config) = Self::from_file(path) {
                    return config;
                }
            }
        }

        Self::from_env()
    }

    /// Effective proxy-path concurrency cap: configured value, or max(2, cores).
    pub fn effective_upload_concurrency(&self) -> usize {
        if self.max_concurrent_uploads > 0 {
            self.max_concurrent_uploads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
                .max(2)
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.store.bucket, "sermons");
        assert_eq!(config.large_file_threshold, 100 * 1024 * 1024);
        assert_eq!(config.presign_ttl, Duration::from_secs(3600));
        assert!(config.effective_upload_concurrency() >= 2);
    }

    #[test]
    fn test_config_parse_toml() {
        let toml = r#"
            listen_addr = "0.0.0.0:9090"
            large_file_threshold = 10485760
            session_idle_ttl = "45m"
            presign_ttl = "30m"

            [store]
            endpoint = "http://localhost:9000"
            bucket = "sermons-test"
            region = "us-east-1"
            force_path_style = true
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.listen_addr.port(), 9090);
        assert_eq!(config.large_file_threshold, 10 * 1024 * 1024);
        assert_eq!(config.session_idle_ttl, Duration::from_secs(45 * 60));
        assert_eq!(config.presign_ttl, Duration::from_secs(30 * 60));
        assert_eq!(config.store.bucket, "sermons-test");
        assert_eq!(
            config.store.endpoint.as_deref(),
            Some("http://localhost:9000")
        );
        assert!(config.store.force_path_style);
    }

    #[test]
    fn test_duration_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.session_idle_ttl, config.session_idle_ttl);
        assert_eq!(parsed.batch_notify_window, config.batch_notify_window);
    }

    #[test]
    fn test_explicit_concurrency_wins() {
        let config = Config {
            max_concurrent_uploads: 7,
            ..Default::default()
        };
        assert_eq!(config.effective_upload_concurrency(), 7);
    }
}
