//! API configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Where chunks and assembled artifacts live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Filesystem { root: PathBuf },
    R2,
}

/// Where transcode jobs are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Redis,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Request timeout
    pub request_timeout: Duration,
    /// Max request body size; must exceed the max chunk size
    pub max_body_size: usize,
    /// Environment (development/production)
    pub environment: String,
    pub storage: StorageBackend,
    pub queue: QueueBackend,
    /// Artifact key prefix workers store renditions under
    pub rendition_prefix: String,
    /// Delivery cache budget in bytes
    pub cache_max_bytes: usize,
    pub cache_ttl: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(120),
            max_body_size: 65 * 1024 * 1024, // 64MiB chunk + headroom
            environment: "development".to_string(),
            storage: StorageBackend::Memory,
            queue: QueueBackend::Memory,
            rendition_prefix: "renditions".to_string(),
            cache_max_bytes: 256 * 1024 * 1024,
            cache_ttl: Duration::from_secs(300),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let storage = match std::env::var("STORAGE_BACKEND")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "fs" | "filesystem" => StorageBackend::Filesystem {
                root: std::env::var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./data")),
            },
            "r2" => StorageBackend::R2,
            _ => StorageBackend::Memory,
        };

        let queue = match std::env::var("QUEUE_BACKEND")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "redis" => QueueBackend::Redis,
            _ => QueueBackend::Memory,
        };

        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            request_timeout: std::env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_body_size: std::env::var("MAX_BODY_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_body_size),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            storage,
            queue,
            rendition_prefix: std::env::var("RENDITION_PREFIX").unwrap_or(defaults.rendition_prefix),
            cache_max_bytes: std::env::var("DELIVERY_CACHE_MAX_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cache_max_bytes),
            cache_ttl: std::env::var("DELIVERY_CACHE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
