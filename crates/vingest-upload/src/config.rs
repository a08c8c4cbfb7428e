//! Upload configuration.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Limits and lifetimes for upload sessions.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Largest accepted chunk size in bytes
    pub max_chunk_size: u64,
    /// Largest accepted file in bytes
    pub max_total_size: u64,
    /// Largest accepted number of chunks per session
    pub max_chunk_count: u32,
    /// Time a session may stay open before it expires
    pub session_ttl: Duration,
    /// Time a terminal session is kept for status queries
    pub retention: Duration,
    /// Key prefix for assembled artifacts
    pub artifact_prefix: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 64 * 1024 * 1024,
            max_total_size: 10 * 1024 * 1024 * 1024,
            max_chunk_count: 10_000,
            session_ttl: Duration::from_secs(24 * 3600),
            retention: Duration::from_secs(24 * 3600),
            artifact_prefix: "uploads".to_string(),
        }
    }
}

impl UploadConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_chunk_size: env_or("UPLOAD_MAX_CHUNK_SIZE", defaults.max_chunk_size),
            max_total_size: env_or("UPLOAD_MAX_TOTAL_SIZE", defaults.max_total_size),
            max_chunk_count: env_or("UPLOAD_MAX_CHUNK_COUNT", defaults.max_chunk_count),
            session_ttl: Duration::from_secs(env_or(
                "UPLOAD_SESSION_TTL_SECS",
                defaults.session_ttl.as_secs(),
            )),
            retention: Duration::from_secs(env_or(
                "UPLOAD_RETENTION_SECS",
                defaults.retention.as_secs(),
            )),
            artifact_prefix: std::env::var("UPLOAD_ARTIFACT_PREFIX")
                .unwrap_or(defaults.artifact_prefix),
        }
    }
}

/// Background sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval: Duration,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

impl SweepConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("ENABLE_SESSION_SWEEPER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            interval: Duration::from_secs(env_or("SESSION_SWEEP_INTERVAL_SECS", 30u64).max(1)),
        }
    }
}
