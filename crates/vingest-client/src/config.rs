//! Client configuration.

use std::time::Duration;

use crate::circuit_breaker::BreakerConfig;
use crate::retry::RetryPolicy;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the upload API
    pub base_url: String,
    /// Timeout for a single attempt
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub breaker: BreakerConfig,
    /// Chunks in flight per upload
    pub upload_concurrency: usize,
    /// Finish/resend rounds before giving up on an upload
    pub max_resume_rounds: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            call_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            upload_concurrency: 4,
            max_resume_rounds: 3,
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let retry = RetryPolicy::default()
            .with_max_attempts(env_or("CLIENT_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts))
            .with_delays(
                Duration::from_millis(env_or(
                    "CLIENT_RETRY_BASE_MS",
                    defaults.retry.base_delay.as_millis() as u64,
                )),
                Duration::from_millis(env_or(
                    "CLIENT_RETRY_MAX_MS",
                    defaults.retry.max_delay.as_millis() as u64,
                )),
            );

        Self {
            base_url: std::env::var("VINGEST_API_URL").unwrap_or(defaults.base_url),
            call_timeout: Duration::from_secs(env_or(
                "CLIENT_CALL_TIMEOUT_SECS",
                defaults.call_timeout.as_secs(),
            )),
            retry,
            breaker: BreakerConfig::from_env(),
            upload_concurrency: env_or("CLIENT_UPLOAD_CONCURRENCY", defaults.upload_concurrency)
                .max(1),
            max_resume_rounds: env_or("CLIENT_MAX_RESUME_ROUNDS", defaults.max_resume_rounds),
        }
    }
}
