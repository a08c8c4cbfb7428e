//! Queue and dispatcher configuration.

use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Work channel configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for jobs
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter queue stream name
    pub dlq_stream_name: String,
    /// Time a delivered message stays invisible before redelivery
    pub visibility_timeout: Duration,
    /// Deliveries after which a message is treated as poison
    pub max_deliveries: u32,
    /// Key prefix for idempotency records
    pub key_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "vingest:jobs".to_string(),
            consumer_group: "vingest:workers".to_string(),
            dlq_stream_name: "vingest:dlq".to_string(),
            visibility_timeout: Duration::from_secs(300),
            max_deliveries: 5,
            key_prefix: "vingest".to_string(),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            visibility_timeout: Duration::from_secs(env_or(
                "QUEUE_VISIBILITY_TIMEOUT",
                defaults.visibility_timeout.as_secs(),
            )),
            max_deliveries: env_or("QUEUE_MAX_DELIVERIES", defaults.max_deliveries),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
        }
    }
}

/// Dispatcher publish retry configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Publish attempts before giving up with `DispatchFailed`.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// How long a publish marker suppresses re-dispatch.
    pub marker_ttl: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            marker_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl DispatchConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_or("DISPATCH_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            base_delay: Duration::from_millis(env_or(
                "DISPATCH_RETRY_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(env_or(
                "DISPATCH_RETRY_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )),
            marker_ttl: Duration::from_secs(env_or(
                "DISPATCH_MARKER_TTL_SECS",
                defaults.marker_ttl.as_secs(),
            )),
        }
    }

    /// Upper bound of the backoff window for a 1-based attempt.
    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Full-jitter delay: uniform in `[0, backoff_cap(attempt)]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.backoff_cap(attempt).as_millis() as u64;
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::random_range(0..=cap))
    }
}
