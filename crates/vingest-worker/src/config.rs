//! Worker configuration.

use std::time::Duration;

use crate::error::{WorkerError, WorkerResult};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// One output rendition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionSpec {
    /// Name used in output keys and cache keys (e.g. "720p")
    pub name: String,
    /// Output height in pixels; width follows the aspect ratio
    pub height: u32,
    /// Target video bitrate (ffmpeg syntax, e.g. "2500k")
    pub video_bitrate: String,
}

impl RenditionSpec {
    pub fn new(name: impl Into<String>, height: u32, video_bitrate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            height,
            video_bitrate: video_bitrate.into(),
        }
    }

    /// Parse `name:height:bitrate` entries separated by commas.
    pub fn parse_list(s: &str) -> Option<Vec<Self>> {
        let specs: Option<Vec<Self>> = s
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let mut parts = entry.split(':');
                let name = parts.next()?.trim();
                let height = parts.next()?.trim().parse().ok()?;
                let bitrate = parts.next()?.trim();
                if name.is_empty() || bitrate.is_empty() || parts.next().is_some() {
                    return None;
                }
                Some(Self::new(name, height, bitrate))
            })
            .collect();
        specs.filter(|list| !list.is_empty())
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Subscriptions (and so concurrent jobs) per process
    pub consumers: usize,
    /// How long a ledger claim stays valid without renewal
    pub lease_duration: Duration,
    /// Interval for renewing the claim and message visibility while processing
    pub heartbeat_interval: Duration,
    /// Transcode attempts before a retryable failure is dead-lettered
    pub max_attempts: u32,
    /// Deliveries after which a message is treated as poison
    pub max_deliveries: u32,
    /// How long ledger records are kept
    pub ledger_ttl: Duration,
    /// Job timeout
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Work directory for temporary files
    pub work_dir: String,
    /// Key prefix for rendition outputs
    pub output_prefix: String,
    pub renditions: Vec<RenditionSpec>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            consumers: 2,
            lease_duration: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            max_attempts: 3,
            max_deliveries: 5,
            ledger_ttl: Duration::from_secs(7 * 24 * 3600),
            job_timeout: Duration::from_secs(3600), // 1 hour
            shutdown_timeout: Duration::from_secs(30),
            work_dir: "/tmp/vingest".to_string(),
            output_prefix: "renditions".to_string(),
            renditions: vec![
                RenditionSpec::new("720p", 720, "2500k"),
                RenditionSpec::new("480p", 480, "1000k"),
            ],
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            consumers: env_or("WORKER_CONSUMERS", defaults.consumers).max(1),
            lease_duration: Duration::from_secs(env_or(
                "WORKER_LEASE_SECS",
                defaults.lease_duration.as_secs(),
            )),
            heartbeat_interval: Duration::from_secs(
                env_or("WORKER_HEARTBEAT_SECS", defaults.heartbeat_interval.as_secs()).max(1),
            ),
            max_attempts: env_or("WORKER_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            max_deliveries: env_or("QUEUE_MAX_DELIVERIES", defaults.max_deliveries).max(1),
            ledger_ttl: Duration::from_secs(env_or(
                "WORKER_LEDGER_TTL_SECS",
                defaults.ledger_ttl.as_secs(),
            )),
            job_timeout: Duration::from_secs(env_or(
                "WORKER_JOB_TIMEOUT",
                defaults.job_timeout.as_secs(),
            )),
            shutdown_timeout: Duration::from_secs(env_or(
                "WORKER_SHUTDOWN_TIMEOUT",
                defaults.shutdown_timeout.as_secs(),
            )),
            work_dir: std::env::var("WORKER_WORK_DIR").unwrap_or(defaults.work_dir),
            output_prefix: std::env::var("RENDITION_PREFIX").unwrap_or(defaults.output_prefix),
            renditions: std::env::var("WORKER_RENDITIONS")
                .ok()
                .and_then(|s| RenditionSpec::parse_list(&s))
                .unwrap_or(defaults.renditions),
        }
    }

    /// Check the timing settings against the queue's visibility timeout.
    ///
    /// A redelivered message must find the crashed holder's lease expired,
    /// and a heartbeat must land before the lease it renews runs out.
    pub fn validate_against(&self, visibility_timeout: Duration) -> WorkerResult<()> {
        if self.lease_duration >= visibility_timeout {
            return Err(WorkerError::config_error(format!(
                "lease duration {:?} must be shorter than the queue visibility timeout {:?}",
                self.lease_duration, visibility_timeout
            )));
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(WorkerError::config_error(format!(
                "heartbeat interval {:?} must be shorter than the lease duration {:?}",
                self.heartbeat_interval, self.lease_duration
            )));
        }
        Ok(())
    }
}
