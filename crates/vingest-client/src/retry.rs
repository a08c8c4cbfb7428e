//! Retry policy with exponential backoff and full jitter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use vingest_models::ErrorCode;

use crate::error::ClientError;

/// Whether repeating a call can change server state twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// Chunk send, status, dispatch
    Idempotent,
    /// Init, finish, abort
    NonIdempotent,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Idempotent => "idempotent",
            CallKind::NonIdempotent => "non_idempotent",
        }
    }
}

/// Maps the backoff cap for an attempt to the actual delay.
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Decides whether an error may be retried for a call kind.
pub type RetryablePredicate = Arc<dyn Fn(&ClientError, CallKind) -> bool + Send + Sync>;

/// Uniform delay in `[0, cap]`.
pub fn full_jitter(cap: Duration) -> Duration {
    let cap_ms = cap.as_millis() as u64;
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=cap_ms))
}

/// Idempotent calls retry on `Transient` and `DeadlineExceeded`; the rest
/// only on `Transient`, where the request provably never ran.
pub fn default_retryable(error: &ClientError, kind: CallKind) -> bool {
    match (error.code(), kind) {
        (ErrorCode::Transient, _) => true,
        (ErrorCode::DeadlineExceeded, CallKind::Idempotent) => true,
        _ => false,
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: JitterFn,
    pub retryable: RetryablePredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter: Arc::new(full_jitter),
            retryable: Arc::new(default_retryable),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Replace the jitter function, e.g. with the identity for deterministic tests.
    pub fn with_jitter(mut self, jitter: impl Fn(Duration) -> Duration + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    pub fn with_retryable(
        mut self,
        retryable: impl Fn(&ClientError, CallKind) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(retryable);
        self
    }

    /// Exponential cap for a 1-based attempt: `min(max_delay, base * 2^(attempt-1))`.
    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Delay before the retry that follows `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        (self.jitter)(self.backoff_cap(attempt))
    }

    pub fn should_retry(&self, error: &ClientError, kind: CallKind, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.retryable)(error, kind)
    }
}
