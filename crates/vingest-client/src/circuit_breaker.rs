//! Circuit breaker for remote dependencies.
//!
//! Closed counts dependency failures inside a sliding window and opens when
//! the count reaches the threshold. Open fails fast until the cooldown has
//! elapsed, then admits exactly one probe (HalfOpen). `success_threshold`
//! consecutive probe successes close the circuit and reset the counters; any
//! probe failure reopens it with a fresh cooldown.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::record_circuit_transition;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures inside `window` that open the circuit.
    pub failure_threshold: u32,
    pub window: Duration,
    /// Time spent open before a probe is admitted.
    pub cooldown: Duration,
    /// Consecutive probe successes needed to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

impl BreakerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: env_or("CLIENT_BREAKER_FAILURES", defaults.failure_threshold).max(1),
            window: Duration::from_secs(env_or("CLIENT_BREAKER_WINDOW_SECS", defaults.window.as_secs())),
            cooldown: Duration::from_secs(env_or(
                "CLIENT_BREAKER_COOLDOWN_SECS",
                defaults.cooldown.as_secs(),
            )),
            success_threshold: env_or("CLIENT_BREAKER_SUCCESSES", defaults.success_threshold).max(1),
        }
    }
}

/// Circuit breaker states.
#[derive(Clone, Debug, PartialEq)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open { opened_at: Instant },
    /// Testing recovery with one probe at a time
    HalfOpen {
        consecutive_successes: u32,
        probe_started: Option<Instant>,
    },
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Normal,
    Probe,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_failure: Option<Instant>,
}

/// Circuit breaker owned by one client for one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    dependency: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            dependency: dependency.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                last_failure: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state.clone()
    }

    /// Failures inside the current window.
    pub fn failure_count(&self) -> u32 {
        self.failure_count_at(Instant::now())
    }

    pub fn failure_count_at(&self, now: Instant) -> u32 {
        let mut inner = self.lock();
        self.evict(&mut inner, now);
        inner.failures.len() as u32
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.lock().last_failure
    }

    fn evict(&self, inner: &mut Inner, now: Instant) {
        while let Some(oldest) = inner.failures.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, next: CircuitState) {
        let from = inner.state.as_str();
        let to = next.as_str();
        inner.state = next;
        if from != to {
            match to {
                "open" => warn!(dependency = %self.dependency, from, "Circuit opened"),
                _ => info!(dependency = %self.dependency, from, to, "Circuit state changed"),
            }
            record_circuit_transition(&self.dependency, to);
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        self.try_acquire_at(Instant::now())
    }

    /// Ask to make a call. `None` means fail fast.
    pub fn try_acquire_at(&self, now: Instant) -> Option<Permit> {
        let mut inner = self.lock();
        match inner.state.clone() {
            CircuitState::Closed => Some(Permit::Normal),
            CircuitState::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.config.cooldown {
                    self.transition(
                        &mut inner,
                        CircuitState::HalfOpen {
                            consecutive_successes: 0,
                            probe_started: Some(now),
                        },
                    );
                    Some(Permit::Probe)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen {
                consecutive_successes,
                probe_started,
            } => {
                // A probe whose caller vanished without reporting is abandoned after a cooldown
                let busy = probe_started
                    .map(|started| now.saturating_duration_since(started) < self.config.cooldown)
                    .unwrap_or(false);
                if busy {
                    None
                } else {
                    inner.state = CircuitState::HalfOpen {
                        consecutive_successes,
                        probe_started: Some(now),
                    };
                    Some(Permit::Probe)
                }
            }
        }
    }

    pub fn on_success(&self) {
        self.on_success_at(Instant::now())
    }

    /// Record a healthy response, business errors included.
    pub fn on_success_at(&self, now: Instant) {
        let mut inner = self.lock();
        match inner.state.clone() {
            CircuitState::Closed => self.evict(&mut inner, now),
            CircuitState::HalfOpen {
                consecutive_successes,
                ..
            } => {
                let successes = consecutive_successes + 1;
                if successes >= self.config.success_threshold {
                    inner.failures.clear();
                    self.transition(&mut inner, CircuitState::Closed);
                } else {
                    inner.state = CircuitState::HalfOpen {
                        consecutive_successes: successes,
                        probe_started: None,
                    };
                }
            }
            // a straggler admitted before the circuit opened
            CircuitState::Open { .. } => {}
        }
    }

    pub fn on_failure(&self) {
        self.on_failure_at(Instant::now())
    }

    /// Record a dependency failure.
    pub fn on_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failures.push_back(now);
                self.evict(&mut inner, now);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open { opened_at: now });
                }
            }
            CircuitState::HalfOpen { .. } => {
                self.transition(&mut inner, CircuitState::Open { opened_at: now });
            }
            CircuitState::Open { .. } => {}
        }
    }
}
