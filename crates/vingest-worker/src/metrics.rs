//! Worker metrics.

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Deliveries handled, by outcome.
    pub const JOBS_TOTAL: &str = "vingest_worker_jobs_total";

    /// Transcode wall time in seconds.
    pub const TRANSCODE_DURATION_SECONDS: &str = "vingest_worker_transcode_duration_seconds";

    /// API processes told to drop a video's cached renditions after a completed job.
    pub const CACHE_INVALIDATIONS_TOTAL: &str = "vingest_worker_cache_invalidations_total";
}

/// Outcomes: completed, duplicate, held_elsewhere, retried, dead_lettered, poison, error.
pub fn record_job(outcome: &'static str) {
    counter!(names::JOBS_TOTAL, "outcome" => outcome).increment(1);
}

pub fn record_transcode_duration(seconds: f64) {
    histogram!(names::TRANSCODE_DURATION_SECONDS).record(seconds);
}

pub fn record_cache_invalidations(count: usize) {
    counter!(names::CACHE_INVALIDATIONS_TOTAL).increment(count as u64);
}
