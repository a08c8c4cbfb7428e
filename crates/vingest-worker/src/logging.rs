//! Structured job logging utilities.
//!
//! Every line a worker writes about a job carries the same `job_id` and
//! `operation` fields, so one job's lifecycle can be filtered out of the
//! interleaved output of all consumers in a pool.

use tracing::{error, info, warn, Span};
use vingest_models::JobId;

/// Job logger for structured lifecycle events.
///
/// Cheap to clone; the executor creates one per delivery and passes it down
/// to the claim, transcode and settle steps.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
}

impl JobLogger {
    /// Create a logger for `job_id`.
    ///
    /// # Arguments
    /// * `job_id` - The job the events belong to
    /// * `operation` - What is being done to it (e.g. "transcode")
    pub fn new(job_id: &JobId, operation: &str) -> Self {
        Self::from_string(job_id.to_string(), operation)
    }

    /// Create a logger from a job id string.
    pub fn from_string(job_id: impl Into<String>, operation: &str) -> Self {
        Self {
            job_id: job_id.into(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a job operation.
    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    /// Log a progress update, including duplicate-delivery decisions.
    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    /// Log a recoverable problem; the job carries on or is retried.
    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    /// Log a failure that ends this attempt.
    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job operation.
    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    /// Get the job ID.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the operation type.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this job.
    ///
    /// Instrumenting the whole delivery with it attaches the job fields to
    /// events logged by lower layers (ledger, queue, storage) as well.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation
        )
    }
}
