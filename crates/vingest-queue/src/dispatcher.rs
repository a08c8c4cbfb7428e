//! Job dispatcher.
//!
//! Turns completion events into transcode jobs on the work channel. Publish
//! failures are retried with exponential backoff and full jitter. A marker in
//! the idempotency store records each successful publish, so re-dispatching
//! the same session does not enqueue a second message.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info, warn};
use vingest_models::{CompletionEvent, JobId, TranscodeJob};

use crate::channel::WorkChannel;
use crate::config::DispatchConfig;
use crate::error::{QueueError, QueueResult};
use crate::idempotency::IdempotencyStore;
use crate::metrics::{record_dispatch, record_dispatch_retry};

/// Receiver of completion events from the upload side.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Accept the event durably. An error means the event was not accepted
    /// and the caller must retry later.
    async fn submit(&self, event: &CompletionEvent) -> QueueResult<JobId>;
}

/// Result of a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub job_id: JobId,
    /// Message id when this call published; `None` when deduplicated.
    pub message_id: Option<String>,
    pub attempts: u32,
}

impl DispatchOutcome {
    pub fn deduplicated(&self) -> bool {
        self.message_id.is_none()
    }
}

pub struct JobDispatcher {
    channel: Arc<dyn WorkChannel>,
    markers: Arc<dyn IdempotencyStore>,
    config: DispatchConfig,
}

impl JobDispatcher {
    pub fn new(
        channel: Arc<dyn WorkChannel>,
        markers: Arc<dyn IdempotencyStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            channel,
            markers,
            config,
        }
    }

    fn marker_key(job_id: &JobId) -> String {
        format!("dispatch:{}", job_id)
    }

    /// Publish `job` unless a previous publish for the same job id is recorded.
    pub async fn enqueue(&self, job: TranscodeJob) -> QueueResult<DispatchOutcome> {
        let started = Instant::now();
        let marker = Self::marker_key(&job.job_id);

        match self.markers.get(&marker).await {
            Ok(Some(message_id)) => {
                info!(job_id = %job.job_id, message_id = %message_id, "Job already published, skipping");
                record_dispatch("deduplicated", started.elapsed().as_secs_f64());
                return Ok(DispatchOutcome {
                    job_id: job.job_id,
                    message_id: None,
                    attempts: 0,
                });
            }
            Ok(None) => {}
            // Publishing twice is safe, consumers dedupe on job id
            Err(e) => warn!(job_id = %job.job_id, "Marker lookup failed, publishing anyway: {}", e),
        }

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            let message = job.clone().with_attempt(attempt);
            match self.channel.publish(&message).await {
                Ok(message_id) => {
                    if let Err(e) = self
                        .markers
                        .insert_if_absent(&marker, &message_id, self.config.marker_ttl)
                        .await
                    {
                        warn!(job_id = %job.job_id, "Failed to record publish marker: {}", e);
                    }
                    info!(
                        job_id = %job.job_id,
                        session_id = %job.session_id,
                        message_id = %message_id,
                        attempt,
                        "Dispatched transcode job"
                    );
                    record_dispatch("published", started.elapsed().as_secs_f64());
                    return Ok(DispatchOutcome {
                        job_id: job.job_id,
                        message_id: Some(message_id),
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.delay_for_attempt(attempt);
                    warn!(
                        job_id = %job.job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Publish failed, retrying: {}",
                        e
                    );
                    record_dispatch_retry();
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    last_error = e.to_string();
                    if !e.is_retryable() {
                        record_dispatch("failed", started.elapsed().as_secs_f64());
                        return Err(e);
                    }
                    break;
                }
            }
        }

        warn!(job_id = %job.job_id, "Dispatch failed: {}", last_error);
        record_dispatch("failed", started.elapsed().as_secs_f64());
        Err(QueueError::DispatchFailed {
            job_id: job.job_id.to_string(),
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}

#[async_trait]
impl CompletionSink for JobDispatcher {
    async fn submit(&self, event: &CompletionEvent) -> QueueResult<JobId> {
        let outcome = self.enqueue(TranscodeJob::from_completion(event)).await?;
        Ok(outcome.job_id)
    }
}
