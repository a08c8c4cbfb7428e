//! Delivery handling.
//!
//! One delivery runs through: poison check, ledger claim, transcode with
//! heartbeat, then exactly one of ack, nack or dead-letter.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use vingest_queue::{Delivery, DeliveryHandler, WorkSource};
use vingest_storage::{video_cache_prefix, CacheInvalidator};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::ledger::{ClaimOutcome, JobLedger};
use crate::logging::JobLogger;
use crate::metrics::{record_cache_invalidations, record_job, record_transcode_duration};
use crate::transcoder::{TranscodeOutput, Transcoder};

/// Handles transcode deliveries for every consumer of a pool.
pub struct JobExecutor {
    config: WorkerConfig,
    source: Arc<dyn WorkSource>,
    ledger: Arc<JobLedger>,
    transcoder: Arc<dyn Transcoder>,
    invalidator: Option<Arc<dyn CacheInvalidator>>,
}

impl JobExecutor {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn WorkSource>,
        ledger: Arc<JobLedger>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            config,
            source,
            ledger,
            transcoder,
            invalidator: None,
        }
    }

    /// Drop the video's cached renditions through `invalidator` when a job completes.
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidator = Some(invalidator);
        self
    }

    async fn process(&self, delivery: &Delivery, logger: &JobLogger) {
        let job_id = &delivery.job.job_id;

        if delivery.delivery_count > self.config.max_deliveries {
            let reason = format!("poison message: delivered {} times", delivery.delivery_count);
            logger.log_error(&reason);
            if let Err(e) = self.ledger.dead_letter(job_id, &reason).await {
                logger.log_warning(&format!("Failed to record dead letter in ledger: {}", e));
            }
            self.dead_letter(delivery, &reason, logger).await;
            record_job("poison");
            return;
        }

        let claim = match self.ledger.claim(job_id, &delivery.consumer, Utc::now()).await {
            Ok(claim) => claim,
            Err(e) => {
                logger.log_warning(&format!("Ledger claim failed, returning to queue: {}", e));
                self.nack(delivery, logger).await;
                record_job("error");
                return;
            }
        };

        match claim {
            ClaimOutcome::AlreadyCompleted { outputs } => {
                logger.log_progress(&format!(
                    "duplicate delivery, already completed with {} outputs",
                    outputs.len()
                ));
                self.ack(delivery, logger).await;
                record_job("duplicate");
            }
            ClaimOutcome::DeadLettered { reason } => {
                logger.log_progress(&format!("duplicate delivery of dead-lettered job: {}", reason));
                self.ack(delivery, logger).await;
                record_job("duplicate");
            }
            ClaimOutcome::HeldElsewhere { owner } if delivery.delivery_count <= 1 => {
                logger.log_progress(&format!("in flight on {}, dropping duplicate", owner));
                self.ack(delivery, logger).await;
                record_job("held_elsewhere");
            }
            ClaimOutcome::HeldElsewhere { owner } => {
                // a redelivery means the holder may have died; its lease
                // expires before the visibility timeout hands this back
                logger.log_progress(&format!(
                    "redelivery {} while {} holds the lease, leaving it for the visibility timeout",
                    delivery.delivery_count, owner
                ));
                record_job("held_elsewhere");
            }
            ClaimOutcome::Acquired { attempt } => self.run_claimed(delivery, attempt, logger).await,
        }
    }

    async fn run_claimed(&self, delivery: &Delivery, attempt: u32, logger: &JobLogger) {
        let job = &delivery.job;
        logger.log_start(&format!(
            "video {} attempt {} delivery {}",
            job.video_id, attempt, delivery.delivery_count
        ));

        let started = Instant::now();
        let result = self.transcode_with_heartbeat(delivery, logger).await;
        record_transcode_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(output) => {
                let outputs = output.locations();
                if let Err(e) = self.ledger.complete(&job.job_id, outputs, Utc::now()).await {
                    // outputs exist; a redelivery records them
                    logger.log_error(&format!("Failed to record completion: {}", e));
                    self.nack(delivery, logger).await;
                    record_job("error");
                    return;
                }

                if let Some(invalidator) = &self.invalidator {
                    let reached = invalidator
                        .invalidate_prefix(&video_cache_prefix(&job.video_id))
                        .await;
                    record_cache_invalidations(reached);
                }

                self.ack(delivery, logger).await;
                logger.log_completion(&format!("{} renditions", output.renditions.len()));
                record_job("completed");
            }
            Err(e) if e.is_permanent_failure() => {
                let reason = e.to_string();
                logger.log_error(&format!("Permanent failure: {}", reason));
                self.give_up(delivery, &reason, logger).await;
            }
            Err(e) if attempt >= self.config.max_attempts => {
                let reason = format!("gave up after {} attempts: {}", attempt, e);
                logger.log_error(&reason);
                self.give_up(delivery, &reason, logger).await;
            }
            Err(e) => {
                let message = e.to_string();
                logger.log_warning(&format!(
                    "Attempt {}/{} failed, will retry: {}",
                    attempt, self.config.max_attempts, message
                ));
                if let Err(e) = self
                    .ledger
                    .release(&job.job_id, &delivery.consumer, &message)
                    .await
                {
                    // lease expiry hands the job over instead
                    logger.log_warning(&format!("Failed to release claim: {}", e));
                }
                self.nack(delivery, logger).await;
                record_job("retried");
            }
        }
    }

    /// Run the transcode while renewing the ledger lease and message visibility.
    async fn transcode_with_heartbeat(
        &self,
        delivery: &Delivery,
        logger: &JobLogger,
    ) -> WorkerResult<TranscodeOutput> {
        let timeout = self.config.job_timeout;
        let work = tokio::time::timeout(timeout, self.transcoder.transcode(&delivery.job));
        tokio::pin!(work);

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut work => {
                    return result.unwrap_or_else(|_| Err(WorkerError::Timeout(timeout.as_secs())));
                }
                _ = ticker.tick() => self.heartbeat(delivery, logger).await,
            }
        }
    }

    async fn heartbeat(&self, delivery: &Delivery, logger: &JobLogger) {
        match self
            .ledger
            .renew(&delivery.job.job_id, &delivery.consumer, Utc::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => logger.log_warning("Lease lost to another worker, finishing anyway"),
            Err(e) => logger.log_warning(&format!("Lease renewal failed: {}", e)),
        }
        if let Err(e) = self.source.extend_visibility(delivery).await {
            logger.log_warning(&format!("Visibility extension failed: {}", e));
        }
    }

    async fn give_up(&self, delivery: &Delivery, reason: &str, logger: &JobLogger) {
        if let Err(e) = self.ledger.dead_letter(&delivery.job.job_id, reason).await {
            logger.log_warning(&format!("Failed to record dead letter in ledger: {}", e));
        }
        self.dead_letter(delivery, reason, logger).await;
        record_job("dead_lettered");
    }

    async fn ack(&self, delivery: &Delivery, logger: &JobLogger) {
        if let Err(e) = self.source.ack(delivery).await {
            logger.log_warning(&format!("Ack failed, message will be redelivered: {}", e));
        }
    }

    async fn nack(&self, delivery: &Delivery, logger: &JobLogger) {
        if let Err(e) = self.source.nack(delivery).await {
            logger.log_warning(&format!("Nack failed, waiting for visibility timeout: {}", e));
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str, logger: &JobLogger) {
        if let Err(e) = self.source.dead_letter(delivery, reason).await {
            logger.log_error(&format!("Dead-letter failed: {}", e));
        }
    }
}

#[async_trait]
impl DeliveryHandler for JobExecutor {
    async fn handle(&self, delivery: Delivery) {
        let logger = JobLogger::new(&delivery.job.job_id, "transcode");
        let span = logger.create_span();
        async {
            self.process(&delivery, &logger).await;
        }
        .instrument(span)
        .await;
    }
}
