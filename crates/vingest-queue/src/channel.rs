//! Work channel contract.

use std::time::Duration;

use async_trait::async_trait;
use vingest_models::TranscodeJob;

use crate::error::QueueResult;

/// One delivery of a job to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-specific message id
    pub delivery_id: String,
    /// Consumer that currently holds the message
    pub consumer: String,
    pub job: TranscodeJob,
    /// How many times this message has been handed out, including this one
    pub delivery_count: u32,
}

/// Publish side of the work channel.
#[async_trait]
pub trait WorkChannel: Send + Sync {
    /// Publish a job durably. Returns the message id.
    async fn publish(&self, job: &TranscodeJob) -> QueueResult<String>;
}

/// Consume side of the work channel.
///
/// Messages are at-least-once: a delivery that is neither acked nor
/// dead-lettered becomes visible again after the visibility timeout.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Receive up to `max` deliveries, waiting at most `wait` for the first one.
    async fn poll(&self, consumer: &str, max: usize, wait: Duration) -> QueueResult<Vec<Delivery>>;

    /// Remove the message permanently.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Make the message visible again right away.
    async fn nack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Move the message to the dead letter queue and remove it.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> QueueResult<()>;

    /// Restart the visibility timeout for a message still being processed.
    async fn extend_visibility(&self, delivery: &Delivery) -> QueueResult<()>;
}
