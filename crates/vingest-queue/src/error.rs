//! Queue error types.

use thiserror::Error;
use vingest_models::ErrorCode;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Dequeue failed: {0}")]
    DequeueFailed(String),

    #[error("Delivery not found: {0}")]
    DeliveryNotFound(String),

    /// The delivery was handed to another consumer after its visibility timeout
    #[error("Lease lost: {0}")]
    LeaseLost(String),

    #[error("Dispatch of {job_id} failed after {attempts} attempts: {last_error}")]
    DispatchFailed {
        job_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Idempotency store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn publish_failed(msg: impl Into<String>) -> Self {
        Self::PublishFailed(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn lease_lost(delivery_id: &str, consumer: &str) -> Self {
        Self::LeaseLost(format!("{} no longer held by {}", delivery_id, consumer))
    }

    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::DispatchFailed { .. } => ErrorCode::DispatchFailed,
            QueueError::DeliveryNotFound(_) => ErrorCode::NotFound,
            QueueError::LeaseLost(_) => ErrorCode::Conflict,
            QueueError::Json(_) => ErrorCode::Invalid,
            _ => ErrorCode::Transient,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::ConnectionFailed(_)
                | QueueError::PublishFailed(_)
                | QueueError::DequeueFailed(_)
                | QueueError::Store(_)
                | QueueError::Redis(_)
        )
    }
}
