//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Transcode failed: {0}")]
    TranscodeFailed(String),

    /// Input that no retry can fix (corrupt or unsupported source)
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("Job timed out after {0} seconds")]
    Timeout(u64),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Storage error: {0}")]
    Storage(#[from] vingest_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] vingest_queue::QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn transcode_failed(msg: impl Into<String>) -> Self {
        Self::TranscodeFailed(msg.into())
    }

    pub fn invalid_source(msg: impl Into<String>) -> Self {
        Self::InvalidSource(msg.into())
    }

    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Failures where retrying cannot help; the job goes straight to the DLQ.
    pub fn is_permanent_failure(&self) -> bool {
        match self {
            WorkerError::InvalidSource(_)
            | WorkerError::FfmpegNotFound
            | WorkerError::ConfigError(_) => true,
            WorkerError::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !self.is_permanent_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(WorkerError::invalid_source("bad header").is_permanent_failure());
        assert!(WorkerError::FfmpegNotFound.is_permanent_failure());
        assert!(WorkerError::transcode_failed("exit 1").is_retryable());
        assert!(WorkerError::Timeout(60).is_retryable());
    }
}
