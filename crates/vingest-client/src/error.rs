//! Client error types.

use std::time::Duration;

use thiserror::Error;
use vingest_models::{ChunkIndex, ErrorBody, ErrorCode};

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The service answered with a classified error.
    #[error("{code}: {detail}")]
    Service {
        code: ErrorCode,
        detail: String,
        missing_indices: Option<Vec<ChunkIndex>>,
    },

    /// The request never reached the service.
    #[error("Connection failed: {0}")]
    Transport(String),

    /// The request may or may not have been processed.
    #[error("Request interrupted: {0}")]
    Interrupted(String),

    #[error("{operation} timed out after {timeout:?}")]
    DeadlineExceeded {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Circuit open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Local input error: {0}")]
    Input(String),
}

impl ClientError {
    pub fn service(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Service {
            code,
            detail: detail.into(),
            missing_indices: None,
        }
    }

    /// Wire code this error is classified as.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Service { code, .. } => *code,
            ClientError::Transport(_) | ClientError::Decode(_) => ErrorCode::Transient,
            ClientError::Interrupted(_) | ClientError::DeadlineExceeded { .. } => {
                ErrorCode::DeadlineExceeded
            }
            ClientError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            ClientError::Input(_) => ErrorCode::InvalidArgument,
        }
    }

    /// Whether the dependency misbehaved, as opposed to a business answer.
    pub fn is_dependency_failure(&self) -> bool {
        self.code().is_dependency_failure()
    }

    pub fn missing_indices(&self) -> Option<&[ChunkIndex]> {
        match self {
            ClientError::Service {
                missing_indices: Some(missing),
                ..
            } => Some(missing),
            _ => None,
        }
    }
}

impl From<ErrorBody> for ClientError {
    fn from(body: ErrorBody) -> Self {
        Self::Service {
            code: body.code,
            detail: body.detail,
            missing_indices: body.missing_indices,
        }
    }
}

impl From<vingest_upload::UploadError> for ClientError {
    fn from(err: vingest_upload::UploadError) -> Self {
        Self::Service {
            code: err.code(),
            missing_indices: err.missing_indices().map(<[ChunkIndex]>::to_vec),
            detail: err.to_string(),
        }
    }
}

impl From<vingest_queue::QueueError> for ClientError {
    fn from(err: vingest_queue::QueueError) -> Self {
        Self::service(err.code(), err.to_string())
    }
}
