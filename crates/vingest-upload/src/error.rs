//! Upload error types.

use thiserror::Error;
use vingest_models::{ChunkIndex, ErrorCode, SessionId, UploadStatus};
use vingest_storage::StorageError;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session {session_id} is {status}")]
    Conflict {
        session_id: SessionId,
        status: UploadStatus,
    },

    #[error("Verification failed: {0}")]
    Invalid(String),

    #[error("Upload incomplete, {} chunks missing", missing.len())]
    Incomplete { missing: Vec<ChunkIndex> },

    /// Another request is writing the same chunk right now
    #[error("Chunk {index} is being written, retry shortly")]
    Busy { index: ChunkIndex },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl UploadError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn conflict(session_id: &SessionId, status: UploadStatus) -> Self {
        Self::Conflict {
            session_id: session_id.clone(),
            status,
        }
    }

    /// Wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            UploadError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            UploadError::NotFound(_) => ErrorCode::NotFound,
            UploadError::Conflict { .. } => ErrorCode::Conflict,
            UploadError::Invalid(_) => ErrorCode::Invalid,
            UploadError::Incomplete { .. } => ErrorCode::Incomplete,
            UploadError::Busy { .. } => ErrorCode::Transient,
            UploadError::Storage(_) => ErrorCode::StorageError,
        }
    }

    /// Missing chunk indices for `Incomplete`.
    pub fn missing_indices(&self) -> Option<&[ChunkIndex]> {
        match self {
            UploadError::Incomplete { missing } => Some(missing),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            UploadError::Incomplete { missing: vec![9] }.code(),
            ErrorCode::Incomplete
        );
        assert_eq!(UploadError::Busy { index: 1 }.code(), ErrorCode::Transient);
        assert_eq!(
            UploadError::Storage(StorageError::write_failed("disk full")).code(),
            ErrorCode::StorageError
        );
        assert_eq!(
            UploadError::conflict(&SessionId::from("s"), UploadStatus::Completed).to_string(),
            "Session s is completed"
        );
    }

    #[test]
    fn test_missing_indices_only_for_incomplete() {
        let err = UploadError::Incomplete { missing: vec![3, 7] };
        assert_eq!(err.missing_indices(), Some(&[3, 7][..]));
        assert!(UploadError::invalid("x").missing_indices().is_none());
    }
}
