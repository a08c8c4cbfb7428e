//! Error taxonomy shared across the wire.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::chunk::ChunkIndex;

/// Machine-readable error classification.
///
/// Servers put this in every error body; the client uses it to decide
/// between retrying and surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed request. Never retried.
    InvalidArgument,
    /// Unknown session or chunk. Never retried.
    NotFound,
    /// State precondition violated. Never retried.
    Conflict,
    /// Checksum mismatch. The caller resends the same chunk.
    Invalid,
    /// Chunks missing. The caller resends the listed indices.
    Incomplete,
    /// Connection failure or overload. Safe to retry with backoff.
    Transient,
    /// Call exceeded its deadline.
    DeadlineExceeded,
    /// Dispatch retries exhausted; the sweep re-attempts.
    DispatchFailed,
    /// Client-side breaker is open.
    CircuitOpen,
    /// Unrecoverable storage failure; fatal to the session.
    StorageError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::Invalid => "invalid",
            ErrorCode::Incomplete => "incomplete",
            ErrorCode::Transient => "transient",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::DispatchFailed => "dispatch_failed",
            ErrorCode::CircuitOpen => "circuit_open",
            ErrorCode::StorageError => "storage_error",
        }
    }

    /// Errors that indicate the remote side is unhealthy (as opposed to a
    /// well-formed rejection of this particular request).
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            ErrorCode::Transient
                | ErrorCode::DeadlineExceeded
                | ErrorCode::DispatchFailed
                | ErrorCode::StorageError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON error body used by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorBody {
    pub detail: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_indices: Option<Vec<ChunkIndex>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_names() {
        let json = serde_json::to_string(&ErrorCode::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline_exceeded\"");
        for code in [ErrorCode::Incomplete, ErrorCode::CircuitOpen, ErrorCode::StorageError] {
            let encoded = serde_json::to_string(&code).unwrap();
            assert_eq!(encoded, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_business_errors_are_not_dependency_failures() {
        assert!(!ErrorCode::NotFound.is_dependency_failure());
        assert!(!ErrorCode::Incomplete.is_dependency_failure());
        assert!(ErrorCode::Transient.is_dependency_failure());
    }
}
