//! Transcode job and completion event definitions.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::chunk::Checksum;
use crate::session::SessionId;

/// Unique identifier for a video produced by an upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VideoId(pub String);

impl VideoId {
    /// Generate a new random video ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for VideoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a transcode job.
///
/// Always derived from the session ID, so every dispatch of the same
/// upload carries the same job ID and consumers can dedupe on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Deterministic job ID for an upload session.
    pub fn for_session(session_id: &SessionId) -> Self {
        let digest = format!("{:x}", Sha256::digest(session_id.as_str().as_bytes()));
        Self(format!("transcode-{}", &digest[..32]))
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Event emitted exactly once when a session completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CompletionEvent {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub artifact_location: String,
    pub checksum: Checksum,
    pub size_bytes: u64,
}

/// Message placed on the work channel for a transcoding worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TranscodeJob {
    pub job_id: JobId,
    pub video_id: VideoId,
    pub session_id: SessionId,
    /// Location of the assembled source artifact
    pub source_location: String,
    pub checksum: Checksum,
    pub size_bytes: u64,
    pub enqueued_at: DateTime<Utc>,
    /// Dispatch attempt that produced this message (1-based)
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

impl TranscodeJob {
    /// Build the job for a completion event.
    pub fn from_completion(event: &CompletionEvent) -> Self {
        Self {
            job_id: JobId::for_session(&event.session_id),
            video_id: event.video_id.clone(),
            session_id: event.session_id.clone(),
            source_location: event.artifact_location.clone(),
            checksum: event.checksum.clone(),
            size_bytes: event.size_bytes,
            enqueued_at: Utc::now(),
            attempt: default_attempt(),
        }
    }

    /// Set the dispatch attempt.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Key used for publish-side and consume-side deduplication.
    pub fn idempotency_key(&self) -> String {
        format!("transcode:{}", self.job_id)
    }
}
