//! Upload session models.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;
use validator::Validate;

use crate::chunk::{Checksum, ChunkIndex};
use crate::job::{JobId, VideoId};

/// Opaque identifier of a resumable upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID.
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

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Upload session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Created, no chunk accepted yet
    #[default]
    Initialized,
    /// At least one chunk accepted
    InProgress,
    /// Chunks are being concatenated into the artifact
    Assembling,
    /// Artifact written and verified
    Completed,
    /// Aborted or assembly failed; must be recreated
    Failed,
    /// Abandoned past its TTL
    Expired,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Initialized => "initialized",
            UploadStatus::InProgress => "in_progress",
            UploadStatus::Assembling => "assembling",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Completed | UploadStatus::Failed | UploadStatus::Expired
        )
    }

    /// Whether the session still accepts chunks.
    pub fn is_receiving(&self) -> bool {
        matches!(self, UploadStatus::Initialized | UploadStatus::InProgress)
    }

    /// Allowed edges of the state machine. Everything else is a conflict.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Initialized, InProgress)
                | (Initialized, Assembling)
                | (InProgress, Assembling)
                | (Assembling, Completed)
                | (Assembling, Failed)
                | (Initialized, Failed)
                | (InProgress, Failed)
                | (Initialized, Expired)
                | (InProgress, Expired)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of chunks needed to cover `total_size` bytes.
pub fn expected_chunk_count(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

/// Free-form client metadata carried with the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct ClientMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(min = 1, max = 255))]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 255))]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 127))]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(length(max = 255))]
    pub uploader_id: Option<String>,
}

/// Body of an init request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct InitSessionRequest {
    #[validate(range(min = 1))]
    pub total_size: u64,
    #[validate(range(min = 1))]
    pub chunk_size: u64,
    /// Optional SHA-256 of the whole file, verified after assembly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_checksum: Option<String>,
    #[serde(default)]
    #[validate(nested)]
    pub client_meta: ClientMeta,
}

impl InitSessionRequest {
    pub fn new(total_size: u64, chunk_size: u64) -> Self {
        Self {
            total_size,
            chunk_size,
            file_checksum: None,
            client_meta: ClientMeta::default(),
        }
    }

    pub fn with_file_checksum(mut self, checksum: &Checksum) -> Self {
        self.file_checksum = Some(checksum.to_string());
        self
    }

    pub fn with_client_meta(mut self, meta: ClientMeta) -> Self {
        self.client_meta = meta;
        self
    }
}

/// Response to a successful init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SessionCreated {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub total_size: u64,
    pub chunk_size: u64,
    pub expected_chunk_count: u32,
    pub expires_at: DateTime<Utc>,
}

/// Where a completed session stands with respect to the job dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DispatchState {
    /// Session not completed yet
    #[default]
    NotReady,
    /// Completion event not yet accepted; the sweep retries
    Pending {
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    /// Job published to the work channel
    Dispatched { job_id: JobId },
}

impl DispatchState {
    pub fn is_pending(&self) -> bool {
        matches!(self, DispatchState::Pending { .. })
    }
}

/// Outcome of a successful finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CompletionResult {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub artifact_location: String,
    pub checksum: Checksum,
    pub size_bytes: u64,
    pub completed_at: DateTime<Utc>,
    pub dispatch: DispatchState,
    /// True when finish was called again on an already completed session
    #[serde(default)]
    pub already_completed: bool,
}

/// Resume view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub status: UploadStatus,
    pub total_size: u64,
    pub chunk_size: u64,
    pub expected_chunk_count: u32,
    pub received_chunks: u32,
    pub missing_indices: Vec<ChunkIndex>,
    pub progress_percent: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub dispatch: DispatchState,
    #[serde(default)]
    pub client_meta: ClientMeta,
}

/// Artifact produced by a successful assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedArtifact {
    pub location: String,
    pub checksum: Checksum,
    pub size_bytes: u64,
    pub completed_at: DateTime<Utc>,
}

/// Durable snapshot of a session, written on every state change.
///
/// Only committed chunk indices are recorded; writes still in flight when
/// the process stops are simply re-sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub total_size: u64,
    pub chunk_size: u64,
    pub expected_chunk_count: u32,
    pub status: UploadStatus,
    #[serde(default)]
    pub received: BTreeSet<ChunkIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_checksum: Option<Checksum>,
    #[serde(default)]
    pub client_meta: ClientMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub dispatch: DispatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<CompletedArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}
