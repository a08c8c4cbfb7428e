//! Per-session state guarded by the session lock.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use vingest_models::{
    Checksum, ChunkAck, ChunkIndex, ClientMeta, CompletedArtifact, CompletionResult,
    DispatchState, SessionId, SessionRecord, SessionStatusView, UploadStatus, VideoId,
};

#[derive(Debug)]
pub(crate) struct UploadSession {
    pub session_id: SessionId,
    pub video_id: VideoId,
    pub total_size: u64,
    pub chunk_size: u64,
    pub expected_chunk_count: u32,
    pub status: UploadStatus,
    /// Indices whose payload is durably stored and verified
    pub received: BTreeSet<ChunkIndex>,
    /// Indices reserved by a write that has not committed yet
    pub in_flight: HashSet<ChunkIndex>,
    pub file_checksum: Option<Checksum>,
    pub client_meta: ClientMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub dispatch: DispatchState,
    /// Set while a completion event is being submitted
    pub dispatching: bool,
    pub artifact: Option<CompletedArtifact>,
    pub failure: Option<String>,
}

impl UploadSession {
    /// Rebuild from a stored snapshot. Nothing is in flight after a reload.
    pub fn from_record(record: SessionRecord) -> Self {
        Self {
            session_id: record.session_id,
            video_id: record.video_id,
            total_size: record.total_size,
            chunk_size: record.chunk_size,
            expected_chunk_count: record.expected_chunk_count,
            status: record.status,
            received: record.received,
            in_flight: HashSet::new(),
            file_checksum: record.file_checksum,
            client_meta: record.client_meta,
            created_at: record.created_at,
            updated_at: record.updated_at,
            expires_at: record.expires_at,
            dispatch: record.dispatch,
            dispatching: false,
            artifact: record.artifact,
            failure: record.failure,
        }
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            video_id: self.video_id.clone(),
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            expected_chunk_count: self.expected_chunk_count,
            status: self.status,
            received: self.received.clone(),
            file_checksum: self.file_checksum.clone(),
            client_meta: self.client_meta.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            dispatch: self.dispatch.clone(),
            artifact: self.artifact.clone(),
            failure: self.failure.clone(),
        }
    }

    /// Exact byte length required for `index`.
    pub fn expected_len(&self, index: ChunkIndex) -> u64 {
        let start = index as u64 * self.chunk_size;
        self.chunk_size.min(self.total_size.saturating_sub(start))
    }

    pub fn missing_indices(&self) -> Vec<ChunkIndex> {
        (0..self.expected_chunk_count)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Move to `next` if the edge exists; returns false otherwise.
    pub fn transition(&mut self, next: UploadStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    pub fn ack(&self, index: ChunkIndex, duplicate: bool) -> ChunkAck {
        ChunkAck {
            session_id: self.session_id.clone(),
            index,
            received: self.received_count(),
            expected: self.expected_chunk_count,
            duplicate,
            missing_indices: self.missing_indices(),
        }
    }

    pub fn completion_result(&self, already_completed: bool) -> Option<CompletionResult> {
        let artifact = self.artifact.as_ref()?;
        Some(CompletionResult {
            session_id: self.session_id.clone(),
            video_id: self.video_id.clone(),
            artifact_location: artifact.location.clone(),
            checksum: artifact.checksum.clone(),
            size_bytes: artifact.size_bytes,
            completed_at: artifact.completed_at,
            dispatch: self.dispatch.clone(),
            already_completed,
        })
    }

    pub fn status_view(&self) -> SessionStatusView {
        let received = self.received_count();
        let progress_percent = if self.expected_chunk_count == 0 {
            0.0
        } else {
            (received as f64 / self.expected_chunk_count as f64 * 10_000.0).round() / 100.0
        };
        SessionStatusView {
            session_id: self.session_id.clone(),
            video_id: self.video_id.clone(),
            status: self.status,
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            expected_chunk_count: self.expected_chunk_count,
            received_chunks: received,
            missing_indices: self.missing_indices(),
            progress_percent,
            created_at: self.created_at,
            expires_at: self.expires_at,
            dispatch: self.dispatch.clone(),
            client_meta: self.client_meta.clone(),
        }
    }
}
