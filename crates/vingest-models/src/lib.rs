//! Shared data models for the vingest upload pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Upload sessions and their state machine
//! - Chunks, checksums and acknowledgments
//! - Transcode jobs and completion events
//! - The wire error taxonomy shared by server and client

pub mod chunk;
pub mod error_code;
pub mod job;
pub mod session;

// Re-export common types
pub use chunk::{Checksum, ChecksumError, ChecksumHasher, ChunkAck, ChunkIndex};
pub use error_code::{ErrorBody, ErrorCode};
pub use job::{CompletionEvent, JobId, TranscodeJob, VideoId};
pub use session::{
    expected_chunk_count, ClientMeta, CompletedArtifact, CompletionResult, DispatchState,
    InitSessionRequest, SessionCreated, SessionId, SessionRecord, SessionStatusView, UploadStatus,
};
