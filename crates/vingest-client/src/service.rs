//! Remote interfaces the client talks to.

use async_trait::async_trait;
use vingest_models::{
    Checksum, ChunkAck, ChunkIndex, CompletionEvent, CompletionResult, InitSessionRequest, JobId,
    SessionCreated, SessionId, SessionStatusView,
};

use crate::error::ClientResult;

/// Upload service operations as seen by a client.
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn init(&self, request: &InitSessionRequest) -> ClientResult<SessionCreated>;

    async fn send_chunk(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        payload: &[u8],
        checksum: &Checksum,
    ) -> ClientResult<ChunkAck>;

    async fn finish(&self, session_id: &SessionId) -> ClientResult<CompletionResult>;

    async fn status(&self, session_id: &SessionId) -> ClientResult<SessionStatusView>;

    async fn abort(&self, session_id: &SessionId) -> ClientResult<SessionStatusView>;
}

/// Dispatcher operations as seen by a client.
#[async_trait]
pub trait DispatchService: Send + Sync {
    async fn dispatch(&self, event: &CompletionEvent) -> ClientResult<JobId>;
}
