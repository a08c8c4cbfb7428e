//! In-process transports.

use std::sync::Arc;

use async_trait::async_trait;
use vingest_models::{
    Checksum, ChunkAck, ChunkIndex, CompletionEvent, CompletionResult, InitSessionRequest, JobId,
    SessionCreated, SessionId, SessionStatusView,
};
use vingest_queue::CompletionSink;
use vingest_upload::UploadSessionManager;

use crate::error::ClientResult;
use crate::service::{DispatchService, UploadService};

/// Calls an [`UploadSessionManager`] in the same process.
#[derive(Clone)]
pub struct LocalUploadService {
    manager: Arc<UploadSessionManager>,
}

impl LocalUploadService {
    pub fn new(manager: Arc<UploadSessionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl UploadService for LocalUploadService {
    async fn init(&self, request: &InitSessionRequest) -> ClientResult<SessionCreated> {
        Ok(self.manager.init_session(request.clone()).await?)
    }

    async fn send_chunk(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        payload: &[u8],
        checksum: &Checksum,
    ) -> ClientResult<ChunkAck> {
        Ok(self
            .manager
            .accept_chunk(session_id, index, payload.to_vec(), checksum.as_str())
            .await?)
    }

    async fn finish(&self, session_id: &SessionId) -> ClientResult<CompletionResult> {
        Ok(self.manager.finish_session(session_id).await?)
    }

    async fn status(&self, session_id: &SessionId) -> ClientResult<SessionStatusView> {
        Ok(self.manager.session_status(session_id).await?)
    }

    async fn abort(&self, session_id: &SessionId) -> ClientResult<SessionStatusView> {
        Ok(self.manager.abort_session(session_id).await?)
    }
}

/// Submits completion events to a sink in the same process.
#[derive(Clone)]
pub struct LocalDispatchService {
    sink: Arc<dyn CompletionSink>,
}

impl LocalDispatchService {
    pub fn new(sink: Arc<dyn CompletionSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl DispatchService for LocalDispatchService {
    async fn dispatch(&self, event: &CompletionEvent) -> ClientResult<JobId> {
        Ok(self.sink.submit(event).await?)
    }
}
