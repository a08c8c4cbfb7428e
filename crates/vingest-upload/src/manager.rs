//! Upload session manager.
//!
//! Owns the resumable-upload state machine:
//!
//! ```text
//! Initialized -> InProgress -> Assembling -> Completed
//!      |             |              \-> Failed
//!      +-------------+--> Failed (abort) / Expired (ttl)
//! ```
//!
//! Every session has its own lock; the table lock is only taken to look up,
//! insert or purge entries. The table is a cache over the session store:
//! each state change is written through while the session lock is held, and
//! sessions missing from the table are loaded from the store on demand.
//! Chunk payloads are written with no lock held: the index is reserved as
//! in-flight first and committed once the store has accepted the bytes. Assembly and dispatch also run unlocked, with the
//! session parked in `Assembling` while the artifact is written.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use validator::Validate;
use vingest_models::{
    expected_chunk_count, Checksum, ChecksumHasher, ChunkAck, ChunkIndex, CompletionEvent,
    CompletedArtifact, CompletionResult, DispatchState, InitSessionRequest, SessionCreated,
    SessionId, SessionRecord, SessionStatusView, UploadStatus, VideoId,
};
use vingest_queue::CompletionSink;
use vingest_storage::{
    ArtifactStore, ArtifactWriter, ChunkStore, MemorySessionStore, SessionStore, StorageResult,
};

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::metrics::{record_assembly, record_chunk, record_session_created, record_session_finished};
use crate::session::UploadSession;

type SessionHandle = Arc<Mutex<UploadSession>>;

pub struct UploadSessionManager {
    config: UploadConfig,
    chunks: Arc<dyn ChunkStore>,
    artifacts: Arc<dyn ArtifactStore>,
    sink: Arc<dyn CompletionSink>,
    store: Arc<dyn SessionStore>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl UploadSessionManager {
    pub fn new(
        config: UploadConfig,
        chunks: Arc<dyn ChunkStore>,
        artifacts: Arc<dyn ArtifactStore>,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        Self {
            config,
            chunks,
            artifacts,
            sink,
            store: Arc::new(MemorySessionStore::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Keep session metadata in `store` instead of process memory.
    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Number of sessions currently tracked, terminal ones included.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn handle(&self, session_id: &SessionId) -> UploadResult<SessionHandle> {
        if let Some(handle) = self.sessions.read().await.get(session_id).cloned() {
            return Ok(handle);
        }
        let record = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(session_id.clone()))?;
        Ok(self.adopt(record).await)
    }

    /// Every session, including stored ones this process has not touched yet.
    async fn handles(&self) -> Vec<SessionHandle> {
        match self.store.list().await {
            Ok(records) => {
                let known: HashSet<SessionId> = self.sessions.read().await.keys().cloned().collect();
                for record in records {
                    if !known.contains(&record.session_id) {
                        self.adopt(record).await;
                    }
                }
            }
            Err(e) => warn!("Failed to list stored sessions, sweeping cached ones only: {}", e),
        }
        self.sessions.read().await.values().cloned().collect()
    }

    /// Install a stored session in the table.
    ///
    /// A record left in `Assembling` belongs to an assembly that died with a
    /// previous process; it is failed and its chunks are released.
    async fn adopt(&self, record: SessionRecord) -> SessionHandle {
        let session_id = record.session_id.clone();
        let interrupted = record.status == UploadStatus::Assembling;
        let handle = {
            let mut sessions = self.sessions.write().await;
            if let Some(existing) = sessions.get(&session_id) {
                return existing.clone();
            }
            let handle = Arc::new(Mutex::new(UploadSession::from_record(record)));
            sessions.insert(session_id.clone(), handle.clone());
            handle
        };
        debug!(session_id = %session_id, "Loaded upload session from store");

        if interrupted {
            let cause = UploadError::invalid("assembly interrupted by a restart");
            self.fail_session(&handle, &session_id, &cause).await;
        }
        handle
    }

    /// Write the session snapshot through to the store.
    async fn persist(&self, session: &UploadSession) -> StorageResult<()> {
        self.store.put(&session.to_record()).await
    }

    /// Write through where the in-memory state must win anyway; the next
    /// change of the same session writes the full snapshot again.
    async fn persist_or_warn(&self, session: &UploadSession) {
        if let Err(e) = self.persist(session).await {
            warn!(
                session_id = %session.session_id,
                status = %session.status,
                "Failed to persist upload session: {}",
                e
            );
        }
    }

    /// Open a new upload session.
    pub async fn init_session(&self, request: InitSessionRequest) -> UploadResult<SessionCreated> {
        request
            .validate()
            .map_err(|e| UploadError::invalid_argument(e.to_string()))?;

        if request.chunk_size > self.config.max_chunk_size {
            return Err(UploadError::invalid_argument(format!(
                "chunk_size {} exceeds maximum {}",
                request.chunk_size, self.config.max_chunk_size
            )));
        }
        if request.total_size > self.config.max_total_size {
            return Err(UploadError::invalid_argument(format!(
                "total_size {} exceeds maximum {}",
                request.total_size, self.config.max_total_size
            )));
        }
        let count = expected_chunk_count(request.total_size, request.chunk_size);
        if count > self.config.max_chunk_count as u64 {
            return Err(UploadError::invalid_argument(format!(
                "upload needs {} chunks, maximum is {}",
                count, self.config.max_chunk_count
            )));
        }
        let file_checksum = request
            .file_checksum
            .as_deref()
            .map(Checksum::parse)
            .transpose()
            .map_err(|e| UploadError::invalid_argument(format!("file_checksum: {}", e)))?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .map_err(|e| UploadError::invalid_argument(format!("session ttl: {}", e)))?;

        let session = UploadSession {
            session_id: SessionId::new(),
            video_id: VideoId::new(),
            total_size: request.total_size,
            chunk_size: request.chunk_size,
            expected_chunk_count: count as u32,
            status: UploadStatus::Initialized,
            received: BTreeSet::new(),
            in_flight: HashSet::new(),
            file_checksum,
            client_meta: request.client_meta,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            dispatch: DispatchState::NotReady,
            dispatching: false,
            artifact: None,
            failure: None,
        };

        let created = SessionCreated {
            session_id: session.session_id.clone(),
            video_id: session.video_id.clone(),
            total_size: session.total_size,
            chunk_size: session.chunk_size,
            expected_chunk_count: session.expected_chunk_count,
            expires_at: session.expires_at,
        };

        self.persist(&session).await?;
        self.sessions
            .write()
            .await
            .insert(created.session_id.clone(), Arc::new(Mutex::new(session)));

        info!(
            session_id = %created.session_id,
            video_id = %created.video_id,
            total_size = created.total_size,
            chunk_size = created.chunk_size,
            expected_chunks = created.expected_chunk_count,
            "Upload session created"
        );
        record_session_created();
        Ok(created)
    }

    /// Verify and store one chunk.
    pub async fn accept_chunk(
        &self,
        session_id: &SessionId,
        index: ChunkIndex,
        payload: Vec<u8>,
        checksum: &str,
    ) -> UploadResult<ChunkAck> {
        let handle = self.handle(session_id).await?;
        let expected = Checksum::parse(checksum)
            .map_err(|e| UploadError::invalid_argument(format!("checksum: {}", e)))?;
        let checksum_ok = expected.verify(&payload);

        // Validate and reserve the index
        {
            let mut session = handle.lock().await;
            if !session.status.is_receiving() {
                record_chunk("rejected", payload.len());
                return Err(UploadError::conflict(session_id, session.status));
            }
            if index >= session.expected_chunk_count {
                record_chunk("rejected", payload.len());
                return Err(UploadError::invalid_argument(format!(
                    "chunk index {} out of range 0..{}",
                    index, session.expected_chunk_count
                )));
            }
            let expected_len = session.expected_len(index);
            if payload.len() as u64 != expected_len {
                record_chunk("rejected", payload.len());
                return Err(UploadError::invalid_argument(format!(
                    "chunk {} must be {} bytes, got {}",
                    index,
                    expected_len,
                    payload.len()
                )));
            }
            if !checksum_ok {
                warn!(session_id = %session_id, index, "Chunk checksum mismatch");
                record_chunk("rejected", payload.len());
                return Err(UploadError::invalid(format!(
                    "checksum mismatch for chunk {}",
                    index
                )));
            }
            if session.received.contains(&index) {
                debug!(session_id = %session_id, index, "Duplicate chunk ignored");
                record_chunk("duplicate", payload.len());
                return Ok(session.ack(index, true));
            }
            if !session.in_flight.insert(index) {
                return Err(UploadError::Busy { index });
            }
        }

        let bytes = payload.len();
        if let Err(e) = self.chunks.put(session_id, index, payload).await {
            handle.lock().await.in_flight.remove(&index);
            error!(session_id = %session_id, index, "Failed to store chunk: {}", e);
            return Err(UploadError::Storage(e));
        }

        // Commit
        let outcome = {
            let mut session = handle.lock().await;
            session.in_flight.remove(&index);
            if session.status.is_receiving() {
                let (status, updated_at) = (session.status, session.updated_at);
                session.received.insert(index);
                if session.status == UploadStatus::Initialized {
                    session.transition(UploadStatus::InProgress);
                } else {
                    session.updated_at = Utc::now();
                }
                match self.persist(&session).await {
                    Ok(()) => Ok(session.ack(index, false)),
                    Err(e) => {
                        // not committed; the stored bytes are overwritten on resend
                        session.received.remove(&index);
                        session.status = status;
                        session.updated_at = updated_at;
                        Err(UploadError::Storage(e))
                    }
                }
            } else {
                Err(UploadError::conflict(session_id, session.status))
            }
        };

        match outcome {
            Ok(ack) => {
                debug!(
                    session_id = %session_id,
                    index,
                    received = ack.received,
                    expected = ack.expected,
                    "Chunk accepted"
                );
                record_chunk("accepted", bytes);
                Ok(ack)
            }
            Err(e @ UploadError::Conflict { .. }) => {
                // Aborted or expired while the write was in flight
                warn!(session_id = %session_id, index, "Session closed during chunk write, releasing storage");
                self.release_chunks(session_id).await;
                Err(e)
            }
            Err(e) => {
                error!(session_id = %session_id, index, "Failed to commit chunk: {}", e);
                Err(e)
            }
        }
    }

    /// Assemble a fully uploaded session and hand it to the completion sink.
    pub async fn finish_session(&self, session_id: &SessionId) -> UploadResult<CompletionResult> {
        let handle = self.handle(session_id).await?;

        let (video_id, total_size, count, file_checksum) = {
            let mut session = handle.lock().await;
            match session.status {
                UploadStatus::Completed => {
                    return session
                        .completion_result(true)
                        .ok_or_else(|| UploadError::conflict(session_id, session.status));
                }
                status if !status.is_receiving() => {
                    return Err(UploadError::conflict(session_id, status));
                }
                _ => {}
            }
            let missing = session.missing_indices();
            if !missing.is_empty() {
                info!(session_id = %session_id, missing = missing.len(), "Finish rejected, chunks missing");
                return Err(UploadError::Incomplete { missing });
            }
            session.transition(UploadStatus::Assembling);
            self.persist_or_warn(&session).await;
            (
                session.video_id.clone(),
                session.total_size,
                session.expected_chunk_count,
                session.file_checksum.clone(),
            )
        };

        info!(session_id = %session_id, chunks = count, "Assembling upload");
        let started = Instant::now();
        let key = format!("{}/{}/source.bin", self.config.artifact_prefix, video_id);

        let assembled = self.assemble(session_id, &key, count).await;
        let (writer, checksum, size) = match assembled {
            Ok(parts) => parts,
            Err(e) => {
                self.fail_session(&handle, session_id, &e).await;
                return Err(e);
            }
        };

        let verification = if size != total_size {
            Err(UploadError::invalid(format!(
                "assembled {} bytes, expected {}",
                size, total_size
            )))
        } else {
            match &file_checksum {
                Some(expected) if *expected != checksum => Err(UploadError::invalid(format!(
                    "file checksum mismatch: expected {}, got {}",
                    expected, checksum
                ))),
                _ => Ok(()),
            }
        };
        if let Err(e) = verification {
            writer.abort().await;
            self.fail_session(&handle, session_id, &e).await;
            return Err(e);
        }

        let location = match writer.finish().await {
            Ok(location) => location,
            Err(e) => {
                let e = UploadError::Storage(e);
                self.fail_session(&handle, session_id, &e).await;
                return Err(e);
            }
        };
        record_assembly(started.elapsed().as_secs_f64());

        {
            let mut session = handle.lock().await;
            session.artifact = Some(CompletedArtifact {
                location: location.clone(),
                checksum: checksum.clone(),
                size_bytes: size,
                completed_at: Utc::now(),
            });
            session.dispatch = DispatchState::Pending {
                attempts: 0,
                last_error: None,
            };
            session.dispatching = true;
            session.transition(UploadStatus::Completed);
            self.persist_or_warn(&session).await;
        }
        info!(session_id = %session_id, location = %location, size, "Upload completed");
        record_session_finished("completed");

        self.release_chunks(session_id).await;

        let event = CompletionEvent {
            session_id: session_id.clone(),
            video_id,
            artifact_location: location,
            checksum,
            size_bytes: size,
        };
        self.dispatch(&handle, &event, 0).await;

        let session = handle.lock().await;
        session
            .completion_result(false)
            .ok_or_else(|| UploadError::conflict(session_id, session.status))
    }

    /// Concatenate chunks in index order while hashing.
    async fn assemble(
        &self,
        session_id: &SessionId,
        key: &str,
        count: u32,
    ) -> UploadResult<(Box<dyn ArtifactWriter>, Checksum, u64)> {
        let mut writer = self.artifacts.create(key).await?;
        let mut hasher = ChecksumHasher::new();

        for index in 0..count {
            let step = match self.chunks.get(session_id, index).await {
                Ok(data) => {
                    hasher.update(&data);
                    writer.append(&data).await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                error!(session_id = %session_id, index, "Assembly failed: {}", e);
                writer.abort().await;
                return Err(UploadError::Storage(e));
            }
        }

        let size = hasher.len();
        Ok((writer, hasher.finalize(), size))
    }

    async fn fail_session(&self, handle: &SessionHandle, session_id: &SessionId, cause: &UploadError) {
        {
            let mut session = handle.lock().await;
            session.failure = Some(cause.to_string());
            session.transition(UploadStatus::Failed);
            self.persist_or_warn(&session).await;
        }
        error!(session_id = %session_id, "Upload failed: {}", cause);
        record_session_finished("failed");
        self.release_chunks(session_id).await;
    }

    async fn release_chunks(&self, session_id: &SessionId) {
        if let Err(e) = self.chunks.delete(session_id).await {
            warn!(session_id = %session_id, "Failed to release chunk storage: {}", e);
        }
    }

    /// Submit the completion event with no session lock held.
    async fn dispatch(&self, handle: &SessionHandle, event: &CompletionEvent, previous_attempts: u32) {
        let result = self.sink.submit(event).await;

        let mut session = handle.lock().await;
        session.dispatching = false;
        match result {
            Ok(job_id) => {
                info!(session_id = %event.session_id, job_id = %job_id, "Completion dispatched");
                session.dispatch = DispatchState::Dispatched { job_id };
            }
            Err(e) => {
                warn!(
                    session_id = %event.session_id,
                    attempts = previous_attempts + 1,
                    "Completion dispatch deferred: {}",
                    e
                );
                session.dispatch = DispatchState::Pending {
                    attempts: previous_attempts + 1,
                    last_error: Some(e.to_string()),
                };
            }
        }
        self.persist_or_warn(&session).await;
    }

    /// Resume view of a session.
    pub async fn session_status(&self, session_id: &SessionId) -> UploadResult<SessionStatusView> {
        let handle = self.handle(session_id).await?;
        let session = handle.lock().await;
        Ok(session.status_view())
    }

    /// Abort an open session and release its chunks.
    pub async fn abort_session(&self, session_id: &SessionId) -> UploadResult<SessionStatusView> {
        let handle = self.handle(session_id).await?;
        let view = {
            let mut session = handle.lock().await;
            if !session.status.is_receiving() {
                return Err(UploadError::conflict(session_id, session.status));
            }
            session.failure = Some("aborted by client".to_string());
            session.transition(UploadStatus::Failed);
            self.persist_or_warn(&session).await;
            session.status_view()
        };

        info!(session_id = %session_id, "Upload aborted");
        record_session_finished("aborted");
        self.release_chunks(session_id).await;
        Ok(view)
    }

    /// Expire open sessions whose deadline has passed. Returns how many expired.
    pub async fn expire_stale_sessions(&self, now: DateTime<Utc>) -> usize {
        let mut expired = Vec::new();
        for handle in self.handles().await {
            let mut session = handle.lock().await;
            if session.status.is_receiving()
                && session.expires_at <= now
                && session.transition(UploadStatus::Expired)
            {
                self.persist_or_warn(&session).await;
                expired.push(session.session_id.clone());
            }
        }

        for session_id in &expired {
            info!(session_id = %session_id, "Upload session expired");
            record_session_finished("expired");
            self.release_chunks(session_id).await;
        }
        expired.len()
    }

    /// Drop terminal sessions older than the retention window.
    pub async fn purge_retired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(1));

        let mut retired = Vec::new();
        for handle in self.handles().await {
            let session = handle.lock().await;
            let dispatch_settled = !session.dispatch.is_pending() && !session.dispatching;
            if session.status.is_terminal()
                && dispatch_settled
                && session.updated_at + retention <= now
            {
                retired.push(session.session_id.clone());
            }
        }

        let mut purged = 0;
        for session_id in &retired {
            if let Err(e) = self.store.delete(session_id).await {
                warn!(session_id = %session_id, "Failed to delete stored session, keeping it: {}", e);
                continue;
            }
            self.sessions.write().await.remove(session_id);
            purged += 1;
        }
        if purged > 0 {
            debug!(count = purged, "Purged retired upload sessions");
        }
        purged
    }

    /// Retry completion events the sink has not accepted yet.
    /// Returns how many were dispatched by this call.
    pub async fn redispatch_pending(&self) -> usize {
        let mut dispatched = 0;
        for handle in self.handles().await {
            let claimed = {
                let mut session = handle.lock().await;
                let pending_attempts = match session.dispatch {
                    DispatchState::Pending { attempts, .. } if !session.dispatching => Some(attempts),
                    _ => None,
                };
                match (pending_attempts, session.artifact.clone()) {
                    (Some(attempts), Some(artifact)) => {
                        session.dispatching = true;
                        let event = CompletionEvent {
                            session_id: session.session_id.clone(),
                            video_id: session.video_id.clone(),
                            artifact_location: artifact.location,
                            checksum: artifact.checksum,
                            size_bytes: artifact.size_bytes,
                        };
                        Some((event, attempts))
                    }
                    _ => None,
                }
            };

            if let Some((event, attempts)) = claimed {
                self.dispatch(&handle, &event, attempts).await;
                if matches!(handle.lock().await.dispatch, DispatchState::Dispatched { .. }) {
                    dispatched += 1;
                }
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use vingest_models::{ClientMeta, ErrorCode, JobId};
    use vingest_queue::{QueueError, QueueResult};
    use vingest_storage::{
        FsArtifactStore, FsChunkStore, FsSessionStore, MemoryArtifactStore, MemoryChunkStore,
        StorageError,
    };

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<CompletionEvent>>,
        failing: AtomicBool,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<CompletionEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn submit(&self, event: &CompletionEvent) -> QueueResult<JobId> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(QueueError::DispatchFailed {
                    job_id: JobId::for_session(&event.session_id).to_string(),
                    attempts: 3,
                    last_error: "broker down".to_string(),
                });
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(JobId::for_session(&event.session_id))
        }
    }

    /// Chunk store whose reads always fail.
    struct BrokenReads {
        inner: MemoryChunkStore,
    }

    #[async_trait]
    impl ChunkStore for BrokenReads {
        async fn put(&self, s: &SessionId, i: ChunkIndex, d: Vec<u8>) -> StorageResult<()> {
            self.inner.put(s, i, d).await
        }
        async fn get(&self, _s: &SessionId, i: ChunkIndex) -> StorageResult<Vec<u8>> {
            Err(StorageError::read_failed(format!("bad sector at chunk {}", i)))
        }
        async fn delete(&self, s: &SessionId) -> StorageResult<()> {
            self.inner.delete(s).await
        }
    }

    /// Chunk store that parks `put` for one index until released.
    struct GatedPuts {
        inner: MemoryChunkStore,
        gated: ChunkIndex,
        entered: Notify,
        release: Notify,
    }

    impl GatedPuts {
        fn new(gated: ChunkIndex) -> Self {
            Self {
                inner: MemoryChunkStore::new(),
                gated,
                entered: Notify::new(),
                release: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl ChunkStore for GatedPuts {
        async fn put(&self, s: &SessionId, i: ChunkIndex, d: Vec<u8>) -> StorageResult<()> {
            if i == self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.put(s, i, d).await
        }
        async fn get(&self, s: &SessionId, i: ChunkIndex) -> StorageResult<Vec<u8>> {
            self.inner.get(s, i).await
        }
        async fn delete(&self, s: &SessionId) -> StorageResult<()> {
            self.inner.delete(s).await
        }
    }

    struct Fixture {
        manager: UploadSessionManager,
        chunks: Arc<MemoryChunkStore>,
        artifacts: Arc<MemoryArtifactStore>,
        sink: Arc<RecordingSink>,
        store: Arc<MemorySessionStore>,
    }

    fn fixture() -> Fixture {
        let chunks = Arc::new(MemoryChunkStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let sink = Arc::new(RecordingSink::default());
        let store = Arc::new(MemorySessionStore::new());
        let manager = UploadSessionManager::new(
            UploadConfig::default(),
            chunks.clone(),
            artifacts.clone(),
            sink.clone(),
        )
        .with_session_store(store.clone());
        Fixture {
            manager,
            chunks,
            artifacts,
            sink,
            store,
        }
    }

    /// Manager over filesystem stores rooted at `dir`, as a restarted API would build it.
    fn fs_manager(dir: &TempDir, sink: Arc<RecordingSink>) -> UploadSessionManager {
        UploadSessionManager::new(
            UploadConfig::default(),
            Arc::new(FsChunkStore::new(dir.path().join("chunks"))),
            Arc::new(FsArtifactStore::new(dir.path().join("artifacts"))),
            sink,
        )
        .with_session_store(Arc::new(FsSessionStore::new(dir.path().join("sessions"))))
    }

    fn payload(total: usize) -> Vec<u8> {
        (0..total).map(|i| (i % 251) as u8).collect()
    }

    fn chunk_of(data: &[u8], chunk_size: usize, index: u32) -> Vec<u8> {
        data.chunks(chunk_size).nth(index as usize).unwrap().to_vec()
    }

    async fn send(f: &Fixture, s: &SessionId, data: &[u8], chunk_size: usize, index: u32) -> UploadResult<ChunkAck> {
        let chunk = chunk_of(data, chunk_size, index);
        let sum = Checksum::compute(&chunk);
        f.manager.accept_chunk(s, index, chunk, sum.as_str()).await
    }

    #[tokio::test]
    async fn test_init_rejects_bad_sizes() {
        let f = fixture();
        for request in [
            InitSessionRequest::new(0, 10),
            InitSessionRequest::new(10, 0),
            InitSessionRequest::new(10, 128 * 1024 * 1024),
            InitSessionRequest::new(20 * 1024 * 1024 * 1024, 8 * 1024 * 1024),
            InitSessionRequest::new(10_001, 1),
        ] {
            let err = f.manager.init_session(request).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument);
        }

        let mut bad_sum = InitSessionRequest::new(10, 5);
        bad_sum.file_checksum = Some("nothex".to_string());
        assert!(matches!(
            f.manager.init_session(bad_sum).await,
            Err(UploadError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_reordered_chunks_assemble_identically() {
        let f = fixture();
        let data = payload(95);
        let created = f
            .manager
            .init_session(InitSessionRequest::new(95, 10).with_file_checksum(&Checksum::compute(&data)))
            .await
            .unwrap();
        assert_eq!(created.expected_chunk_count, 10);

        for index in [9, 3, 0, 7, 1, 8, 2, 6, 4, 5] {
            send(&f, &created.session_id, &data, 10, index).await.unwrap();
        }

        let result = f.manager.finish_session(&created.session_id).await.unwrap();
        assert_eq!(result.size_bytes, 95);
        assert_eq!(result.checksum, Checksum::compute(&data));
        assert_eq!(f.artifacts.read(&result.artifact_location).await.unwrap(), data);
        assert!(matches!(result.dispatch, DispatchState::Dispatched { .. }));
        assert_eq!(f.chunks.session_count(), 0);
    }

    #[tokio::test]
    async fn test_resent_chunk_is_noop_duplicate() {
        let f = fixture();
        let data = payload(30);
        let created = f.manager.init_session(InitSessionRequest::new(30, 10)).await.unwrap();
        let s = &created.session_id;

        let first = send(&f, s, &data, 10, 1).await.unwrap();
        let again = send(&f, s, &data, 10, 1).await.unwrap();

        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(again.received, 1);
        assert_eq!(again.missing_indices, vec![0, 2]);
    }

    #[tokio::test]
    async fn test_chunk_validation_errors() {
        let f = fixture();
        let data = payload(25);
        let created = f.manager.init_session(InitSessionRequest::new(25, 10)).await.unwrap();
        let s = &created.session_id;

        // out of range
        let chunk = vec![0u8; 5];
        let sum = Checksum::compute(&chunk);
        let err = f.manager.accept_chunk(s, 3, chunk.clone(), sum.as_str()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        // non-final chunk must be full size
        let err = f.manager.accept_chunk(s, 0, chunk.clone(), sum.as_str()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        // final chunk must be exactly the remainder
        let short = vec![0u8; 4];
        let err = f
            .manager
            .accept_chunk(s, 2, short.clone(), Checksum::compute(&short).as_str())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        // checksum mismatch stores nothing
        let last = chunk_of(&data, 10, 2);
        let wrong = Checksum::compute(b"something else");
        let err = f.manager.accept_chunk(s, 2, last, wrong.as_str()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid);
        assert_eq!(f.chunks.chunk_count(s), 0);

        let err = f
            .manager
            .accept_chunk(&SessionId::from("missing"), 0, vec![1], sum.as_str())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);

        let status = f.manager.session_status(s).await.unwrap();
        assert_eq!(status.status, UploadStatus::Initialized);
    }

    #[tokio::test]
    async fn test_first_chunk_moves_session_in_progress() {
        let f = fixture();
        let data = payload(20);
        let created = f.manager.init_session(InitSessionRequest::new(20, 10)).await.unwrap();
        send(&f, &created.session_id, &data, 10, 0).await.unwrap();

        let status = f.manager.session_status(&created.session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::InProgress);
        assert_eq!(status.progress_percent, 50.0);
    }

    #[tokio::test]
    async fn test_incomplete_lists_missing_and_does_not_assemble() {
        let f = fixture();
        let data = payload(50);
        let created = f.manager.init_session(InitSessionRequest::new(50, 10)).await.unwrap();
        for index in [0, 2, 4] {
            send(&f, &created.session_id, &data, 10, index).await.unwrap();
        }

        let err = f.manager.finish_session(&created.session_id).await.unwrap_err();
        assert_eq!(err.missing_indices(), Some(&[1, 3][..]));
        assert!(f.artifacts.is_empty());

        let status = f.manager.session_status(&created.session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::InProgress);
    }

    #[tokio::test]
    async fn test_finish_twice_returns_stored_result_and_emits_once() {
        let f = fixture();
        let data = payload(10);
        let created = f.manager.init_session(InitSessionRequest::new(10, 10)).await.unwrap();
        send(&f, &created.session_id, &data, 10, 0).await.unwrap();

        let first = f.manager.finish_session(&created.session_id).await.unwrap();
        let second = f.manager.finish_session(&created.session_id).await.unwrap();

        assert!(!first.already_completed);
        assert!(second.already_completed);
        assert_eq!(first.artifact_location, second.artifact_location);
        assert_eq!(f.sink.events().len(), 1);

        let err = send(&f, &created.session_id, &data, 10, 0).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_file_checksum_mismatch_fails_session() {
        let f = fixture();
        let data = payload(20);
        let created = f
            .manager
            .init_session(InitSessionRequest::new(20, 10).with_file_checksum(&Checksum::compute(b"other")))
            .await
            .unwrap();
        for index in 0..2 {
            send(&f, &created.session_id, &data, 10, index).await.unwrap();
        }

        let err = f.manager.finish_session(&created.session_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid);
        let status = f.manager.session_status(&created.session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::Failed);
        assert!(f.artifacts.is_empty());
        assert!(f.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_during_assembly_fails_session() {
        let sink = Arc::new(RecordingSink::default());
        let manager = UploadSessionManager::new(
            UploadConfig::default(),
            Arc::new(BrokenReads {
                inner: MemoryChunkStore::new(),
            }),
            Arc::new(MemoryArtifactStore::new()),
            sink.clone(),
        );
        let data = payload(10);
        let created = manager.init_session(InitSessionRequest::new(10, 10)).await.unwrap();
        manager
            .accept_chunk(&created.session_id, 0, data.clone(), Checksum::compute(&data).as_str())
            .await
            .unwrap();

        let err = manager.finish_session(&created.session_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageError);
        let status = manager.session_status(&created.session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::Failed);
        assert!(sink.events().is_empty());

        let err = manager.finish_session(&created.session_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_abort_releases_storage_and_rejects_chunks() {
        let f = fixture();
        let data = payload(30);
        let created = f.manager.init_session(InitSessionRequest::new(30, 10)).await.unwrap();
        send(&f, &created.session_id, &data, 10, 0).await.unwrap();

        let view = f.manager.abort_session(&created.session_id).await.unwrap();
        assert_eq!(view.status, UploadStatus::Failed);
        assert_eq!(f.chunks.chunk_count(&created.session_id), 0);

        let err = send(&f, &created.session_id, &data, 10, 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        let err = f.manager.abort_session(&created.session_id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn test_expiry_and_purge() {
        let f = fixture();
        let data = payload(20);
        let open = f.manager.init_session(InitSessionRequest::new(20, 10)).await.unwrap();
        send(&f, &open.session_id, &data, 10, 0).await.unwrap();

        assert_eq!(f.manager.expire_stale_sessions(Utc::now()).await, 0);

        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(f.manager.expire_stale_sessions(later).await, 1);
        let status = f.manager.session_status(&open.session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::Expired);
        assert_eq!(f.chunks.chunk_count(&open.session_id), 0);

        let err = send(&f, &open.session_id, &data, 10, 1).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let much_later = later + chrono::Duration::hours(25);
        assert_eq!(f.manager.purge_retired(much_later).await, 1);
        assert_eq!(f.manager.session_count().await, 0);
        assert!(matches!(
            f.manager.session_status(&open.session_id).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_deferred_and_redispatched() {
        let f = fixture();
        f.sink.failing.store(true, Ordering::SeqCst);
        let data = payload(10);
        let created = f.manager.init_session(InitSessionRequest::new(10, 10)).await.unwrap();
        send(&f, &created.session_id, &data, 10, 0).await.unwrap();

        let result = f.manager.finish_session(&created.session_id).await.unwrap();
        assert!(matches!(
            result.dispatch,
            DispatchState::Pending { attempts: 1, .. }
        ));
        assert_eq!(f.manager.redispatch_pending().await, 0);

        // pending sessions are never purged
        let far = Utc::now() + chrono::Duration::days(30);
        assert_eq!(f.manager.purge_retired(far).await, 0);

        f.sink.failing.store(false, Ordering::SeqCst);
        assert_eq!(f.manager.redispatch_pending().await, 1);
        assert_eq!(f.manager.redispatch_pending().await, 0);
        assert_eq!(f.sink.events().len(), 1);

        let status = f.manager.session_status(&created.session_id).await.unwrap();
        assert!(matches!(status.dispatch, DispatchState::Dispatched { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_chunk_uploads_all_commit() {
        let f = Arc::new(fixture());
        let data = Arc::new(payload(1000));
        let created = f.manager.init_session(InitSessionRequest::new(1000, 10)).await.unwrap();

        let mut tasks = Vec::new();
        for index in 0..100u32 {
            let f = f.clone();
            let data = data.clone();
            let s = created.session_id.clone();
            tasks.push(tokio::spawn(async move { send(&f, &s, &data, 10, index).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let status = f.manager.session_status(&created.session_id).await.unwrap();
        assert_eq!(status.received_chunks, 100);
        assert!(status.missing_indices.is_empty());

        let result = f.manager.finish_session(&created.session_id).await.unwrap();
        assert_eq!(f.artifacts.read(&result.artifact_location).await.unwrap(), *data);
    }

    #[tokio::test]
    async fn test_concurrent_finish_assembles_once() {
        let f = Arc::new(fixture());
        let data = payload(40);
        let created = f.manager.init_session(InitSessionRequest::new(40, 10)).await.unwrap();
        for index in 0..4 {
            send(&f, &created.session_id, &data, 10, index).await.unwrap();
        }

        let a = {
            let f = f.clone();
            let s = created.session_id.clone();
            tokio::spawn(async move { f.manager.finish_session(&s).await })
        };
        let b = {
            let f = f.clone();
            let s = created.session_id.clone();
            tokio::spawn(async move { f.manager.finish_session(&s).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let fresh = results
            .iter()
            .filter(|r| matches!(r, Ok(c) if !c.already_completed))
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(f.sink.events().len(), 1);
        assert_eq!(f.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_every_transition_is_written_to_the_store() {
        let f = fixture();
        let data = payload(20);
        let meta = ClientMeta {
            filename: Some("clip.mp4".to_string()),
            ..Default::default()
        };
        let created = f
            .manager
            .init_session(InitSessionRequest::new(20, 10).with_client_meta(meta))
            .await
            .unwrap();
        let s = &created.session_id;
        let stored = f.store.get(s).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Initialized);
        assert_eq!(stored.client_meta.filename.as_deref(), Some("clip.mp4"));

        send(&f, s, &data, 10, 1).await.unwrap();
        let stored = f.store.get(s).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::InProgress);
        assert_eq!(stored.received.iter().copied().collect::<Vec<_>>(), vec![1]);

        send(&f, s, &data, 10, 0).await.unwrap();
        f.manager.finish_session(s).await.unwrap();
        let stored = f.store.get(s).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Completed);
        assert!(stored.artifact.is_some());
        assert!(matches!(stored.dispatch, DispatchState::Dispatched { .. }));
    }

    #[tokio::test]
    async fn test_open_session_resumes_after_restart() {
        let dir = TempDir::new().unwrap();
        let data = payload(30);
        let created = {
            let before = fs_manager(&dir, Arc::new(RecordingSink::default()));
            let created = before.init_session(InitSessionRequest::new(30, 10)).await.unwrap();
            let chunk = chunk_of(&data, 10, 0);
            before
                .accept_chunk(&created.session_id, 0, chunk.clone(), Checksum::compute(&chunk).as_str())
                .await
                .unwrap();
            created
        };

        let sink = Arc::new(RecordingSink::default());
        let after = fs_manager(&dir, sink.clone());
        let status = after.session_status(&created.session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::InProgress);
        assert_eq!(status.received_chunks, 1);
        assert_eq!(status.missing_indices, vec![1, 2]);

        for index in 1..3 {
            let chunk = chunk_of(&data, 10, index);
            after
                .accept_chunk(&created.session_id, index, chunk.clone(), Checksum::compute(&chunk).as_str())
                .await
                .unwrap();
        }
        let result = after.finish_session(&created.session_id).await.unwrap();
        assert_eq!(result.checksum, Checksum::compute(&data));
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_after_restart_expires_stored_sessions() {
        let dir = TempDir::new().unwrap();
        let data = payload(20);
        let session_id = {
            let before = fs_manager(&dir, Arc::new(RecordingSink::default()));
            let created = before.init_session(InitSessionRequest::new(20, 10)).await.unwrap();
            let chunk = chunk_of(&data, 10, 0);
            before
                .accept_chunk(&created.session_id, 0, chunk.clone(), Checksum::compute(&chunk).as_str())
                .await
                .unwrap();
            created.session_id
        };
        let chunk_dir = dir.path().join("chunks").join(session_id.as_str());
        assert!(chunk_dir.exists());

        let after = fs_manager(&dir, Arc::new(RecordingSink::default()));
        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(after.expire_stale_sessions(later).await, 1);
        assert!(!chunk_dir.exists());

        // the expiry itself is durable
        let again = fs_manager(&dir, Arc::new(RecordingSink::default()));
        let status = again.session_status(&session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::Expired);
    }

    #[tokio::test]
    async fn test_pending_dispatch_survives_restart() {
        let dir = TempDir::new().unwrap();
        let data = payload(10);
        let failing = Arc::new(RecordingSink::default());
        failing.failing.store(true, Ordering::SeqCst);
        let session_id = {
            let before = fs_manager(&dir, failing);
            let created = before.init_session(InitSessionRequest::new(10, 10)).await.unwrap();
            before
                .accept_chunk(&created.session_id, 0, data.clone(), Checksum::compute(&data).as_str())
                .await
                .unwrap();
            let result = before.finish_session(&created.session_id).await.unwrap();
            assert!(result.dispatch.is_pending());
            created.session_id
        };

        let sink = Arc::new(RecordingSink::default());
        let after = fs_manager(&dir, sink.clone());
        let far = Utc::now() + chrono::Duration::days(30);
        assert_eq!(after.purge_retired(far).await, 0);
        assert_eq!(after.redispatch_pending().await, 1);
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.events()[0].session_id, session_id);

        let status = after.session_status(&session_id).await.unwrap();
        assert!(matches!(status.dispatch, DispatchState::Dispatched { .. }));
        assert_eq!(after.purge_retired(far).await, 1);
        assert!(matches!(
            fs_manager(&dir, sink).session_status(&session_id).await,
            Err(UploadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_assembly_interrupted_by_restart_fails_session() {
        let f = fixture();
        let data = payload(10);
        let created = f.manager.init_session(InitSessionRequest::new(10, 10)).await.unwrap();
        send(&f, &created.session_id, &data, 10, 0).await.unwrap();

        let mut record = f.store.get(&created.session_id).await.unwrap().unwrap();
        record.status = UploadStatus::Assembling;
        f.store.put(&record).await.unwrap();

        let restarted = UploadSessionManager::new(
            UploadConfig::default(),
            f.chunks.clone(),
            f.artifacts.clone(),
            f.sink.clone(),
        )
        .with_session_store(f.store.clone());
        let status = restarted.session_status(&created.session_id).await.unwrap();
        assert_eq!(status.status, UploadStatus::Failed);
        assert_eq!(f.chunks.chunk_count(&created.session_id), 0);
        assert_eq!(
            f.store.get(&created.session_id).await.unwrap().unwrap().status,
            UploadStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_finish_while_chunk_write_in_flight_reports_it_missing() {
        let chunks = Arc::new(GatedPuts::new(1));
        let manager = Arc::new(UploadSessionManager::new(
            UploadConfig::default(),
            chunks.clone(),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(RecordingSink::default()),
        ));
        let data = payload(20);
        let created = manager.init_session(InitSessionRequest::new(20, 10)).await.unwrap();
        let s = created.session_id.clone();
        let first = chunk_of(&data, 10, 0);
        manager
            .accept_chunk(&s, 0, first.clone(), Checksum::compute(&first).as_str())
            .await
            .unwrap();

        let writer = {
            let manager = manager.clone();
            let s = s.clone();
            let second = chunk_of(&data, 10, 1);
            tokio::spawn(async move {
                let sum = Checksum::compute(&second);
                manager.accept_chunk(&s, 1, second, sum.as_str()).await
            })
        };
        chunks.entered.notified().await;

        let err = manager.finish_session(&s).await.unwrap_err();
        assert_eq!(err.missing_indices(), Some(&[1][..]));
        assert_eq!(
            manager.session_status(&s).await.unwrap().status,
            UploadStatus::InProgress
        );

        chunks.release.notify_one();
        let ack = writer.await.unwrap().unwrap();
        assert!(ack.missing_indices.is_empty());
        let result = manager.finish_session(&s).await.unwrap();
        assert_eq!(result.checksum, Checksum::compute(&data));
    }

    #[tokio::test]
    async fn test_abort_during_chunk_write_releases_chunks() {
        let chunks = Arc::new(GatedPuts::new(0));
        let manager = Arc::new(UploadSessionManager::new(
            UploadConfig::default(),
            chunks.clone(),
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(RecordingSink::default()),
        ));
        let data = payload(20);
        let created = manager.init_session(InitSessionRequest::new(20, 10)).await.unwrap();
        let s = created.session_id.clone();

        let writer = {
            let manager = manager.clone();
            let s = s.clone();
            let chunk = chunk_of(&data, 10, 0);
            tokio::spawn(async move {
                let sum = Checksum::compute(&chunk);
                manager.accept_chunk(&s, 0, chunk, sum.as_str()).await
            })
        };
        chunks.entered.notified().await;

        let view = manager.abort_session(&s).await.unwrap();
        assert_eq!(view.status, UploadStatus::Failed);

        chunks.release.notify_one();
        let err = writer.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);
        assert_eq!(chunks.inner.chunk_count(&s), 0);
        assert_eq!(chunks.inner.session_count(), 0);
        assert_eq!(manager.session_status(&s).await.unwrap().received_chunks, 0);
    }
}
