//! Chunk store abstraction and the in-memory implementation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use vingest_models::{ChunkIndex, SessionId};

use crate::error::{StorageError, StorageResult};

/// Durable keyed storage for uploaded byte ranges.
///
/// Writes may arrive in any order; assembly reads indices sequentially.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Store the payload for (session, index), replacing any previous bytes.
    async fn put(&self, session_id: &SessionId, index: ChunkIndex, data: Vec<u8>) -> StorageResult<()>;

    /// Load the payload for (session, index). `NotFound` when absent.
    async fn get(&self, session_id: &SessionId, index: ChunkIndex) -> StorageResult<Vec<u8>>;

    /// Release every chunk of a session. Deleting an unknown session is a no-op.
    async fn delete(&self, session_id: &SessionId) -> StorageResult<()>;
}

/// Index-addressed sparse store held in memory.
#[derive(Default)]
pub struct MemoryChunkStore {
    sessions: Mutex<HashMap<SessionId, BTreeMap<ChunkIndex, Vec<u8>>>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently holding chunks.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of chunks stored for a session.
    pub fn chunk_count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map(|chunks| chunks.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, session_id: &SessionId, index: ChunkIndex, data: Vec<u8>) -> StorageResult<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .entry(session_id.clone())
            .or_default()
            .insert(index, data);
        Ok(())
    }

    async fn get(&self, session_id: &SessionId, index: ChunkIndex) -> StorageResult<Vec<u8>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions
            .get(session_id)
            .and_then(|chunks| chunks.get(&index))
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("{}/{}", session_id, index)))
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<()> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }
}
