//! Session metadata store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use vingest_models::{SessionId, SessionRecord};

use crate::error::{StorageError, StorageResult};

/// Durable home of upload session metadata.
///
/// The upload manager writes a full snapshot on every state change, so a
/// `put` always replaces the previous record.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn put(&self, record: &SessionRecord) -> StorageResult<()>;

    /// Load one record; `None` when the session is unknown.
    async fn get(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>>;

    /// Forget a session. Deleting an unknown session is a no-op.
    async fn delete(&self, session_id: &SessionId) -> StorageResult<()>;

    /// Every stored record, in no particular order.
    async fn list(&self) -> StorageResult<Vec<SessionRecord>>;
}

/// Process-local session store; contents are lost on restart.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put(&self, record: &SessionRecord) -> StorageResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned())
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<SessionRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }
}

pub(crate) fn encode_record(record: &SessionRecord) -> StorageResult<Vec<u8>> {
    serde_json::to_vec(record)
        .map_err(|e| StorageError::write_failed(format!("session {}: {}", record.session_id, e)))
}

pub(crate) fn decode_record(what: &str, bytes: &[u8]) -> StorageResult<SessionRecord> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::read_failed(format!("session {}: {}", what, e)))
}
