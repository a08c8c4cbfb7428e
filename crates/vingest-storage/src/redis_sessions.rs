//! Redis-backed session store.
//!
//! Each record is a JSON string at `{prefix}:session:{id}`; the set
//! `{prefix}:sessions` indexes the live ids for sweeps.

use async_trait::async_trait;
use tracing::warn;
use vingest_models::{SessionId, SessionRecord};

use crate::error::{StorageError, StorageResult};
use crate::session_store::{decode_record, encode_record, SessionStore};

/// Records fetched per MGET while listing.
const LIST_BATCH: usize = 100;

pub struct RedisSessionStore {
    client: redis::Client,
    prefix: String,
}

impl RedisSessionStore {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> StorageResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StorageError::config_error(format!("redis url: {}", e)))?;
        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    fn record_key(&self, session_id: &str) -> String {
        format!("{}:session:{}", self.prefix, session_id)
    }

    fn index_key(&self) -> String {
        format!("{}:sessions", self.prefix)
    }

    async fn connection(&self) -> StorageResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StorageError::config_error(format!("redis connection: {}", e)))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn put(&self, record: &SessionRecord) -> StorageResult<()> {
        let body = encode_record(record)?;
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.record_key(record.session_id.as_str()))
            .arg(body)
            .ignore()
            .cmd("SADD")
            .arg(self.index_key())
            .arg(record.session_id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StorageError::write_failed(format!("session {}: {}", record.session_id, e)))
    }

    async fn get(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let mut conn = self.connection().await?;
        let body: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.record_key(session_id.as_str()))
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::read_failed(format!("session {}: {}", session_id, e)))?;
        body.map(|bytes| decode_record(session_id.as_str(), &bytes))
            .transpose()
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<()> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.record_key(session_id.as_str()))
            .ignore()
            .cmd("SREM")
            .arg(self.index_key())
            .arg(session_id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StorageError::delete_failed(format!("session {}: {}", session_id, e)))
    }

    async fn list(&self) -> StorageResult<Vec<SessionRecord>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::ListFailed(e.to_string()))?;

        let mut records = Vec::with_capacity(ids.len());
        for batch in ids.chunks(LIST_BATCH) {
            let keys: Vec<String> = batch.iter().map(|id| self.record_key(id)).collect();
            let bodies: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
                .arg(&keys)
                .query_async(&mut conn)
                .await
                .map_err(|e| StorageError::ListFailed(e.to_string()))?;
            for (id, body) in batch.iter().zip(bodies) {
                match body {
                    Some(bytes) => match decode_record(id, &bytes) {
                        Ok(record) => records.push(record),
                        Err(e) => warn!(session_id = %id, "Skipping unreadable session record: {}", e),
                    },
                    // index entry outlived its record
                    None => {
                        let _ = redis::cmd("SREM")
                            .arg(self.index_key())
                            .arg(id)
                            .query_async::<()>(&mut conn)
                            .await;
                    }
                }
            }
        }
        Ok(records)
    }
}
