//! R2-backed chunk and artifact stores.

use async_trait::async_trait;
use tracing::warn;
use vingest_models::{ChunkIndex, SessionId};

use crate::artifact::{ArtifactReader, ArtifactStore, ArtifactWriter};
use crate::chunk_store::ChunkStore;
use crate::client::R2Client;
use crate::error::{StorageError, StorageResult};

/// Minimum part size accepted by S3-compatible multipart uploads (except the last part).
pub const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// Chunk store that keeps every chunk as its own object.
#[derive(Clone)]
pub struct R2ChunkStore {
    client: R2Client,
    prefix: String,
}

impl R2ChunkStore {
    pub fn new(client: R2Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    fn session_prefix(&self, session_id: &SessionId) -> String {
        format!("{}/{}/", self.prefix, session_id)
    }

    fn chunk_key(&self, session_id: &SessionId, index: ChunkIndex) -> String {
        format!("{}chunk_{:06}", self.session_prefix(session_id), index)
    }
}

#[async_trait]
impl ChunkStore for R2ChunkStore {
    async fn put(&self, session_id: &SessionId, index: ChunkIndex, data: Vec<u8>) -> StorageResult<()> {
        self.client
            .upload_bytes(data, &self.chunk_key(session_id, index))
            .await
    }

    async fn get(&self, session_id: &SessionId, index: ChunkIndex) -> StorageResult<Vec<u8>> {
        self.client
            .download_bytes(&self.chunk_key(session_id, index))
            .await
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<()> {
        self.client
            .delete_prefix(&self.session_prefix(session_id))
            .await
            .map(|_| ())
    }
}

/// Artifact store writing assembled files through multipart uploads.
///
/// Locations have the form `r2://{bucket}/{key}`.
#[derive(Clone)]
pub struct R2ArtifactStore {
    client: R2Client,
}

impl R2ArtifactStore {
    pub fn new(client: R2Client) -> Self {
        Self { client }
    }

    fn location_for(&self, key: &str) -> String {
        format!("r2://{}/{}", self.client.bucket(), key)
    }

    fn key_for<'a>(&self, location: &'a str) -> StorageResult<&'a str> {
        location
            .strip_prefix("r2://")
            .and_then(|rest| rest.strip_prefix(self.client.bucket()))
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| StorageError::InvalidKey(location.to_string()))
    }
}

struct R2MultipartWriter {
    client: R2Client,
    key: String,
    location: String,
    upload_id: Option<String>,
    buffer: Vec<u8>,
    parts: Vec<(i32, String)>,
}

impl R2MultipartWriter {
    async fn flush_part(&mut self) -> StorageResult<()> {
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let id = self.client.create_multipart(&self.key).await?;
                self.upload_id = Some(id.clone());
                id
            }
        };
        let part_number = self.parts.len() as i32 + 1;
        let data = std::mem::take(&mut self.buffer);
        let etag = self
            .client
            .upload_part(&self.key, &upload_id, part_number, data)
            .await?;
        self.parts.push((part_number, etag));
        Ok(())
    }
}

#[async_trait]
impl ArtifactWriter for R2MultipartWriter {
    async fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= MULTIPART_PART_SIZE {
            self.flush_part().await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<String> {
        match self.upload_id.clone() {
            // Small artifacts never started a multipart upload
            None => {
                let data = std::mem::take(&mut self.buffer);
                self.client.upload_bytes(data, &self.key).await?;
            }
            Some(upload_id) => {
                if !self.buffer.is_empty() {
                    self.flush_part().await?;
                }
                let parts = std::mem::take(&mut self.parts);
                self.client
                    .complete_multipart(&self.key, &upload_id, parts)
                    .await?;
            }
        }
        Ok(self.location.clone())
    }

    async fn abort(self: Box<Self>) {
        if let Some(upload_id) = &self.upload_id {
            if let Err(e) = self.client.abort_multipart(&self.key, upload_id).await {
                warn!(key = %self.key, error = %e, "Failed to abort multipart upload");
            }
        }
    }
}

#[async_trait]
impl ArtifactStore for R2ArtifactStore {
    async fn create(&self, key: &str) -> StorageResult<Box<dyn ArtifactWriter>> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(Box::new(R2MultipartWriter {
            client: self.client.clone(),
            key: key.to_string(),
            location: self.location_for(key),
            upload_id: None,
            buffer: Vec::with_capacity(MULTIPART_PART_SIZE),
            parts: Vec::new(),
        }))
    }

    async fn read(&self, location: &str) -> StorageResult<Vec<u8>> {
        let key = self.key_for(location)?;
        self.client.download_bytes(key).await
    }

    async fn open(&self, location: &str) -> StorageResult<ArtifactReader> {
        let key = self.key_for(location)?;
        let body = self.client.download_stream(key).await?;
        Ok(Box::pin(body.into_async_read()))
    }

    async fn delete(&self, location: &str) -> StorageResult<()> {
        let key = self.key_for(location)?;
        self.client.delete_object(key).await
    }

    fn locate(&self, key: &str) -> StorageResult<String> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.location_for(key))
    }
}
