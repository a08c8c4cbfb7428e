//! Artifact store for assembled uploads.

use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{StorageError, StorageResult};

/// Streaming writer for one artifact.
#[async_trait]
pub trait ArtifactWriter: Send {
    /// Append bytes at the end of the artifact.
    async fn append(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Make the artifact durable and return its location.
    async fn finish(self: Box<Self>) -> StorageResult<String>;

    /// Drop any partially written data.
    async fn abort(self: Box<Self>);
}

/// Byte stream over a finished artifact.
pub type ArtifactReader = Pin<Box<dyn AsyncRead + Send>>;

/// Destination for assembled files and origin for the delivery cache.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Start writing a new artifact under `key`.
    async fn create(&self, key: &str) -> StorageResult<Box<dyn ArtifactWriter>>;

    /// Read a finished artifact.
    async fn read(&self, location: &str) -> StorageResult<Vec<u8>>;

    /// Stream a finished artifact without buffering it whole.
    async fn open(&self, location: &str) -> StorageResult<ArtifactReader>;

    /// Remove a finished artifact.
    async fn delete(&self, location: &str) -> StorageResult<()>;

    /// Location a finished artifact written under `key` has.
    fn locate(&self, key: &str) -> StorageResult<String>;
}

type Objects = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// In-memory artifact store; locations are `mem://{key}`.
#[derive(Default, Clone)]
pub struct MemoryArtifactStore {
    objects: Objects,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct MemoryWriter {
    key: String,
    buf: Vec<u8>,
    objects: Objects,
}

#[async_trait]
impl ArtifactWriter for MemoryWriter {
    async fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<String> {
        let location = format!("mem://{}", self.key);
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(location.clone(), self.buf);
        Ok(location)
    }

    async fn abort(self: Box<Self>) {}
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn create(&self, key: &str) -> StorageResult<Box<dyn ArtifactWriter>> {
        self.locate(key)?;
        Ok(Box::new(MemoryWriter {
            key: key.to_string(),
            buf: Vec::new(),
            objects: Arc::clone(&self.objects),
        }))
    }

    async fn read(&self, location: &str) -> StorageResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(location)
            .cloned()
            .ok_or_else(|| StorageError::not_found(location))
    }

    async fn open(&self, location: &str) -> StorageResult<ArtifactReader> {
        let data = self.read(location).await?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, location: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(location);
        Ok(())
    }

    fn locate(&self, key: &str) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty artifact key".to_string()));
        }
        Ok(format!("mem://{}", key))
    }
}
