//! Filesystem-backed chunk, artifact and session stores.
//!
//! Chunks live at `{root}/{session_id}/chunk_{index:06}` and session
//! records at `{root}/{session_id}.json`. Writes go to a temporary file
//! first and are renamed into place so a reader never sees a torn file.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};
use vingest_models::{ChunkIndex, SessionId, SessionRecord};

use crate::artifact::{ArtifactReader, ArtifactStore, ArtifactWriter};
use crate::chunk_store::ChunkStore;
use crate::error::{StorageError, StorageResult};
use crate::session_store::{decode_record, encode_record, SessionStore};

fn validate_segment(segment: &str) -> StorageResult<()> {
    let ok = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(segment.to_string()))
    }
}

/// Write `data` to `tmp`, fsync, then rename over `path`.
/// The temporary file is removed when any step fails.
async fn write_atomically(tmp: &Path, path: &Path, data: &[u8]) -> StorageResult<()> {
    let written = async {
        let mut file = fs::File::create(tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(tmp, path).await
    }
    .await;

    if let Err(e) = written {
        remove_quietly(tmp).await;
        return Err(StorageError::Io(e));
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
    }
}

fn map_not_found(err: std::io::Error, what: &str) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::not_found(what)
    } else {
        StorageError::Io(err)
    }
}

/// Chunk store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: PathBuf,
}

impl FsChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session_id: &SessionId) -> StorageResult<PathBuf> {
        validate_segment(session_id.as_str())?;
        Ok(self.root.join(session_id.as_str()))
    }

    fn chunk_path(&self, session_id: &SessionId, index: ChunkIndex) -> StorageResult<PathBuf> {
        Ok(self
            .session_dir(session_id)?
            .join(format!("chunk_{:06}", index)))
    }
}

#[async_trait]
impl ChunkStore for FsChunkStore {
    async fn put(&self, session_id: &SessionId, index: ChunkIndex, data: Vec<u8>) -> StorageResult<()> {
        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir).await?;

        let path = self.chunk_path(session_id, index)?;
        let tmp = dir.join(format!(".chunk_{:06}.{}.tmp", index, std::process::id()));

        write_atomically(&tmp, &path, &data).await?;

        debug!(session_id = %session_id, index, bytes = data.len(), "Stored chunk on disk");
        Ok(())
    }

    async fn get(&self, session_id: &SessionId, index: ChunkIndex) -> StorageResult<Vec<u8>> {
        let path = self.chunk_path(session_id, index)?;
        fs::read(&path)
            .await
            .map_err(|e| map_not_found(e, &format!("{}/{}", session_id, index)))
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<()> {
        let dir = self.session_dir(session_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete_failed(format!("{}: {}", dir.display(), e))),
        }
    }
}

/// Artifact store rooted at a local directory. Locations are absolute paths.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve_key(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn resolve_location(&self, location: &str) -> StorageResult<PathBuf> {
        let path = PathBuf::from(location);
        if !path.starts_with(&self.root) {
            return Err(StorageError::InvalidKey(location.to_string()));
        }
        Ok(path)
    }
}

struct FsArtifactWriter {
    writer: BufWriter<fs::File>,
    partial: PathBuf,
    target: PathBuf,
}

#[async_trait]
impl ArtifactWriter for FsArtifactWriter {
    async fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        self.writer.write_all(data).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> StorageResult<String> {
        let flushed = async {
            self.writer.flush().await?;
            self.writer.get_ref().sync_all().await?;
            fs::rename(&self.partial, &self.target).await
        }
        .await;
        if let Err(e) = flushed {
            remove_quietly(&self.partial).await;
            return Err(StorageError::Io(e));
        }
        Ok(self.target.to_string_lossy().into_owned())
    }

    async fn abort(self: Box<Self>) {
        drop(self.writer);
        if let Err(e) = fs::remove_file(&self.partial).await {
            warn!(path = %self.partial.display(), error = %e, "Failed to remove partial artifact");
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn create(&self, key: &str) -> StorageResult<Box<dyn ArtifactWriter>> {
        let target = self.resolve_key(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut partial = target.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let file = fs::File::create(&partial).await?;
        Ok(Box::new(FsArtifactWriter {
            writer: BufWriter::new(file),
            partial,
            target,
        }))
    }

    async fn read(&self, location: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve_location(location)?;
        fs::read(&path).await.map_err(|e| map_not_found(e, location))
    }

    async fn open(&self, location: &str) -> StorageResult<ArtifactReader> {
        let path = self.resolve_location(location)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| map_not_found(e, location))?;
        Ok(Box::pin(file))
    }

    async fn delete(&self, location: &str) -> StorageResult<()> {
        let path = self.resolve_location(location)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete_failed(e.to_string())),
        }
    }

    fn locate(&self, key: &str) -> StorageResult<String> {
        Ok(self.resolve_key(key)?.to_string_lossy().into_owned())
    }
}

/// Session store keeping one JSON document per session.
#[derive(Debug, Clone)]
pub struct FsSessionStore {
    root: PathBuf,
}

impl FsSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, session_id: &SessionId) -> StorageResult<PathBuf> {
        validate_segment(session_id.as_str())?;
        Ok(self.root.join(format!("{}.json", session_id)))
    }
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn put(&self, record: &SessionRecord) -> StorageResult<()> {
        let path = self.record_path(&record.session_id)?;
        fs::create_dir_all(&self.root).await?;
        let tmp = self
            .root
            .join(format!(".{}.{}.tmp", record.session_id, std::process::id()));
        write_atomically(&tmp, &path, &encode_record(record)?).await
    }

    async fn get(&self, session_id: &SessionId) -> StorageResult<Option<SessionRecord>> {
        let path = self.record_path(session_id)?;
        match fs::read(&path).await {
            Ok(bytes) => decode_record(session_id.as_str(), &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn delete(&self, session_id: &SessionId) -> StorageResult<()> {
        let path = self.record_path(session_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete_failed(format!("{}: {}", path.display(), e))),
        }
    }

    async fn list(&self) -> StorageResult<Vec<SessionRecord>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::ListFailed(e.to_string())),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::ListFailed(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            let bytes = fs::read(entry.path()).await?;
            match decode_record(&name, &bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(file = %name, "Skipping unreadable session record: {}", e),
            }
        }
        Ok(records)
    }
}
