//! Resumable chunked uploader.
//!
//! Splits a source into `chunk_size` pieces, sends them with bounded
//! parallelism, and finishes the session. When finish reports missing
//! indices, only those are re-sent. An interrupted upload resumes from the
//! server's missing list via [`ChunkedUploader::resume`].

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{info, warn};
use vingest_models::{
    Checksum, ChecksumHasher, ChunkIndex, ClientMeta, CompletionResult, InitSessionRequest,
    SessionId,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::service::UploadService;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Bytes to upload.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Memory(Arc<Vec<u8>>),
    File(PathBuf),
}

impl UploadSource {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::Memory(Arc::new(data))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }

    async fn len(&self) -> ClientResult<u64> {
        match self {
            UploadSource::Memory(data) => Ok(data.len() as u64),
            UploadSource::File(path) => tokio::fs::metadata(path)
                .await
                .map(|m| m.len())
                .map_err(|e| ClientError::Input(format!("{}: {}", path.display(), e))),
        }
    }

    async fn checksum(&self) -> ClientResult<Checksum> {
        match self {
            UploadSource::Memory(data) => Ok(Checksum::compute(data)),
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| ClientError::Input(format!("{}: {}", path.display(), e)))?;
                let mut hasher = ChecksumHasher::new();
                let mut buf = vec![0u8; HASH_BUFFER_SIZE];
                loop {
                    let n = file
                        .read(&mut buf)
                        .await
                        .map_err(|e| ClientError::Input(format!("{}: {}", path.display(), e)))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hasher.finalize())
            }
        }
    }

    async fn read_chunk(
        &self,
        index: ChunkIndex,
        chunk_size: u64,
        total_size: u64,
    ) -> ClientResult<Vec<u8>> {
        let start = index as u64 * chunk_size;
        if start >= total_size {
            return Err(ClientError::Input(format!(
                "chunk {} starts past end of source",
                index
            )));
        }
        let len = chunk_size.min(total_size - start) as usize;

        match self {
            UploadSource::Memory(data) => {
                let start = start as usize;
                Ok(data[start..start + len].to_vec())
            }
            UploadSource::File(path) => {
                let io_err = |e: std::io::Error| {
                    ClientError::Input(format!("{} chunk {}: {}", path.display(), index, e))
                };
                let mut file = tokio::fs::File::open(path).await.map_err(io_err)?;
                file.seek(SeekFrom::Start(start)).await.map_err(io_err)?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await.map_err(io_err)?;
                Ok(buf)
            }
        }
    }
}

/// Outcome of a finished upload.
#[derive(Debug, Clone)]
pub struct UploadReport {
    pub session_id: SessionId,
    pub result: CompletionResult,
    /// Chunk sends performed by this uploader, re-sends included
    pub chunks_sent: u32,
    /// Finish calls that reported missing chunks
    pub resume_rounds: u32,
}

pub struct ChunkedUploader {
    service: Arc<dyn UploadService>,
    concurrency: usize,
    max_resume_rounds: u32,
}

impl ChunkedUploader {
    pub fn new(service: Arc<dyn UploadService>, concurrency: usize) -> Self {
        Self {
            service,
            concurrency: concurrency.max(1),
            max_resume_rounds: 3,
        }
    }

    pub fn from_config(service: Arc<dyn UploadService>, config: &ClientConfig) -> Self {
        Self::new(service, config.upload_concurrency).with_max_resume_rounds(config.max_resume_rounds)
    }

    pub fn with_max_resume_rounds(mut self, rounds: u32) -> Self {
        self.max_resume_rounds = rounds;
        self
    }

    /// Create a session for `source` and upload it completely.
    pub async fn upload(
        &self,
        source: UploadSource,
        chunk_size: u64,
        meta: ClientMeta,
    ) -> ClientResult<UploadReport> {
        let total_size = source.len().await?;
        let checksum = source.checksum().await?;
        let request = InitSessionRequest::new(total_size, chunk_size)
            .with_file_checksum(&checksum)
            .with_client_meta(meta);

        let created = self.service.init(&request).await?;
        info!(
            session_id = %created.session_id,
            total_size,
            chunks = created.expected_chunk_count,
            "Starting upload"
        );

        let indices: Vec<ChunkIndex> = (0..created.expected_chunk_count).collect();
        self.drive(&created.session_id, &source, chunk_size, total_size, indices)
            .await
    }

    /// Continue an interrupted upload: send what the server is missing, then finish.
    pub async fn resume(
        &self,
        session_id: &SessionId,
        source: UploadSource,
    ) -> ClientResult<UploadReport> {
        let status = self.service.status(session_id).await?;
        if !status.status.is_receiving() {
            // Completed sessions answer finish with the stored result
            let result = self.service.finish(session_id).await?;
            return Ok(UploadReport {
                session_id: session_id.clone(),
                result,
                chunks_sent: 0,
                resume_rounds: 0,
            });
        }

        let total_size = source.len().await?;
        if total_size != status.total_size {
            return Err(ClientError::Input(format!(
                "source is {} bytes, session expects {}",
                total_size, status.total_size
            )));
        }
        info!(
            session_id = %session_id,
            missing = status.missing_indices.len(),
            "Resuming upload"
        );
        self.drive(
            session_id,
            &source,
            status.chunk_size,
            total_size,
            status.missing_indices,
        )
        .await
    }

    async fn drive(
        &self,
        session_id: &SessionId,
        source: &UploadSource,
        chunk_size: u64,
        total_size: u64,
        mut pending: Vec<ChunkIndex>,
    ) -> ClientResult<UploadReport> {
        let mut chunks_sent = 0u32;
        let mut resume_rounds = 0u32;

        loop {
            chunks_sent += self
                .send_chunks(session_id, source, chunk_size, total_size, &pending)
                .await?;

            match self.service.finish(session_id).await {
                Ok(result) => {
                    info!(
                        session_id = %session_id,
                        size_bytes = result.size_bytes,
                        chunks_sent,
                        "Upload finished"
                    );
                    return Ok(UploadReport {
                        session_id: session_id.clone(),
                        result,
                        chunks_sent,
                        resume_rounds,
                    });
                }
                Err(e) => match e.missing_indices() {
                    Some(missing) if resume_rounds < self.max_resume_rounds => {
                        resume_rounds += 1;
                        warn!(
                            session_id = %session_id,
                            missing = missing.len(),
                            round = resume_rounds,
                            "Server reports missing chunks, re-sending"
                        );
                        pending = missing.to_vec();
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    async fn send_chunks(
        &self,
        session_id: &SessionId,
        source: &UploadSource,
        chunk_size: u64,
        total_size: u64,
        indices: &[ChunkIndex],
    ) -> ClientResult<u32> {
        let acks: Vec<()> = stream::iter(indices.iter().copied())
            .map(|index| async move {
                let payload = source.read_chunk(index, chunk_size, total_size).await?;
                let checksum = Checksum::compute(&payload);
                self.service
                    .send_chunk(session_id, index, &payload, &checksum)
                    .await
                    .map(|_| ())
            })
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        Ok(acks.len() as u32)
    }
}
