//! End-to-end upload flow against filesystem storage and the real dispatcher.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vingest_models::{Checksum, DispatchState, ErrorCode, InitSessionRequest, JobId, UploadStatus};
use vingest_queue::{DispatchConfig, JobDispatcher, MemoryIdempotencyStore, MemoryWorkQueue, WorkSource};
use vingest_storage::{ArtifactStore, FsArtifactStore, FsChunkStore};
use vingest_upload::{UploadConfig, UploadSessionManager};

const TOTAL: usize = 10_000_000;
const CHUNK: usize = 1_000_000;

#[tokio::test]
async fn test_ten_megabyte_upload_in_ten_chunks() {
    let dir = TempDir::new().unwrap();
    let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
    let artifacts = Arc::new(FsArtifactStore::new(dir.path().join("artifacts")));
    let dispatcher = JobDispatcher::new(
        queue.clone(),
        Arc::new(MemoryIdempotencyStore::new()),
        DispatchConfig::default(),
    );
    let manager = UploadSessionManager::new(
        UploadConfig::default(),
        Arc::new(FsChunkStore::new(dir.path().join("chunks"))),
        artifacts.clone(),
        Arc::new(dispatcher),
    );

    let data: Vec<u8> = (0..TOTAL).map(|i| (i * 31 % 256) as u8).collect();
    let created = manager
        .init_session(
            InitSessionRequest::new(TOTAL as u64, CHUNK as u64)
                .with_file_checksum(&Checksum::compute(&data)),
        )
        .await
        .unwrap();
    assert_eq!(created.expected_chunk_count, 10);

    for (index, chunk) in data.chunks(CHUNK).enumerate().take(9) {
        let sum = Checksum::compute(chunk);
        manager
            .accept_chunk(&created.session_id, index as u32, chunk.to_vec(), sum.as_str())
            .await
            .unwrap();
    }

    let err = manager.finish_session(&created.session_id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Incomplete);
    assert_eq!(err.missing_indices(), Some(&[9][..]));

    let last = &data[9 * CHUNK..];
    let ack = manager
        .accept_chunk(&created.session_id, 9, last.to_vec(), Checksum::compute(last).as_str())
        .await
        .unwrap();
    assert!(ack.is_last());

    let result = manager.finish_session(&created.session_id).await.unwrap();
    assert_eq!(result.size_bytes, TOTAL as u64);
    let stored = artifacts.read(&result.artifact_location).await.unwrap();
    assert_eq!(stored.len(), TOTAL);
    assert_eq!(stored, data);

    let job_id = JobId::for_session(&created.session_id);
    assert_eq!(result.dispatch, DispatchState::Dispatched { job_id: job_id.clone() });

    let status = manager.session_status(&created.session_id).await.unwrap();
    assert_eq!(status.status, UploadStatus::Completed);
    assert_eq!(status.progress_percent, 100.0);

    let deliveries = queue.poll("w1", 10, Duration::from_millis(10)).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].job.job_id, job_id);
    assert_eq!(deliveries[0].job.source_location, result.artifact_location);
    assert!(!dir.path().join("chunks").join(created.session_id.as_str()).exists());
}
