//! Duplicate and redelivered jobs run the transcode once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use vingest_models::{Checksum, CompletionEvent, SessionId, TranscodeJob, VideoId};
use vingest_queue::{MemoryIdempotencyStore, MemoryWorkQueue, WorkChannel, WorkSource};
use vingest_worker::{
    ClaimOutcome, JobExecutor, JobLedger, LedgerEntry, RenditionOutput, TranscodeOutput,
    Transcoder, WorkerConfig, WorkerPool, WorkerResult,
};

struct CountingTranscoder {
    calls: AtomicU32,
    delay: Duration,
}

impl CountingTranscoder {
    fn new(delay: Duration) -> Self {
        Self {
            calls: AtomicU32::new(0),
            delay,
        }
    }
}

#[async_trait]
impl Transcoder for CountingTranscoder {
    async fn transcode(&self, job: &TranscodeJob) -> WorkerResult<TranscodeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(TranscodeOutput {
            renditions: vec![RenditionOutput {
                name: "480p".to_string(),
                location: format!("mem://renditions/{}/480p.mp4", job.video_id),
                size_bytes: 8,
            }],
        })
    }
}

fn job() -> TranscodeJob {
    TranscodeJob::from_completion(&CompletionEvent {
        session_id: SessionId::from("session-dup"),
        video_id: VideoId::from_string("video-dup"),
        artifact_location: "mem://raw/video-dup.bin".to_string(),
        checksum: Checksum::compute(b"payload"),
        size_bytes: 7,
    })
}

fn config(consumers: usize) -> WorkerConfig {
    WorkerConfig {
        consumers,
        heartbeat_interval: Duration::from_millis(50),
        shutdown_timeout: Duration::from_secs(2),
        ..WorkerConfig::default()
    }
}

async fn wait_until_empty(queue: &MemoryWorkQueue, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while !queue.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_five_concurrent_deliveries_transcode_once() {
    let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
    let ledger = Arc::new(JobLedger::new(
        Arc::new(MemoryIdempotencyStore::new()),
        Duration::from_secs(60),
        Duration::from_secs(3600),
    ));
    let transcoder = Arc::new(CountingTranscoder::new(Duration::from_millis(200)));

    for _ in 0..5 {
        queue.publish(&job()).await.unwrap();
    }

    let config = config(5);
    let executor = JobExecutor::new(
        config.clone(),
        queue.clone(),
        ledger.clone(),
        transcoder.clone(),
    );
    let mut pool = WorkerPool::new("worker-a", &config, queue.clone(), Arc::new(executor));
    pool.start();

    wait_until_empty(&queue, Duration::from_secs(5)).await;
    pool.stop().await;

    assert!(queue.is_empty());
    assert!(queue.dead_letters().is_empty());
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    match ledger.get(&job().job_id).await.unwrap() {
        Some(LedgerEntry::Completed { outputs, attempts, .. }) => {
            assert_eq!(attempts, 1);
            assert_eq!(outputs, vec!["mem://renditions/video-dup/480p.mp4".to_string()]);
        }
        other => panic!("unexpected ledger entry: {:?}", other),
    }
}

#[tokio::test]
async fn test_crash_before_ack_is_redelivered_and_completed_once() {
    let queue = Arc::new(MemoryWorkQueue::new(Duration::from_millis(300)));
    let ledger = Arc::new(JobLedger::new(
        Arc::new(MemoryIdempotencyStore::new()),
        Duration::from_millis(200),
        Duration::from_secs(3600),
    ));
    let transcoder = Arc::new(CountingTranscoder::new(Duration::from_millis(10)));

    queue.publish(&job()).await.unwrap();

    // first worker takes the message and the claim, then dies without acking
    let lost = queue
        .poll("crashed-0", 1, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(lost.len(), 1);
    let claim = ledger
        .claim(&job().job_id, "crashed-0", Utc::now())
        .await
        .unwrap();
    assert_eq!(claim, ClaimOutcome::Acquired { attempt: 1 });
    drop(lost);

    let config = config(1);
    let executor = JobExecutor::new(
        config.clone(),
        queue.clone(),
        ledger.clone(),
        transcoder.clone(),
    );
    let mut pool = WorkerPool::new("survivor", &config, queue.clone(), Arc::new(executor));
    pool.start();

    wait_until_empty(&queue, Duration::from_secs(5)).await;
    pool.stop().await;

    assert!(queue.is_empty());
    assert!(queue.dead_letters().is_empty());
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    match ledger.get(&job().job_id).await.unwrap() {
        Some(LedgerEntry::Completed { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("unexpected ledger entry: {:?}", other),
    }
}
