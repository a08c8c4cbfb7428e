//! Worker pool: one push subscription per consumer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vingest_queue::{subscribe, DeliveryHandler, WorkSource};

use crate::config::WorkerConfig;

/// Runs `consumers` subscriptions against one work source.
///
/// Each subscription handles one delivery at a time, so the consumer count
/// is the pool's job concurrency.
pub struct WorkerPool {
    worker_id: String,
    consumers: usize,
    shutdown_timeout: Duration,
    source: Arc<dyn WorkSource>,
    handler: Arc<dyn DeliveryHandler>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        worker_id: impl Into<String>,
        config: &WorkerConfig,
        source: Arc<dyn WorkSource>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            worker_id: worker_id.into(),
            consumers: config.consumers.max(1),
            shutdown_timeout: config.shutdown_timeout,
            source,
            handler,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Consumer names, unique per pool; also used as ledger owners.
    pub fn consumer_names(&self) -> Vec<String> {
        (0..self.consumers)
            .map(|i| format!("{}-{}", self.worker_id, i))
            .collect()
    }

    /// Spawn the subscriptions. Calling twice has no effect.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }
        info!(
            "Starting worker pool '{}' with {} consumers",
            self.worker_id, self.consumers
        );
        for consumer in self.consumer_names() {
            self.handles.push(subscribe(
                Arc::clone(&self.source),
                consumer,
                Arc::clone(&self.handler),
                self.shutdown.subscribe(),
            ));
        }
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signal shutdown and wait for in-flight jobs, up to the shutdown timeout.
    ///
    /// Subscriptions still busy after the timeout are aborted; their
    /// deliveries stay unacked and are redelivered after the visibility
    /// timeout.
    pub async fn stop(mut self) {
        self.shutdown();
        info!("Waiting for in-flight jobs to complete...");

        let handles = std::mem::take(&mut self.handles);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Shutdown timeout of {:?} reached, aborting remaining consumers",
                self.shutdown_timeout
            );
            for abort in aborts {
                abort.abort();
            }
        }
        info!("Worker pool '{}' stopped", self.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vingest_models::{Checksum, CompletionEvent, SessionId, TranscodeJob, VideoId};
    use vingest_queue::{Delivery, MemoryWorkQueue, WorkChannel};

    struct Acker {
        source: Arc<MemoryWorkQueue>,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for Acker {
        async fn handle(&self, delivery: Delivery) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.source.ack(&delivery).await.unwrap();
        }
    }

    fn job(session: &str) -> TranscodeJob {
        TranscodeJob::from_completion(&CompletionEvent {
            session_id: SessionId::from(session),
            video_id: VideoId::new(),
            artifact_location: "mem://raw".to_string(),
            checksum: Checksum::compute(b"x"),
            size_bytes: 1,
        })
    }

    #[test]
    fn test_consumer_names_are_unique() {
        let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
        let handler = Arc::new(Acker {
            source: queue.clone(),
            seen: AtomicUsize::new(0),
        });
        let config = WorkerConfig {
            consumers: 3,
            ..WorkerConfig::default()
        };
        let pool = WorkerPool::new("worker-a", &config, queue, handler);
        assert_eq!(
            pool.consumer_names(),
            vec!["worker-a-0", "worker-a-1", "worker-a-2"]
        );
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
        let handler = Arc::new(Acker {
            source: queue.clone(),
            seen: AtomicUsize::new(0),
        });
        let config = WorkerConfig {
            consumers: 2,
            shutdown_timeout: Duration::from_secs(5),
            ..WorkerConfig::default()
        };
        let mut pool = WorkerPool::new("worker-a", &config, queue.clone(), handler.clone());
        pool.start();
        assert!(pool.is_running());

        for i in 0..6 {
            queue.publish(&job(&format!("s{}", i))).await.unwrap();
        }
        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(queue.is_empty());
        assert_eq!(handler.seen.load(Ordering::SeqCst), 6);
        pool.stop().await;
    }
}
