//! Push delivery on top of a polling work source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::channel::{Delivery, WorkSource};
use crate::metrics::record_delivery;

/// Receives deliveries pushed by [`subscribe`].
///
/// The handler owns the outcome: it must ack, nack or dead-letter the
/// delivery through the source. A delivery it leaves alone is redelivered
/// after the visibility timeout.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// Wait used for each poll; bounds shutdown latency.
const POLL_WAIT: Duration = Duration::from_millis(500);
/// Back-off after a failed poll.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Push every delivery for `consumer` to `handler` until `shutdown` flips to true.
///
/// Deliveries are handled one at a time; run several subscriptions to get
/// parallelism.
pub fn subscribe(
    source: Arc<dyn WorkSource>,
    consumer: String,
    handler: Arc<dyn DeliveryHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(consumer = %consumer, "Subscription started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = source.poll(&consumer, 1, POLL_WAIT) => polled,
            };

            match polled {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        debug!(consumer = %consumer, job_id = %delivery.job.job_id, "Pushing delivery");
                        record_delivery(&consumer);
                        handler.handle(delivery).await;
                    }
                }
                Err(e) => {
                    error!(consumer = %consumer, "Poll failed: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        info!(consumer = %consumer, "Subscription stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::WorkChannel;
    use crate::memory::MemoryWorkQueue;
    use std::sync::Mutex;
    use vingest_models::{Checksum, CompletionEvent, SessionId, TranscodeJob, VideoId};

    struct Recorder {
        source: Arc<MemoryWorkQueue>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, delivery: Delivery) {
            self.seen
                .lock()
                .unwrap()
                .push(delivery.job.session_id.to_string());
            self.source.ack(&delivery).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_subscribe_pushes_and_stops_on_shutdown() {
        let queue = Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
        let recorder = Arc::new(Recorder {
            source: queue.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let (tx, rx) = watch::channel(false);
        let handle = subscribe(queue.clone(), "w1".to_string(), recorder.clone(), rx);

        for session in ["a", "b", "c"] {
            let job = TranscodeJob::from_completion(&CompletionEvent {
                session_id: SessionId::from(session),
                video_id: VideoId::new(),
                artifact_location: "mem://raw".to_string(),
                checksum: Checksum::compute(b"x"),
                size_bytes: 1,
            });
            queue.publish(&job).await.unwrap();
        }

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a", "b", "c"]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
