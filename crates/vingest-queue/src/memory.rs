//! In-process work queue with consumer-group semantics.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use vingest_models::TranscodeJob;

use crate::channel::{Delivery, WorkChannel, WorkSource};
use crate::error::{QueueError, QueueResult};

struct Message {
    job: TranscodeJob,
    delivery_count: u32,
    lease: Option<Lease>,
}

struct Lease {
    consumer: String,
    visible_at: Instant,
}

impl Message {
    /// Whether `delivery` is the current lease on this message.
    ///
    /// A consumer that lost the message to a visibility timeout holds an
    /// older delivery count, even if the same consumer polled it again.
    fn leased_to(&self, delivery: &Delivery) -> bool {
        self.delivery_count == delivery.delivery_count
            && self
                .lease
                .as_ref()
                .is_some_and(|lease| lease.consumer == delivery.consumer)
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<u64>,
    messages: HashMap<u64, Message>,
    dead: Vec<(TranscodeJob, String)>,
    next_id: u64,
}

impl QueueState {
    /// Return expired leases to the ready queue; yields the next expiry, if any.
    fn reclaim_expired(&mut self, now: Instant) -> Option<Instant> {
        let mut next_expiry: Option<Instant> = None;
        let mut expired = Vec::new();
        for (id, message) in &self.messages {
            if let Some(lease) = &message.lease {
                if lease.visible_at <= now {
                    expired.push(*id);
                } else {
                    next_expiry = Some(match next_expiry {
                        Some(t) => t.min(lease.visible_at),
                        None => lease.visible_at,
                    });
                }
            }
        }
        expired.sort_unstable();
        for id in expired {
            if let Some(message) = self.messages.get_mut(&id) {
                if let Some(lease) = message.lease.take() {
                    debug!(message_id = id, consumer = %lease.consumer, "Visibility timeout expired");
                }
            }
            self.ready.push_back(id);
        }
        next_expiry
    }
}

/// Work queue held in memory.
///
/// Serves as both channel ends; cloned handles are not provided, share it
/// behind an `Arc`.
pub struct MemoryWorkQueue {
    visibility_timeout: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryWorkQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Messages not yet acked or dead-lettered.
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Jobs moved to the dead letter queue, with reasons.
    pub fn dead_letters(&self) -> Vec<(TranscodeJob, String)> {
        self.lock().dead.clone()
    }

    fn parse_id(delivery: &Delivery) -> QueueResult<u64> {
        delivery
            .delivery_id
            .parse()
            .map_err(|_| QueueError::DeliveryNotFound(delivery.delivery_id.clone()))
    }

    fn take_ready(&self, consumer: &str, max: usize) -> (Vec<Delivery>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.lock();
        let next_expiry = state.reclaim_expired(now);

        let mut out = Vec::new();
        while out.len() < max {
            let Some(id) = state.ready.pop_front() else {
                break;
            };
            // acked while waiting in the ready queue
            let Some(message) = state.messages.get_mut(&id) else {
                continue;
            };
            message.delivery_count += 1;
            message.lease = Some(Lease {
                consumer: consumer.to_string(),
                visible_at: now + self.visibility_timeout,
            });
            out.push(Delivery {
                delivery_id: id.to_string(),
                consumer: consumer.to_string(),
                job: message.job.clone(),
                delivery_count: message.delivery_count,
            });
        }
        (out, next_expiry)
    }
}

#[async_trait]
impl WorkChannel for MemoryWorkQueue {
    async fn publish(&self, job: &TranscodeJob) -> QueueResult<String> {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.messages.insert(
                id,
                Message {
                    job: job.clone(),
                    delivery_count: 0,
                    lease: None,
                },
            );
            state.ready.push_back(id);
            id
        };
        self.notify.notify_waiters();
        debug!(job_id = %job.job_id, message_id = id, "Published job");
        Ok(id.to_string())
    }
}

#[async_trait]
impl WorkSource for MemoryWorkQueue {
    async fn poll(&self, consumer: &str, max: usize, wait: Duration) -> QueueResult<Vec<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (deliveries, next_expiry) = self.take_ready(consumer, max.max(1));
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let id = Self::parse_id(delivery)?;
        let mut state = self.lock();
        match state.messages.get(&id).map(|m| m.leased_to(delivery)) {
            None => debug!(message_id = id, "Ack for unknown message ignored"),
            Some(false) => {
                return Err(QueueError::lease_lost(&delivery.delivery_id, &delivery.consumer));
            }
            Some(true) => {
                state.messages.remove(&id);
            }
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> QueueResult<()> {
        let id = Self::parse_id(delivery)?;
        {
            let mut state = self.lock();
            let Some(message) = state.messages.get_mut(&id) else {
                return Err(QueueError::DeliveryNotFound(delivery.delivery_id.clone()));
            };
            if !message.leased_to(delivery) {
                return Err(QueueError::lease_lost(&delivery.delivery_id, &delivery.consumer));
            }
            message.lease = None;
            state.ready.push_back(id);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        let id = Self::parse_id(delivery)?;
        let mut state = self.lock();
        if state.messages.get(&id).is_some_and(|m| !m.leased_to(delivery)) {
            return Err(QueueError::lease_lost(&delivery.delivery_id, &delivery.consumer));
        }
        let job = match state.messages.remove(&id) {
            Some(message) => message.job,
            None => delivery.job.clone(),
        };
        warn!(job_id = %job.job_id, reason, "Moved job to DLQ");
        state.dead.push((job, reason.to_string()));
        Ok(())
    }

    async fn extend_visibility(&self, delivery: &Delivery) -> QueueResult<()> {
        let id = Self::parse_id(delivery)?;
        let mut state = self.lock();
        let message = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| QueueError::DeliveryNotFound(delivery.delivery_id.clone()))?;
        if !message.leased_to(delivery) {
            return Err(QueueError::lease_lost(&delivery.delivery_id, &delivery.consumer));
        }
        if let Some(lease) = &mut message.lease {
            lease.visible_at = Instant::now() + self.visibility_timeout;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vingest_models::{Checksum, CompletionEvent, SessionId, VideoId};

    fn job(session: &str) -> TranscodeJob {
        TranscodeJob::from_completion(&CompletionEvent {
            session_id: SessionId::from(session),
            video_id: VideoId::new(),
            artifact_location: "mem://raw".to_string(),
            checksum: Checksum::compute(b"x"),
            size_bytes: 1,
        })
    }

    #[tokio::test]
    async fn test_poll_returns_published_job() {
        let queue = MemoryWorkQueue::new(Duration::from_secs(30));
        queue.publish(&job("s1")).await.unwrap();

        let got = queue.poll("w1", 10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].delivery_count, 1);
        assert_eq!(got[0].consumer, "w1");

        // invisible to others while leased
        let other = queue.poll("w2", 10, Duration::from_millis(10)).await.unwrap();
        assert!(other.is_empty());

        queue.ack(&got[0]).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_unacked_message_redelivered_after_visibility_timeout() {
        let queue = MemoryWorkQueue::new(Duration::from_millis(50));
        queue.publish(&job("s1")).await.unwrap();

        let first = queue.poll("w1", 1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = queue.poll("w2", 1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_count, 2);
        assert_eq!(second[0].job.job_id, first[0].job.job_id);
    }

    #[tokio::test]
    async fn test_nack_makes_message_visible_immediately() {
        let queue = MemoryWorkQueue::new(Duration::from_secs(30));
        queue.publish(&job("s1")).await.unwrap();

        let first = queue.poll("w1", 1, Duration::from_millis(10)).await.unwrap();
        queue.nack(&first[0]).await.unwrap();

        let second = queue.poll("w2", 1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_extend_visibility_keeps_message_hidden() {
        let queue = MemoryWorkQueue::new(Duration::from_millis(80));
        queue.publish(&job("s1")).await.unwrap();
        let first = queue.poll("w1", 1, Duration::from_millis(10)).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            queue.extend_visibility(&first[0]).await.unwrap();
        }
        let other = queue.poll("w2", 1, Duration::from_millis(20)).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let queue = std::sync::Arc::new(MemoryWorkQueue::new(Duration::from_secs(30)));
        let poller = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.poll("w1", 1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&job("s1")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), poller)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_removes_message() {
        let queue = MemoryWorkQueue::new(Duration::from_secs(30));
        queue.publish(&job("s1")).await.unwrap();
        let got = queue.poll("w1", 1, Duration::from_millis(10)).await.unwrap();

        queue.dead_letter(&got[0], "poison").await.unwrap();
        assert!(queue.is_empty());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, "poison");
    }

    #[tokio::test]
    async fn test_stale_consumer_cannot_touch_reassigned_message() {
        let queue = MemoryWorkQueue::new(Duration::from_millis(50));
        queue.publish(&job("s1")).await.unwrap();

        let stale = queue.poll("w1", 1, Duration::from_millis(10)).await.unwrap();
        let live = queue.poll("w2", 1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(live.len(), 1);

        let err = queue.nack(&stale[0]).await.unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost(_)));
        assert!(queue.extend_visibility(&stale[0]).await.is_err());
        assert!(queue.ack(&stale[0]).await.is_err());
        assert!(queue.dead_letter(&stale[0], "stale").await.is_err());

        // the live lease is untouched
        let third = queue.poll("w3", 1, Duration::from_millis(20)).await.unwrap();
        assert!(third.is_empty());
        queue.extend_visibility(&live[0]).await.unwrap();
        assert!(queue.dead_letters().is_empty());
        queue.ack(&live[0]).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_same_consumer_redelivery_invalidates_old_delivery() {
        let queue = MemoryWorkQueue::new(Duration::from_millis(50));
        queue.publish(&job("s1")).await.unwrap();

        let old = queue.poll("w1", 1, Duration::from_millis(10)).await.unwrap();
        let new = queue.poll("w1", 1, Duration::from_millis(500)).await.unwrap();
        assert_eq!(new[0].delivery_count, 2);

        assert!(queue.nack(&old[0]).await.is_err());
        queue.nack(&new[0]).await.unwrap();
        let again = queue.poll("w2", 1, Duration::from_millis(10)).await.unwrap();
        assert_eq!(again.len(), 1);
    }
}
