//! Work channel on Redis Streams.
//!
//! Jobs are stream entries read through a consumer group. Unacked entries
//! stay in the group's pending list; once idle longer than the visibility
//! timeout they are claimed by the next poller.

use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};
use vingest_models::TranscodeJob;

use crate::channel::{Delivery, WorkChannel, WorkSource};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

/// Settles a pending entry only while the caller still owns it.
///
/// KEYS: stream, dlq. ARGV: group, id, consumer, delivery count, op,
/// idle ms, then for `dead` the job payload and reason.
/// Returns 1 when applied, 0 when the entry is no longer pending and
/// -1 when it is pending on another consumer or a later delivery.
const SETTLE_SCRIPT: &str = r#"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #pending == 0 then
    return 0
end
local entry = pending[1]
if entry[2] ~= ARGV[3] or tonumber(entry[4]) ~= tonumber(ARGV[4]) then
    return -1
end
local op = ARGV[5]
if op == 'extend' then
    redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'JUSTID')
elseif op == 'release' then
    redis.call('XCLAIM', KEYS[1], ARGV[1], ARGV[3], 0, ARGV[2], 'IDLE', ARGV[6], 'JUSTID')
else
    if op == 'dead' then
        redis.call('XADD', KEYS[2], '*', 'job', ARGV[7], 'error', ARGV[8],
            'original_id', ARGV[2], 'deliveries', ARGV[4])
    end
    redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
    redis.call('XDEL', KEYS[1], ARGV[2])
end
return 1
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Ack,
    Release,
    Extend,
    DeadLetter,
}

impl Settle {
    fn as_str(&self) -> &'static str {
        match self {
            Settle::Ack => "ack",
            Settle::Release => "release",
            Settle::Extend => "extend",
            Settle::DeadLetter => "dead",
        }
    }
}

/// Redis Streams work channel.
pub struct RedisWorkQueue {
    client: redis::Client,
    config: QueueConfig,
    settle: redis::Script,
}

impl RedisWorkQueue {
    /// Create a new queue handle.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            settle: redis::Script::new(SETTLE_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.stream_name).await?;
        Ok(len)
    }

    /// Get DLQ length.
    pub async fn dlq_len(&self) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.xlen(&self.config.dlq_stream_name).await?;
        Ok(len)
    }

    fn visibility_ms(&self) -> u64 {
        self.config.visibility_timeout.as_millis() as u64
    }

    /// Run one ownership-checked operation on a delivery.
    /// Returns false when the entry is no longer pending at all.
    async fn settle(&self, delivery: &Delivery, op: Settle, extra: &[String]) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let mut invocation = self.settle.prepare_invoke();
        invocation
            .key(&self.config.stream_name)
            .key(&self.config.dlq_stream_name)
            .arg(&self.config.consumer_group)
            .arg(&delivery.delivery_id)
            .arg(&delivery.consumer)
            .arg(delivery.delivery_count)
            .arg(op.as_str())
            .arg(self.visibility_ms());
        for value in extra {
            invocation.arg(value);
        }
        let outcome: i32 = invocation.invoke_async(&mut conn).await?;
        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(QueueError::lease_lost(&delivery.delivery_id, &delivery.consumer)),
        }
    }

    /// Decode an entry, acking it when the payload is unreadable.
    async fn decode(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        entry: &StreamId,
    ) -> Option<TranscodeJob> {
        let payload: Option<String> = entry.get("job");
        let parsed = payload
            .as_deref()
            .map(serde_json::from_str::<TranscodeJob>);
        match parsed {
            Some(Ok(job)) => Some(job),
            other => {
                let reason = match other {
                    Some(Err(e)) => e.to_string(),
                    _ => "missing job field".to_string(),
                };
                warn!(message_id = %entry.id, "Dropping malformed stream entry: {}", reason);
                let acked: Result<(), redis::RedisError> = redis::cmd("XACK")
                    .arg(&self.config.stream_name)
                    .arg(&self.config.consumer_group)
                    .arg(&entry.id)
                    .query_async(conn)
                    .await;
                if let Err(e) = acked {
                    warn!(message_id = %entry.id, "Failed to ack malformed entry: {}", e);
                }
                None
            }
        }
    }

    /// Claim entries whose visibility timeout expired on another consumer.
    async fn claim_expired(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        consumer: &str,
        max: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(self.visibility_ms())
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(self.visibility_ms());
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }
        let claimed: StreamClaimReply = cmd.query_async(conn).await?;

        let mut deliveries = Vec::new();
        for entry in &claimed.ids {
            let previous = pending
                .ids
                .iter()
                .find(|p| p.id == entry.id)
                .map(|p| p.times_delivered as u32)
                .unwrap_or(0);
            if let Some(job) = self.decode(conn, entry).await {
                info!(job_id = %job.job_id, message_id = %entry.id, "Claimed expired job");
                deliveries.push(Delivery {
                    delivery_id: entry.id.clone(),
                    consumer: consumer.to_string(),
                    job,
                    delivery_count: previous + 1,
                });
            }
        }
        Ok(deliveries)
    }
}

#[async_trait]
impl WorkChannel for RedisWorkQueue {
    async fn publish(&self, job: &TranscodeJob) -> QueueResult<String> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job)?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("job")
            .arg(&payload)
            .arg("key")
            .arg(job.idempotency_key())
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::publish_failed(e.to_string()))?;

        info!(job_id = %job.job_id, message_id = %message_id, "Published job");
        Ok(message_id)
    }
}

#[async_trait]
impl WorkSource for RedisWorkQueue {
    async fn poll(&self, consumer: &str, max: usize, wait: Duration) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.connection().await?;
        let max = max.max(1);

        let claimed = self.claim_expired(&mut conn, consumer, max).await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(wait.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::DequeueFailed(e.to_string()))?;

        let mut deliveries = Vec::new();
        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in &stream_key.ids {
                if let Some(job) = self.decode(&mut conn, entry).await {
                    debug!(job_id = %job.job_id, message_id = %entry.id, "Consumed job");
                    deliveries.push(Delivery {
                        delivery_id: entry.id.clone(),
                        consumer: consumer.to_string(),
                        job,
                        delivery_count: 1,
                    });
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        if self.settle(delivery, Settle::Ack, &[]).await? {
            debug!(message_id = %delivery.delivery_id, "Acknowledged job");
        } else {
            debug!(message_id = %delivery.delivery_id, "Ack for unknown message ignored");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> QueueResult<()> {
        // Backdates the idle time so the next poller claims it at once
        if !self.settle(delivery, Settle::Release, &[]).await? {
            return Err(QueueError::DeliveryNotFound(delivery.delivery_id.clone()));
        }
        debug!(message_id = %delivery.delivery_id, "Nacked job");
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> QueueResult<()> {
        let payload = serde_json::to_string(&delivery.job)?;
        let moved = self
            .settle(delivery, Settle::DeadLetter, &[payload, reason.to_string()])
            .await?;
        if !moved {
            debug!(message_id = %delivery.delivery_id, "Dead-letter for unknown message ignored");
            return Ok(());
        }

        warn!(job_id = %delivery.job.job_id, "Moved job to DLQ: {}", reason);
        Ok(())
    }

    async fn extend_visibility(&self, delivery: &Delivery) -> QueueResult<()> {
        // Re-claiming to the same consumer resets the idle timer
        if !self.settle(delivery, Settle::Extend, &[]).await? {
            return Err(QueueError::DeliveryNotFound(delivery.delivery_id.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vingest_models::{Checksum, CompletionEvent, SessionId, VideoId};

    fn test_config() -> QueueConfig {
        QueueConfig {
            stream_name: format!("vingest:test:{}", uuid::Uuid::new_v4()),
            dlq_stream_name: format!("vingest:test-dlq:{}", uuid::Uuid::new_v4()),
            visibility_timeout: Duration::from_millis(200),
            ..QueueConfig::from_env()
        }
    }

    fn job() -> TranscodeJob {
        TranscodeJob::from_completion(&CompletionEvent {
            session_id: SessionId::new(),
            video_id: VideoId::new(),
            artifact_location: "mem://raw".to_string(),
            checksum: Checksum::compute(b"x"),
            size_bytes: 1,
        })
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_publish_poll_ack() {
        let queue = RedisWorkQueue::new(test_config()).unwrap();
        queue.init().await.unwrap();
        queue.publish(&job()).await.unwrap();

        let got = queue.poll("w1", 1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.len(), 1);
        queue.ack(&got[0]).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_expired_entry_is_claimed_by_other_consumer() {
        let queue = RedisWorkQueue::new(test_config()).unwrap();
        queue.init().await.unwrap();
        queue.publish(&job()).await.unwrap();

        let first = queue.poll("w1", 1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.len(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = queue.poll("w2", 1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].delivery_id, first[0].delivery_id);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_dead_letter_moves_entry() {
        let queue = RedisWorkQueue::new(test_config()).unwrap();
        queue.init().await.unwrap();
        queue.publish(&job()).await.unwrap();

        let got = queue.poll("w1", 1, Duration::from_millis(100)).await.unwrap();
        queue.dead_letter(&got[0], "poison").await.unwrap();
        assert_eq!(queue.dlq_len().await.unwrap(), 1);
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_stale_consumer_cannot_settle_claimed_entry() {
        let queue = RedisWorkQueue::new(test_config()).unwrap();
        queue.init().await.unwrap();
        queue.publish(&job()).await.unwrap();

        let stale = queue.poll("w1", 1, Duration::from_millis(100)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let live = queue.poll("w2", 1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(live.len(), 1);

        assert!(matches!(queue.nack(&stale[0]).await, Err(QueueError::LeaseLost(_))));
        assert!(matches!(
            queue.extend_visibility(&stale[0]).await,
            Err(QueueError::LeaseLost(_))
        ));

        let third = queue.poll("w3", 1, Duration::from_millis(50)).await.unwrap();
        assert!(third.is_empty());
        queue.extend_visibility(&live[0]).await.unwrap();
        queue.ack(&live[0]).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }
}
