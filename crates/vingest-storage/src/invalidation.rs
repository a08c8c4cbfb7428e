//! Delivery cache invalidation via Redis Pub/Sub.
//!
//! Workers publish a video's cache prefix once its renditions are stored;
//! every API process subscribed to the channel drops the matching entries
//! from its local cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::delivery::{CacheInvalidator, DeliveryCache};
use crate::error::{StorageError, StorageResult};

/// Pause before resubscribing after the connection drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Channel for publishing and applying cache invalidations.
#[derive(Clone)]
pub struct RedisCacheInvalidation {
    client: redis::Client,
    channel: String,
}

impl RedisCacheInvalidation {
    /// Create a channel named after the deployment's key prefix.
    pub fn new(redis_url: &str, key_prefix: &str) -> StorageResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StorageError::config_error(format!("redis url: {}", e)))?;
        Ok(Self {
            client,
            channel: Self::channel_name(key_prefix),
        })
    }

    pub fn channel_name(key_prefix: &str) -> String {
        format!("{}:cache-invalidate", key_prefix)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Apply published prefixes to `cache` until `shutdown` flips.
    ///
    /// Invalidations published while the subscription is down are missed;
    /// the cache TTL bounds how long such entries stay stale.
    pub fn spawn_listener(
        &self,
        cache: Arc<dyn DeliveryCache>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            info!(channel = %this.channel, "Listening for cache invalidations");
            loop {
                match this.listen(cache.as_ref(), &mut shutdown).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(channel = %this.channel, "Invalidation subscription lost: {}", e);
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!(channel = %this.channel, "Cache invalidation listener stopped");
        })
    }

    /// Ok(()) on shutdown, Err when the subscription breaks.
    async fn listen(
        &self,
        cache: &dyn DeliveryCache,
        shutdown: &mut watch::Receiver<bool>,
    ) -> redis::RedisResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        let mut messages = Box::pin(pubsub.into_on_message());

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            tokio::select! {
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        return Err(redis::RedisError::from((
                            redis::ErrorKind::IoError,
                            "pubsub stream closed",
                        )));
                    };
                    match msg.get_payload::<String>() {
                        Ok(prefix) => {
                            let dropped = cache.invalidate_prefix(&prefix).await;
                            debug!(prefix = %prefix, dropped, "Applied cache invalidation");
                        }
                        Err(e) => warn!("Ignoring unreadable invalidation: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CacheInvalidator for RedisCacheInvalidation {
    /// Publishes the prefix; returns the number of listening processes.
    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let published = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            conn.publish::<_, _, usize>(&self.channel, prefix).await
        }
        .await;

        match published {
            Ok(listeners) => {
                debug!(channel = %self.channel, prefix, listeners, "Published cache invalidation");
                listeners
            }
            Err(e) => {
                warn!(channel = %self.channel, prefix, "Failed to publish cache invalidation: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::LruDeliveryCache;

    #[test]
    fn test_channel_is_scoped_by_key_prefix() {
        let bus = RedisCacheInvalidation::new("redis://localhost:6379", "vingest").unwrap();
        assert_eq!(bus.channel(), "vingest:cache-invalidate");
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_published_prefix_reaches_listener_cache() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let prefix = format!("test-{}", std::process::id());
        let bus = RedisCacheInvalidation::new(&url, &prefix).unwrap();

        let cache = Arc::new(LruDeliveryCache::new(1024, Duration::from_secs(60)));
        cache.put("v1/720p", Arc::new(vec![1, 2])).await;
        cache.put("v2/720p", Arc::new(vec![3, 4])).await;

        let (tx, rx) = watch::channel(false);
        let listener = bus.spawn_listener(cache.clone(), rx);

        let mut delivered = 0;
        for _ in 0..50 {
            delivered = bus.invalidate_prefix("v1/").await;
            if delivered > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(delivered, 1);

        for _ in 0..50 {
            if cache.get("v1/720p").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(cache.get("v1/720p").await.is_none());
        assert!(cache.get("v2/720p").await.is_some());

        tx.send(true).unwrap();
        listener.await.unwrap();
    }
}
