//! Delivery cache for transcoded output.
//!
//! A size-bounded LRU with a per-entry TTL, plus a read-through wrapper that
//! fills the cache from the artifact store on a miss. Keys are
//! `{video_id}/{rendition}` so every entry for a video can be dropped with
//! one prefix invalidation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;
use vingest_models::VideoId;

use crate::artifact::ArtifactStore;
use crate::error::StorageResult;

/// Cache prefix covering every rendition of a video.
pub fn video_cache_prefix(video_id: &VideoId) -> String {
    format!("{}/", video_id)
}

/// Cache key of one rendition.
pub fn rendition_cache_key(video_id: &VideoId, rendition: &str) -> String {
    format!("{}{}", video_cache_prefix(video_id), rendition)
}

/// Cache contract used by readers.
#[async_trait]
pub trait DeliveryCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>>;

    async fn put(&self, key: &str, data: Arc<Vec<u8>>);

    /// Remove every entry whose key starts with `prefix`. Returns the count.
    async fn invalidate_prefix(&self, prefix: &str) -> usize;
}

/// Drops stale entries after a video's renditions change.
///
/// Workers hold one of these without holding the cache itself; the cache
/// may live in another process.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Returns how many entries (or remote subscribers) were reached.
    async fn invalidate_prefix(&self, prefix: &str) -> usize;
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

struct Entry {
    data: Arc<Vec<u8>>,
    expires_at: Instant,
    tick: u64,
}

#[derive(Default)]
struct LruState {
    entries: HashMap<String, Entry>,
    // access tick -> key, oldest first
    order: BTreeMap<u64, String>,
    bytes: usize,
    next_tick: u64,
}

impl LruState {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                self.bytes -= entry.data.len();
                true
            }
            None => false,
        }
    }

    fn pop_oldest(&mut self) -> bool {
        let oldest = self.order.iter().next().map(|(_, key)| key.clone());
        match oldest {
            Some(key) => self.remove(&key),
            None => false,
        }
    }
}

/// In-process LRU cache bounded by total payload bytes.
pub struct LruDeliveryCache {
    max_bytes: usize,
    ttl: Duration,
    state: Mutex<LruState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl LruDeliveryCache {
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        Self {
            max_bytes,
            ttl,
            state: Mutex::new(LruState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: state.entries.len(),
            bytes: state.bytes,
        }
    }
}

#[async_trait]
impl DeliveryCache for LruDeliveryCache {
    async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let fresh = match state.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(Arc::clone(&entry.data)),
            _ => None,
        };
        if fresh.is_none() {
            state.remove(key);
        }

        match fresh {
            Some(data) => {
                state.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(data)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn put(&self, key: &str, data: Arc<Vec<u8>>) {
        if data.len() > self.max_bytes {
            debug!(key, bytes = data.len(), "Entry larger than cache, not caching");
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.remove(key);

        while state.bytes + data.len() > self.max_bytes {
            if !state.pop_oldest() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = state.next_tick;
        state.next_tick += 1;
        state.bytes += data.len();
        state.order.insert(tick, key.to_string());
        state.entries.insert(
            key.to_string(),
            Entry {
                data,
                expires_at: Instant::now() + self.ttl,
                tick,
            },
        );
    }

    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }
}

#[async_trait]
impl CacheInvalidator for LruDeliveryCache {
    async fn invalidate_prefix(&self, prefix: &str) -> usize {
        DeliveryCache::invalidate_prefix(self, prefix).await
    }
}

/// Serves artifacts through a delivery cache, falling back to the store.
#[derive(Clone)]
pub struct ReadThroughCache {
    cache: Arc<dyn DeliveryCache>,
    store: Arc<dyn ArtifactStore>,
}

impl ReadThroughCache {
    pub fn new(cache: Arc<dyn DeliveryCache>, store: Arc<dyn ArtifactStore>) -> Self {
        Self { cache, store }
    }

    /// Fetch `location`, caching it under `key`.
    pub async fn fetch(&self, key: &str, location: &str) -> StorageResult<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.get(key).await {
            return Ok(hit);
        }
        let data = Arc::new(self.store.read(location).await?);
        self.cache.put(key, Arc::clone(&data)).await;
        Ok(data)
    }

    /// Fetch the artifact written under `key` in the store, caching it as `cache_key`.
    pub async fn fetch_key(&self, cache_key: &str, key: &str) -> StorageResult<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.get(cache_key).await {
            return Ok(hit);
        }
        let location = self.store.locate(key)?;
        self.fetch(cache_key, &location).await
    }

    pub fn cache(&self) -> &Arc<dyn DeliveryCache> {
        &self.cache
    }
}
