//! Storage backends for the upload pipeline.
//!
//! This crate provides:
//! - Chunk stores keyed by (session, index): memory, filesystem, R2
//! - Artifact stores for assembled uploads: memory, filesystem, R2 multipart
//! - Session metadata stores: memory, filesystem, Redis
//! - A size-bounded delivery cache with read-through from the artifact store
//! - Cross-process cache invalidation over Redis Pub/Sub

pub mod artifact;
pub mod chunk_store;
pub mod client;
pub mod delivery;
pub mod error;
pub mod fs;
pub mod invalidation;
pub mod r2;
pub mod redis_sessions;
pub mod session_store;

pub use artifact::{ArtifactReader, ArtifactStore, ArtifactWriter, MemoryArtifactStore};
pub use chunk_store::{ChunkStore, MemoryChunkStore};
pub use client::{R2Client, R2Config};
pub use delivery::{
    rendition_cache_key, video_cache_prefix, CacheInvalidator, CacheStats, DeliveryCache,
    LruDeliveryCache, ReadThroughCache,
};
pub use error::{StorageError, StorageResult};
pub use fs::{FsArtifactStore, FsChunkStore, FsSessionStore};
pub use invalidation::RedisCacheInvalidation;
pub use r2::{R2ArtifactStore, R2ChunkStore};
pub use redis_sessions::RedisSessionStore;
pub use session_store::{MemorySessionStore, SessionStore};
