//! Work distribution for transcode jobs.
//!
//! This crate provides:
//! - The work channel contract (publish side and consume side)
//! - In-memory and Redis Streams channels with visibility timeouts
//! - A push adapter that turns polling into handler callbacks
//! - Idempotency stores (memory and Redis) for markers and the job ledger
//! - The job dispatcher that turns completion events into messages

pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod metrics;
pub mod redis_queue;
pub mod subscription;

pub use channel::{Delivery, WorkChannel, WorkSource};
pub use config::{DispatchConfig, QueueConfig};
pub use dispatcher::{CompletionSink, DispatchOutcome, JobDispatcher};
pub use error::{QueueError, QueueResult};
pub use idempotency::{IdempotencyStore, MemoryIdempotencyStore, RedisIdempotencyStore};
pub use memory::MemoryWorkQueue;
pub use redis_queue::RedisWorkQueue;
pub use subscription::{subscribe, DeliveryHandler};
