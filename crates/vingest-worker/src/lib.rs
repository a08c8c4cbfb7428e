//! Transcode worker.
//!
//! This crate provides:
//! - A shared job ledger so duplicate deliveries run the transcode once
//! - The delivery handler that claims, transcodes, acks, nacks or dead-letters
//! - A pool of push subscriptions over a work source
//! - An ffmpeg transcoder adapter

pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod transcoder;

pub use config::{RenditionSpec, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use ledger::{ClaimOutcome, JobLedger, LedgerEntry};
pub use logging::JobLogger;
pub use pool::WorkerPool;
pub use transcoder::{FfmpegTranscoder, RenditionOutput, TranscodeOutput, Transcoder};
