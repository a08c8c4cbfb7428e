//! Resumable chunked uploads.
//!
//! This crate provides:
//! - The upload session state machine (init, chunk, finish, status, abort)
//! - Ordered assembly of verified chunks into an artifact
//! - Hand-off of completed uploads to a completion sink
//! - A background sweeper for expiry, retention and deferred dispatch

pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
mod session;
pub mod sweeper;

pub use config::{SweepConfig, UploadConfig};
pub use error::{UploadError, UploadResult};
pub use manager::UploadSessionManager;
pub use sweeper::{SessionSweeper, SweepReport};
