//! Axum HTTP API for resumable uploads.
//!
//! Routes under `/api/v1/uploads` expose the upload session manager and
//! `/api/v1/videos` serves renditions through the delivery cache; the
//! binary wires storage and queue backends and runs the session sweeper.

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::{ApiConfig, QueueBackend, StorageBackend};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
