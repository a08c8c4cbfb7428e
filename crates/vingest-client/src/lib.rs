//! Resilient client for the upload service and the job dispatcher.
//!
//! Every remote call runs through one loop:
//! - per-call timeout
//! - retry with exponential backoff and full jitter, driven by a policy
//! - a circuit breaker per dependency
//!
//! Transports: HTTP (reqwest) and in-process adapters.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod http;
pub mod local;
pub mod metrics;
pub mod resilient;
pub mod retry;
pub mod service;
pub mod uploader;

pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use http::HttpUploadService;
pub use local::{LocalDispatchService, LocalUploadService};
pub use resilient::{ResilientClient, ResilientDispatchService, ResilientUploadService};
pub use retry::{CallKind, RetryPolicy};
pub use service::{DispatchService, UploadService};
pub use uploader::{ChunkedUploader, UploadReport, UploadSource};
