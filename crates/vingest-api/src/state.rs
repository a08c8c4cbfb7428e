//! Application state.

use std::sync::Arc;

use vingest_storage::ReadThroughCache;
use vingest_upload::UploadSessionManager;

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub uploads: Arc<UploadSessionManager>,
    /// Rendition reads, cached per process and invalidated by workers
    pub renditions: ReadThroughCache,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        uploads: Arc<UploadSessionManager>,
        renditions: ReadThroughCache,
    ) -> Self {
        Self {
            config,
            uploads,
            renditions,
        }
    }
}
