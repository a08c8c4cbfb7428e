//! Background sweeper for upload sessions.
//!
//! Runs periodically to:
//! - Expire open sessions past their deadline and release their chunks
//! - Purge terminal sessions past the retention window
//! - Retry completion events the dispatcher has not accepted yet

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info};

use crate::config::SweepConfig;
use crate::manager::UploadSessionManager;

/// Counts from a single sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub purged: usize,
    pub redispatched: usize,
}

pub struct SessionSweeper {
    manager: Arc<UploadSessionManager>,
    config: SweepConfig,
}

impl SessionSweeper {
    pub fn new(manager: Arc<UploadSessionManager>, config: SweepConfig) -> Self {
        Self { manager, config }
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Session sweeper is disabled");
            return;
        }

        info!("Starting session sweeper (interval: {:?})", self.config.interval);
        let mut ticker = interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                _ = shutdown.changed() => {
                    info!("Session sweeper stopping");
                    break;
                }
            }
        }
    }

    /// Run a single sweep cycle.
    pub async fn sweep_once(&self) -> SweepReport {
        let now = Utc::now();
        let report = SweepReport {
            expired: self.manager.expire_stale_sessions(now).await,
            purged: self.manager.purge_retired(now).await,
            redispatched: self.manager.redispatch_pending().await,
        };

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                purged = report.purged,
                redispatched = report.redispatched,
                "Session sweep completed"
            );
        } else {
            debug!("Session sweep found nothing to do");
        }
        report
    }
}
