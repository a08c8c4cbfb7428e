//! Transcode worker binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vingest_queue::{QueueConfig, RedisIdempotencyStore, RedisWorkQueue};
use vingest_storage::{
    ArtifactStore, FsArtifactStore, R2ArtifactStore, R2Client, R2Config, RedisCacheInvalidation,
};
use vingest_worker::{FfmpegTranscoder, JobExecutor, JobLedger, WorkerConfig, WorkerPool};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,vingest=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// The worker shares artifacts with the API, so only durable backends apply.
fn build_artifacts() -> anyhow::Result<Arc<dyn ArtifactStore>> {
    let backend = std::env::var("STORAGE_BACKEND")
        .unwrap_or_default()
        .to_lowercase();
    if backend == "r2" {
        let config = R2Config::from_env().context("R2 configuration")?;
        info!(bucket = %config.bucket_name, "Using R2 storage");
        return Ok(Arc::new(R2ArtifactStore::new(R2Client::new(&config))));
    }

    let root = std::env::var("STORAGE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data"));
    if backend != "fs" && backend != "filesystem" {
        warn!(backend = %backend, "Unsupported worker storage backend, using filesystem");
    }
    info!(root = %root.display(), "Using filesystem storage");
    Ok(Arc::new(FsArtifactStore::new(root.join("artifacts"))))
}

fn init_metrics() -> anyhow::Result<()> {
    let enabled = std::env::var("METRICS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);
    if !enabled {
        return Ok(());
    }

    let addr: SocketAddr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".to_string())
        .parse()
        .context("Invalid METRICS_ADDR")?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Prometheus exporter")?;
    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting vingest-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    init_metrics()?;

    let queue_config = QueueConfig::from_env();
    config
        .validate_against(queue_config.visibility_timeout)
        .context("Worker timing configuration")?;
    let queue = RedisWorkQueue::new(queue_config.clone()).context("Redis queue")?;
    queue.init().await.context("Redis consumer group")?;
    let source = Arc::new(queue);

    let ledger_store =
        RedisIdempotencyStore::new(&queue_config.redis_url, queue_config.key_prefix.clone())
            .context("Redis ledger store")?;
    let ledger = Arc::new(JobLedger::new(
        Arc::new(ledger_store),
        config.lease_duration,
        config.ledger_ttl,
    ));

    let artifacts = build_artifacts()?;
    let transcoder =
        Arc::new(FfmpegTranscoder::new(artifacts, &config).context("FFmpeg transcoder")?);
    let invalidation = RedisCacheInvalidation::new(&queue_config.redis_url, &queue_config.key_prefix)
        .context("Redis cache invalidation")?;

    let executor = JobExecutor::new(config.clone(), source.clone(), ledger, transcoder)
        .with_invalidator(Arc::new(invalidation));

    let worker_id = std::env::var("WORKER_ID")
        .unwrap_or_else(|_| format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    let mut pool = WorkerPool::new(worker_id, &config, source, Arc::new(executor));
    pool.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");

    pool.stop().await;

    info!("Worker shutdown complete");
    Ok(())
}
