//! Axum API server binary.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vingest_api::{create_router, metrics, ApiConfig, AppState, QueueBackend, StorageBackend};
use vingest_client::{ClientConfig, LocalDispatchService, ResilientClient, ResilientDispatchService};
use vingest_queue::{
    DispatchConfig, IdempotencyStore, JobDispatcher, MemoryIdempotencyStore, MemoryWorkQueue,
    QueueConfig, RedisIdempotencyStore, RedisWorkQueue, WorkChannel,
};
use vingest_storage::{
    ArtifactStore, ChunkStore, DeliveryCache, FsArtifactStore, FsChunkStore, FsSessionStore,
    LruDeliveryCache, MemoryArtifactStore, MemoryChunkStore, MemorySessionStore, R2ArtifactStore,
    R2ChunkStore, R2Client, R2Config, ReadThroughCache, RedisCacheInvalidation, RedisSessionStore,
    SessionStore,
};
use vingest_upload::{SessionSweeper, SweepConfig, UploadConfig, UploadSessionManager};

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
                    .with_thread_ids(false),
            )
            .with(env_filter)
            .init();
    }
}

struct Storage {
    chunks: Arc<dyn ChunkStore>,
    artifacts: Arc<dyn ArtifactStore>,
    sessions: Arc<dyn SessionStore>,
}

fn build_storage(backend: &StorageBackend) -> anyhow::Result<Storage> {
    let storage = match backend {
        StorageBackend::Memory => {
            warn!("Using in-memory storage; uploads do not survive a restart");
            Storage {
                chunks: Arc::new(MemoryChunkStore::new()),
                artifacts: Arc::new(MemoryArtifactStore::new()),
                sessions: Arc::new(MemorySessionStore::new()),
            }
        }
        StorageBackend::Filesystem { root } => {
            info!(root = %root.display(), "Using filesystem storage");
            Storage {
                chunks: Arc::new(FsChunkStore::new(root.join("chunks"))),
                artifacts: Arc::new(FsArtifactStore::new(root.join("artifacts"))),
                sessions: Arc::new(FsSessionStore::new(root.join("sessions"))),
            }
        }
        StorageBackend::R2 => {
            let config = R2Config::from_env().context("R2 configuration")?;
            info!(bucket = %config.bucket_name, "Using R2 storage, session metadata in Redis");
            let client = R2Client::new(&config);
            let queue_config = QueueConfig::from_env();
            Storage {
                chunks: Arc::new(R2ChunkStore::new(client.clone(), config.chunk_prefix.clone())),
                artifacts: Arc::new(R2ArtifactStore::new(client)),
                sessions: Arc::new(
                    RedisSessionStore::new(&queue_config.redis_url, queue_config.key_prefix)
                        .context("Redis session store")?,
                ),
            }
        }
    };
    Ok(storage)
}

async fn build_queue(
    backend: &QueueBackend,
) -> anyhow::Result<(Arc<dyn WorkChannel>, Arc<dyn IdempotencyStore>)> {
    let config = QueueConfig::from_env();
    let channel: Arc<dyn WorkChannel>;
    let markers: Arc<dyn IdempotencyStore>;
    match backend {
        QueueBackend::Memory => {
            warn!("Using in-memory work queue; no worker process can consume it");
            channel = Arc::new(MemoryWorkQueue::new(config.visibility_timeout));
            markers = Arc::new(MemoryIdempotencyStore::new());
        }
        QueueBackend::Redis => {
            let queue = RedisWorkQueue::new(config.clone()).context("Redis queue")?;
            queue.init().await.context("Redis consumer group")?;
            info!(stream = %config.stream_name, "Using Redis work queue");
            channel = Arc::new(queue);
            markers = Arc::new(
                RedisIdempotencyStore::new(&config.redis_url, config.key_prefix.clone())
                    .context("Redis idempotency store")?,
            );
        }
    }
    Ok((channel, markers))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Starting vingest-api");

    let config = ApiConfig::from_env();
    info!("API config: host={}, port={}", config.host, config.port);

    let storage = build_storage(&config.storage)?;
    let (channel, markers) = build_queue(&config.queue).await?;

    let dispatcher = Arc::new(JobDispatcher::new(channel, markers, DispatchConfig::from_env()));
    let sink = Arc::new(ResilientDispatchService::new(
        Arc::new(LocalDispatchService::new(dispatcher)),
        ResilientClient::from_config("dispatcher", &ClientConfig::from_env()),
    ));

    let cache: Arc<dyn DeliveryCache> =
        Arc::new(LruDeliveryCache::new(config.cache_max_bytes, config.cache_ttl));
    let renditions = ReadThroughCache::new(Arc::clone(&cache), Arc::clone(&storage.artifacts));

    let uploads = Arc::new(
        UploadSessionManager::new(UploadConfig::from_env(), storage.chunks, storage.artifacts, sink)
            .with_session_store(storage.sessions),
    );

    let metrics_enabled = std::env::var("METRICS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);
    let metrics_handle = if metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("Prometheus recorder")?)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // workers only run against the Redis queue, so only then can they invalidate
    let invalidation_task = match config.queue {
        QueueBackend::Redis => {
            let queue_config = QueueConfig::from_env();
            let bus = RedisCacheInvalidation::new(&queue_config.redis_url, &queue_config.key_prefix)
                .context("Redis cache invalidation")?;
            Some(bus.spawn_listener(cache, shutdown_rx.clone()))
        }
        QueueBackend::Memory => None,
    };

    let sweeper = SessionSweeper::new(Arc::clone(&uploads), SweepConfig::from_env());
    let sweeper_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    let app = create_router(AppState::new(config.clone(), uploads, renditions), metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper_task.await;
    if let Some(task) = invalidation_task {
        let _ = task.await;
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for CTRL+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
