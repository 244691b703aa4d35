mod batch;
mod bus;
mod capture;
mod cleanup;
mod config;
mod dedup;
mod envelope;
mod executor;
mod metrics;
mod mutation;
mod normalizer;
mod pipeline;
mod pool;
mod store;

use anyhow::{anyhow, Context, Result};
use capture::CaptureFile;
use chrono::Utc;
use cleanup::{CleanupScheduler, CleanupSettings};
use config::BridgeConfig;
use envelope::EntityKind;
use executor::{QueryExecutor, RetryPolicy};
use metrics::Metrics;
use mutation::Statement;
use normalizer::{Normalizer, TopicFilter};
use pipeline::{Bridge, PipelineSettings};
use pool::ConnectionPool;
use std::sync::Arc;
use std::time::Duration;
use store::bolt::BoltSessionFactory;
use store::{SessionFactory, StoreError};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Every bus topic; the normalizer decides what is kept.
const SUBSCRIBE_ALL: &str = ">";

/// Wait before the next startup attempt: 1s, 2s, 4s, 8s, ...
fn startup_backoff(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt.saturating_sub(1)))
}

/// Connect to Redis with exponential backoff retry logic
async fn connect_redis_with_retry(url: &str, max_retries: u32) -> Result<redis::Client> {

    for attempt in 1..=max_retries {
        info!("🔄 Attempting to connect to the bus at {}... (attempt {}/{})", url, attempt, max_retries);

        let result = match redis::Client::open(url) {
            Ok(client) => client.get_async_connection().await.map(|_| client),
            Err(e) => Err(e),
        };

        match result {
            Ok(client) => {
                info!("✅ Successfully connected to the bus");
                return Ok(client);
            }
            Err(e) => {
                if attempt < max_retries {
                    let wait_time = startup_backoff(attempt);
                    warn!("⚠️  Failed to connect to the bus: {}. Retrying in {:?} (attempt {}/{})...",
                          e, wait_time, attempt, max_retries);
                    sleep(wait_time).await;
                } else {
                    error!("❌ Failed to connect to the bus after {} attempts: {}", max_retries, e);
                    return Err(anyhow!("Bus connection failed after {} retries: {}", max_retries, e));
                }
            }
        }
    }

    Err(anyhow!("Failed to connect to the bus"))
}

/// Open the session pool with exponential backoff retry logic
async fn connect_graph_with_retry(config: &BridgeConfig) -> Result<ConnectionPool<BoltSessionFactory>> {

    let max_retries = config.startup_connect_attempts;
    for attempt in 1..=max_retries {
        info!("🔄 Attempting to connect to the graph store at {}... (attempt {}/{})",
              config.graph_uri, attempt, max_retries);

        let factory = BoltSessionFactory::new(&config.graph_uri, &config.graph_user, &config.graph_password);
        match ConnectionPool::connect(factory, config.pool_size, config.pool_acquire_timeout).await {
            Ok(pool) => {
                info!("✅ Successfully connected to the graph store");
                return Ok(pool);
            }
            Err(e) => {
                if attempt < max_retries {
                    let wait_time = startup_backoff(attempt);
                    warn!("⚠️  Failed to connect to the graph store: {}. Retrying in {:?} (attempt {}/{})...",
                          e, wait_time, attempt, max_retries);
                    sleep(wait_time).await;
                } else {
                    error!("❌ Failed to connect to the graph store after {} attempts: {}", max_retries, e);
                    return Err(anyhow!("Graph store connection failed after {} retries: {}", max_retries, e));
                }
            }
        }
    }

    Err(anyhow!("Failed to connect to the graph store"))
}

/// Create the scene root if this is a fresh graph.
async fn ensure_scene_root<F: SessionFactory>(pool: &ConnectionPool<F>, root_id: &str) -> Result<()> {
    let mut session = pool.acquire().await.context("Failed to borrow a session")?;
    session
        .run(&[Statement::EnsureRoot {
            id: root_id.to_string(),
            at_ms: Utc::now().timestamp_millis(),
        }])
        .await
        .context("Failed to create the scene root")?;
    info!("🌳 Scene root `{}` ready", root_id);
    Ok(())
}

/// Create the `id` lookup index for every label. Each index is its own
/// call, so one existing index does not block the rest. Failures are
/// logged and never fatal.
async fn ensure_indexes<F: SessionFactory>(pool: &ConnectionPool<F>) -> Result<()> {
    let mut session = pool.acquire().await.context("Failed to borrow a session")?;
    let mut created = 0;
    for kind in EntityKind::WRITE_ORDER {
        match session.run(&[Statement::CreateIndex { kind }]).await {
            Ok(_) => created += 1,
            Err(StoreError::Query(msg)) if msg.to_lowercase().contains("already exists") => {
                debug!("Index on :{}(id) already exists", kind.label());
            }
            Err(e) => warn!("⚠️  Could not create index on :{}(id): {}", kind.label(), e),
        }
    }
    info!("📇 Graph indexes ready ({} created)", created);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("🚀 Scene graph bridge starting...");

    // Load configuration
    let config = BridgeConfig::from_env()?;
    let metrics = Arc::new(Metrics::new());

    let filter = TopicFilter::new(&config.topic_allow, &config.topic_deny).context("Invalid topic filter pattern")?;
    let normalizer = Normalizer::new(config.scene_root_id.clone(), filter).context("Invalid topic table")?;

    // Connect to the graph store with retry
    let pool = connect_graph_with_retry(&config).await?;
    ensure_indexes(&pool).await?;
    ensure_scene_root(&pool, &config.scene_root_id).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

    // Message source: a capture file, or the live bus
    let source = match &config.replay_file {
        Some(path) => {
            let capture = CaptureFile::load(path).await?;
            let rx = shutdown_rx.clone();
            tokio::spawn(async move {
                capture::replay_into(capture, inbound_tx, rx).await;
                Ok::<(), anyhow::Error>(())
            })
        }
        None => {
            let client = connect_redis_with_retry(&config.bus_url, config.startup_connect_attempts).await?;
            tokio::spawn(bus::forward_messages(
                client,
                vec![SUBSCRIBE_ALL.to_string()],
                inbound_tx,
                shutdown_rx.clone(),
            ))
        }
    };

    // A failed source is fatal: stop everything in an orderly way
    let fatal_tx = shutdown_tx.clone();
    let source = tokio::spawn(async move {
        let result = source.await.unwrap_or_else(|e| Err(anyhow!("Message source task failed: {}", e)));
        if let Err(e) = &result {
            error!("❌ {:#}", e);
            let _ = fatal_tx.send(true);
        }
        result
    });

    // Setup shutdown signal handler
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Shutdown signal received, flushing and stopping...");
                let _ = signal_tx.send(true);
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    let cleanup = CleanupScheduler::new(
        pool.clone(),
        CleanupSettings {
            interval: config.cleanup_interval,
            retention: config.retention,
            budget: config.cleanup_budget,
            chunk_size: config.cleanup_chunk_size,
            query_timeout: config.query_timeout,
        },
        metrics.clone(),
    );
    let cleanup_task = tokio::spawn(cleanup.run(shutdown_rx.clone()));
    let reporter_task = tokio::spawn(metrics::report_periodically(
        metrics.clone(),
        config.metrics_log_interval,
        shutdown_rx.clone(),
    ));

    let executor = QueryExecutor::new(
        pool.clone(),
        RetryPolicy {
            query_timeout: config.query_timeout,
            max_attempts: config.query_max_attempts,
            backoff_base: config.retry_backoff,
        },
        metrics.clone(),
    );
    let bridge = Bridge::new(
        normalizer,
        PipelineSettings {
            batch_flush_interval: config.batch_flush_interval,
            max_batch_size: config.max_batch_size,
            dedup_window: config.dedup_window,
            dedup_max_entries: config.dedup_max_entries,
            exhaustion_policy: config.exhaustion_policy,
            shutdown_grace: config.shutdown_grace,
        },
        executor,
        metrics.clone(),
    );

    // Runs until shutdown or until the source is exhausted
    bridge.run(inbound_rx, shutdown_rx).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = cleanup_task.await {
        warn!("Cleanup task ended abnormally: {}", e);
    }
    if let Err(e) = reporter_task.await {
        warn!("Metrics reporter ended abnormally: {}", e);
    }

    let s = metrics.snapshot();
    info!(
        "📊 Final: received={} forwarded={} dedup_hits={} rejected={} batches ok={} failed={} evicted={}",
        s.received, s.forwarded, s.dedup_hits, s.rejected, s.batches_succeeded, s.batches_failed, s.evicted
    );
    if let Ok(text) = metrics.encode() {
        debug!("Final metrics:\n{}", text);
    }

    let result = source.await.context("Message source task panicked")?;
    info!("👋 Scene graph bridge shutdown complete");
    result
}
