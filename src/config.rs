use crate::pool::ExhaustionPolicy;
use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DENY: &str = "fps.>,colour-control.>,camera_mode_entry.>";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bus_url: String,
    pub graph_uri: String,
    pub graph_user: String,
    pub graph_password: String,

    pub pool_size: usize,
    pub pool_acquire_timeout: Duration,
    pub exhaustion_policy: ExhaustionPolicy,

    pub batch_flush_interval: Duration,
    pub max_batch_size: usize,
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,

    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_budget: Duration,
    pub cleanup_chunk_size: usize,

    pub query_timeout: Duration,
    pub query_max_attempts: u32,
    pub retry_backoff: Duration,

    pub topic_allow: Vec<String>,
    pub topic_deny: Vec<String>,
    pub scene_root_id: String,

    pub inbound_capacity: usize,
    pub shutdown_grace: Duration,
    pub startup_connect_attempts: u32,
    pub metrics_log_interval: Duration,
    pub replay_file: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bus_url: "redis://localhost:6379".to_string(),
            graph_uri: "bolt://localhost:7687".to_string(),
            graph_user: String::new(),
            graph_password: String::new(),
            pool_size: 15,
            pool_acquire_timeout: Duration::from_millis(100),
            exhaustion_policy: ExhaustionPolicy::Wait,
            batch_flush_interval: Duration::from_millis(5),
            max_batch_size: 200,
            dedup_window: Duration::from_millis(1000),
            dedup_max_entries: 100_000,
            retention: Duration::from_secs(30),
            cleanup_interval: Duration::from_millis(1000),
            cleanup_budget: Duration::from_millis(50),
            cleanup_chunk_size: 500,
            query_timeout: Duration::from_millis(50),
            query_max_attempts: 3,
            retry_backoff: Duration::from_millis(5),
            topic_allow: Vec::new(),
            topic_deny: split_patterns(DEFAULT_DENY),
            scene_root_id: "scene-root".to_string(),
            inbound_capacity: 10_000,
            shutdown_grace: Duration::from_millis(500),
            startup_connect_attempts: 4,
            metrics_log_interval: Duration::from_secs(2),
            replay_file: None,
        }
    }
}

fn split_patterns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Reads and parses `name`, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let d = Self::default();

        let config = BridgeConfig {
            bus_url: env::var("BUS_URL")
                .or_else(|_| env::var("REDIS_URL"))
                .unwrap_or(d.bus_url),
            graph_uri: env::var("GRAPH_URI")
                .or_else(|_| env::var("NEO4J_URI"))
                .unwrap_or(d.graph_uri),
            graph_user: env::var("GRAPH_USER").unwrap_or(d.graph_user),
            graph_password: env::var("GRAPH_PASSWORD").unwrap_or(d.graph_password),
            pool_size: parse_var("POOL_SIZE", d.pool_size)?,
            pool_acquire_timeout: millis_var("POOL_ACQUIRE_TIMEOUT_MS", d.pool_acquire_timeout)?,
            exhaustion_policy: parse_var("POOL_EXHAUSTION_POLICY", d.exhaustion_policy)?,
            batch_flush_interval: millis_var("BATCH_FLUSH_INTERVAL_MS", d.batch_flush_interval)?,
            max_batch_size: parse_var("MAX_BATCH_SIZE", d.max_batch_size)?,
            dedup_window: millis_var("DEDUP_WINDOW_MS", d.dedup_window)?,
            dedup_max_entries: parse_var("DEDUP_MAX_ENTRIES", d.dedup_max_entries)?,
            retention: parse_var("TTL_RETENTION_SECS", d.retention.as_secs()).map(Duration::from_secs)?,
            cleanup_interval: millis_var("CLEANUP_INTERVAL_MS", d.cleanup_interval)?,
            cleanup_budget: millis_var("CLEANUP_BUDGET_MS", d.cleanup_budget)?,
            cleanup_chunk_size: parse_var("CLEANUP_CHUNK_SIZE", d.cleanup_chunk_size)?,
            query_timeout: millis_var("QUERY_TIMEOUT_MS", d.query_timeout)?,
            query_max_attempts: parse_var("QUERY_MAX_ATTEMPTS", d.query_max_attempts)?,
            retry_backoff: millis_var("RETRY_BACKOFF_MS", d.retry_backoff)?,
            topic_allow: env::var("TOPIC_ALLOW")
                .map(|raw| split_patterns(&raw))
                .unwrap_or(d.topic_allow),
            topic_deny: env::var("TOPIC_DENY")
                .map(|raw| split_patterns(&raw))
                .unwrap_or(d.topic_deny),
            scene_root_id: env::var("SCENE_ROOT_ID").unwrap_or(d.scene_root_id),
            inbound_capacity: parse_var("INBOUND_CAPACITY", d.inbound_capacity)?,
            shutdown_grace: millis_var("SHUTDOWN_GRACE_MS", d.shutdown_grace)?,
            startup_connect_attempts: parse_var("STARTUP_CONNECT_ATTEMPTS", d.startup_connect_attempts)?,
            metrics_log_interval: parse_var("METRICS_LOG_INTERVAL_SECS", d.metrics_log_interval.as_secs())
                .map(Duration::from_secs)?,
            replay_file: env::var("REPLAY_FILE").ok().filter(|p| !p.is_empty()).map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("POOL_SIZE", self.pool_size),
            ("MAX_BATCH_SIZE", self.max_batch_size),
            ("DEDUP_MAX_ENTRIES", self.dedup_max_entries),
            ("CLEANUP_CHUNK_SIZE", self.cleanup_chunk_size),
            ("INBOUND_CAPACITY", self.inbound_capacity),
            ("QUERY_MAX_ATTEMPTS", self.query_max_attempts as usize),
            ("STARTUP_CONNECT_ATTEMPTS", self.startup_connect_attempts as usize),
        ];
        for (name, value) in sizes {
            if value == 0 {
                bail!("{} must be greater than zero", name);
            }
        }

        let intervals = [
            ("POOL_ACQUIRE_TIMEOUT_MS", self.pool_acquire_timeout),
            ("BATCH_FLUSH_INTERVAL_MS", self.batch_flush_interval),
            ("TTL_RETENTION_SECS", self.retention),
            ("CLEANUP_INTERVAL_MS", self.cleanup_interval),
            ("CLEANUP_BUDGET_MS", self.cleanup_budget),
            ("QUERY_TIMEOUT_MS", self.query_timeout),
            ("METRICS_LOG_INTERVAL_SECS", self.metrics_log_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                bail!("{} must be greater than zero", name);
            }
        }

        if self.dedup_window >= self.retention {
            bail!(
                "DEDUP_WINDOW_MS ({:?}) must be shorter than the retention window ({:?})",
                self.dedup_window,
                self.retention
            );
        }
        if self.scene_root_id.trim().is_empty() {
            bail!("SCENE_ROOT_ID must not be empty");
        }
        Ok(())
    }
}
