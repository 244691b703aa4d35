//! Metrics Recorder
//!
//! Counters and histograms for every stage of the bridge, kept in a
//! Prometheus registry, plus a bounded window of recent batch latencies for
//! the periodic log summary.

use parking_lot::Mutex;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const LATENCY_WINDOW: usize = 1024;

/// 0.1ms .. ~1.6s
fn latency_histogram() -> Histogram {
    Histogram::new(exponential_buckets(0.0001, 2.0, 15))
}

pub struct Metrics {
    registry: Registry,

    // -- Intake --
    pub messages_received: Counter,
    pub messages_filtered: Counter,
    pub messages_unrouted: Counter,
    pub envelopes_rejected: Counter,
    pub envelopes_forwarded: Counter,
    pub dedup_hits: Counter,

    // -- Writes --
    pub batches_flushed: Counter,
    pub batches_succeeded: Counter,
    pub batches_failed: Counter,
    pub batch_retries: Counter,
    pub pool_exhausted: Counter,
    pub batch_size: Histogram,
    pub batch_latency_seconds: Histogram,
    pub pool_wait_seconds: Histogram,

    // -- Cleanup --
    pub entities_evicted: Counter,
    pub cleanup_runs: Counter,
    pub cleanup_deferred: Counter,
    pub cleanup_skipped: Counter,
    pub cleanup_duration_seconds: Histogram,

    recent_latencies: Mutex<VecDeque<f64>>,
}

/// Point-in-time view used by the log reporter and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub filtered: u64,
    pub unrouted: u64,
    pub rejected: u64,
    pub forwarded: u64,
    pub dedup_hits: u64,
    pub batches_flushed: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub retries: u64,
    pub pool_exhausted: u64,
    pub evicted: u64,
    pub cleanup_runs: u64,
    pub cleanup_deferred: u64,
    pub cleanup_skipped: u64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("bridge");

        let counter = |registry: &mut Registry, name: &str, help: &str| {
            let c = Counter::default();
            registry.register(name, help, c.clone());
            c
        };
        let histogram = |registry: &mut Registry, name: &str, help: &str, h: Histogram| {
            registry.register(name, help, h.clone());
            h
        };

        let messages_received = counter(&mut registry, "messages_received", "Bus messages received");
        let messages_filtered = counter(&mut registry, "messages_filtered", "Messages dropped by the topic filter");
        let messages_unrouted = counter(&mut registry, "messages_unrouted", "Messages matching no topic rule");
        let envelopes_rejected = counter(&mut registry, "envelopes_rejected", "Payloads or elements failing validation");
        let envelopes_forwarded = counter(&mut registry, "envelopes_forwarded", "Envelopes handed to the accumulator");
        let dedup_hits = counter(&mut registry, "dedup_hits", "Envelopes suppressed as unchanged repeats");

        let batches_flushed = counter(&mut registry, "batches_flushed", "Batches released by the accumulator");
        let batches_succeeded = counter(&mut registry, "batches_succeeded", "Batches applied to the store");
        let batches_failed = counter(&mut registry, "batches_failed", "Batches dropped after failing");
        let batch_retries = counter(&mut registry, "batch_retries", "Statement list retries");
        let pool_exhausted = counter(&mut registry, "pool_exhausted", "Session acquisitions that timed out");
        let batch_size = histogram(
            &mut registry,
            "batch_size",
            "Envelopes per flushed batch",
            Histogram::new(exponential_buckets(1.0, 2.0, 10)),
        );
        let batch_latency_seconds = histogram(
            &mut registry,
            "batch_latency_seconds",
            "Time from first buffered envelope to store commit",
            latency_histogram(),
        );
        let pool_wait_seconds = histogram(
            &mut registry,
            "pool_wait_seconds",
            "Time spent waiting for a pooled session",
            latency_histogram(),
        );

        let entities_evicted = counter(&mut registry, "entities_evicted", "Entities deleted by TTL cleanup");
        let cleanup_runs = counter(&mut registry, "cleanup_runs", "Cleanup runs executed");
        let cleanup_deferred = counter(&mut registry, "cleanup_deferred", "Cleanup runs that left work for later");
        let cleanup_skipped = counter(&mut registry, "cleanup_skipped", "Cleanup runs skipped for lack of a session");
        let cleanup_duration_seconds = histogram(
            &mut registry,
            "cleanup_duration_seconds",
            "Wall time of one cleanup run",
            latency_histogram(),
        );

        Self {
            registry,
            messages_received,
            messages_filtered,
            messages_unrouted,
            envelopes_rejected,
            envelopes_forwarded,
            dedup_hits,
            batches_flushed,
            batches_succeeded,
            batches_failed,
            batch_retries,
            pool_exhausted,
            batch_size,
            batch_latency_seconds,
            pool_wait_seconds,
            entities_evicted,
            cleanup_runs,
            cleanup_deferred,
            cleanup_skipped,
            cleanup_duration_seconds,
            recent_latencies: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub fn record_batch_latency(&self, latency: Duration) {
        let secs = latency.as_secs_f64();
        self.batch_latency_seconds.observe(secs);

        let mut window = self.recent_latencies.lock();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(secs * 1000.0);
    }

    /// Average and p95 of the recent batch latencies, in milliseconds.
    pub fn latency_summary(&self) -> (f64, f64) {
        let mut samples: Vec<f64> = self.recent_latencies.lock().iter().copied().collect();
        if samples.is_empty() {
            return (0.0, 0.0);
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let rank = ((samples.len() as f64) * 0.95).ceil() as usize;
        let p95 = samples[rank.saturating_sub(1).min(samples.len() - 1)];
        (avg, p95)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg_latency_ms, p95_latency_ms) = self.latency_summary();
        MetricsSnapshot {
            received: self.messages_received.get(),
            filtered: self.messages_filtered.get(),
            unrouted: self.messages_unrouted.get(),
            rejected: self.envelopes_rejected.get(),
            forwarded: self.envelopes_forwarded.get(),
            dedup_hits: self.dedup_hits.get(),
            batches_flushed: self.batches_flushed.get(),
            batches_succeeded: self.batches_succeeded.get(),
            batches_failed: self.batches_failed.get(),
            retries: self.batch_retries.get(),
            pool_exhausted: self.pool_exhausted.get(),
            evicted: self.entities_evicted.get(),
            cleanup_runs: self.cleanup_runs.get(),
            cleanup_deferred: self.cleanup_deferred.get(),
            cleanup_skipped: self.cleanup_skipped.get(),
            avg_latency_ms,
            p95_latency_ms,
        }
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Logs a one-line summary every `every` until shutdown.
pub async fn report_periodically(metrics: Arc<Metrics>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let s = metrics.snapshot();
                info!(
                    "📊 received={} forwarded={} dedup_hits={} rejected={} batches ok={} failed={} latency avg={:.2}ms p95={:.2}ms evicted={}",
                    s.received,
                    s.forwarded,
                    s.dedup_hits,
                    s.rejected,
                    s.batches_succeeded,
                    s.batches_failed,
                    s.avg_latency_ms,
                    s.p95_latency_ms,
                    s.evicted
                );
            }
        }
    }
}
