//! Ingestion pipeline
//!
//! One task owns the normalizer, dedup cache and accumulator, and reads the
//! inbound channel. Released batches become mutation plans; each plan is
//! handed to the executor on its own task once a pooled session has been
//! acquired. Acquisition happens on the ingestion task, so an exhausted
//! pool stalls intake instead of queueing work without bound.

use crate::batch::{Batch, BatchAccumulator};
use crate::dedup::DedupCache;
use crate::envelope::RawMessage;
use crate::executor::QueryExecutor;
use crate::metrics::Metrics;
use crate::mutation::build_plan;
use crate::normalizer::{NormalizeOutcome, Normalizer};
use crate::pool::{ExhaustionPolicy, PoolError};
use crate::store::SessionFactory;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub batch_flush_interval: Duration,
    pub max_batch_size: usize,
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,
    pub exhaustion_policy: ExhaustionPolicy,
    pub shutdown_grace: Duration,
}

pub struct Bridge<F: SessionFactory> {
    normalizer: Normalizer,
    dedup: DedupCache,
    accumulator: BatchAccumulator,
    executor: QueryExecutor<F>,
    metrics: Arc<Metrics>,
    policy: ExhaustionPolicy,
    grace: Duration,
    in_flight: JoinSet<bool>,
}

impl<F: SessionFactory> Bridge<F> {
    pub fn new(
        normalizer: Normalizer,
        settings: PipelineSettings,
        executor: QueryExecutor<F>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            normalizer,
            dedup: DedupCache::new(settings.dedup_window, settings.dedup_max_entries),
            accumulator: BatchAccumulator::new(settings.batch_flush_interval, settings.max_batch_size),
            executor,
            metrics,
            policy: settings.exhaustion_policy,
            grace: settings.shutdown_grace,
            in_flight: JoinSet::new(),
        }
    }

    /// Runs until shutdown is signalled or the inbound channel closes, then
    /// flushes, drains in-flight batches and closes the pool.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<RawMessage>, mut shutdown: watch::Receiver<bool>) {
        info!("🚀 Ingestion pipeline running");

        loop {
            let deadline = self.accumulator.deadline();
            let flush_at = tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now));

            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep_until(flush_at), if deadline.is_some() => {
                    if let Some(batch) = self.accumulator.poll_expired(Instant::now()) {
                        self.dispatch(batch).await;
                    }
                }
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!("❌ Batch task failed: {}", e);
                    }
                }
                msg = inbound.recv() => match msg {
                    Some(msg) => self.ingest(msg).await,
                    None => {
                        info!("📭 Inbound channel closed");
                        break;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    async fn ingest(&mut self, msg: RawMessage) {
        self.metrics.messages_received.inc();

        match self.normalizer.normalize(&msg) {
            NormalizeOutcome::Filtered => {
                self.metrics.messages_filtered.inc();
            }
            NormalizeOutcome::Unrouted => {
                self.metrics.messages_unrouted.inc();
                debug!("No route for topic {}", msg.topic);
            }
            NormalizeOutcome::Routed { envelopes, rejected } => {
                for e in rejected {
                    self.metrics.envelopes_rejected.inc();
                    debug!("Rejected: {}", e);
                }

                let now = Instant::now();
                for env in envelopes {
                    if !self.dedup.admit(&env, now) {
                        self.metrics.dedup_hits.inc();
                        continue;
                    }
                    self.metrics.envelopes_forwarded.inc();
                    if let Some(batch) = self.accumulator.push(env, now) {
                        self.dispatch(batch).await;
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        self.metrics.batches_flushed.inc();
        self.metrics.batch_size.observe(batch.len() as f64);

        let opened_at = batch.opened_at;
        let plan = build_plan(batch.envelopes);

        let session = loop {
            match self.executor.pool().acquire().await {
                Ok(session) => {
                    self.metrics.pool_wait_seconds.observe(session.waited().as_secs_f64());
                    break session;
                }
                Err(PoolError::Exhausted(waited)) => {
                    self.metrics.pool_exhausted.inc();
                    match self.policy {
                        ExhaustionPolicy::Wait => {
                            warn!("⚠️  Pool exhausted for {:?}, holding batch of {}", waited, plan.envelope_count);
                        }
                        ExhaustionPolicy::Drop => {
                            self.metrics.batches_failed.inc();
                            warn!("⚠️  Pool exhausted, dropping batch of {}", plan.envelope_count);
                            return;
                        }
                    }
                }
                Err(e) => {
                    self.metrics.batches_failed.inc();
                    error!("❌ Dropping batch of {}: {}", plan.envelope_count, e);
                    return;
                }
            }
        };

        let executor = self.executor.clone();
        self.in_flight
            .spawn(async move { executor.apply(session, plan, opened_at).await });
    }

    async fn shutdown(mut self) {
        let started = Instant::now();
        let remaining = |grace: Duration| grace.saturating_sub(started.elapsed());

        if let Some(batch) = self.accumulator.take() {
            info!("🛑 Flushing open batch of {} envelope(s)", batch.len());
            if tokio::time::timeout(self.grace, self.dispatch(batch)).await.is_err() {
                self.metrics.batches_failed.inc();
                error!("❌ Open batch could not be dispatched within {:?}, dropping it", self.grace);
            }
        }

        let pending = self.in_flight.len();
        if pending > 0 {
            info!("⏳ Waiting for {} in-flight batch(es)", pending);
            let wait = remaining(self.grace);
            let in_flight = &mut self.in_flight;
            let drain = async move { while in_flight.join_next().await.is_some() {} };
            if tokio::time::timeout(wait, drain).await.is_err() {
                self.in_flight.abort_all();
                // Batches that finished in the meantime already counted themselves.
                let mut aborted = 0u64;
                while let Some(joined) = self.in_flight.join_next().await {
                    if matches!(joined, Err(ref e) if e.is_cancelled()) {
                        aborted += 1;
                    }
                }
                self.metrics.batches_failed.inc_by(aborted);
                error!(
                    "❌ Aborted {} in-flight batch(es) still running after {:?}",
                    aborted, self.grace
                );
            }
        }

        self.executor.pool().close(remaining(self.grace)).await;
        info!("👋 Ingestion pipeline stopped");
    }
}
