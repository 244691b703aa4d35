//! TTL Cleanup Scheduler
//!
//! Periodically deletes non-root entities whose `last_updated` fell out of
//! the retention window, leaves first, in bounded chunks. A run never
//! exceeds its time budget: whatever is left is deferred to the next run.

use crate::envelope::EntityKind;
use crate::metrics::Metrics;
use crate::mutation::Statement;
use crate::pool::{ConnectionPool, PooledSession};
use crate::store::{RunSummary, SessionFactory, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct CleanupSettings {
    pub interval: Duration,
    pub retention: Duration,
    pub budget: Duration,
    pub chunk_size: usize,
    pub query_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: i64,
    /// Budget ran out or a call failed before every kind was drained.
    pub deferred: bool,
    /// No session could be obtained within the budget.
    pub skipped: bool,
    pub roots_before: Option<i64>,
    pub roots_after: Option<i64>,
}

pub struct CleanupScheduler<F: SessionFactory> {
    pool: ConnectionPool<F>,
    settings: CleanupSettings,
    metrics: Arc<Metrics>,
    /// Duration of the last completed eviction chunk, carried across runs.
    chunk_cost: Mutex<Duration>,
}

/// How a store call ended when it did not succeed.
#[derive(Debug)]
enum CallError {
    /// The run's budget ran out mid-call. The session is still usable.
    BudgetCut,
    Store(StoreError),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::BudgetCut => f.write_str("budget exhausted mid-call"),
            CallError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl<F: SessionFactory> CleanupScheduler<F> {
    pub fn new(pool: ConnectionPool<F>, settings: CleanupSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            settings,
            metrics,
            chunk_cost: Mutex::new(Duration::ZERO),
        }
    }

    /// Runs every `interval` until shutdown. No run starts after the
    /// shutdown signal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        info!(
            "🧹 Cleanup scheduler started (every {:?}, retention {:?}, budget {:?})",
            self.settings.interval, self.settings.retention, self.settings.budget
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.run_once(Utc::now()).await;
                }
            }
        }

        info!("🧹 Cleanup scheduler stopped");
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> CleanupReport {
        let started = Instant::now();
        let deadline = started + self.settings.budget;
        let mut report = CleanupReport::default();

        let mut session = match self.pool.acquire_within(self.settings.budget).await {
            Ok(session) => Some(session),
            Err(e) => {
                self.metrics.cleanup_skipped.inc();
                warn!("⚠️  Skipping cleanup run: {}", e);
                report.skipped = true;
                return report;
            }
        };

        report.roots_before = self.count_roots(&mut session).await;
        if report.roots_before == Some(0) {
            error!("🚨 Scene root missing before cleanup");
        }

        let retention = chrono::Duration::from_std(self.settings.retention).unwrap_or(chrono::Duration::zero());
        let cutoff_ms = (now - retention).timestamp_millis();

        // The first chunk of a run always starts, so one slow chunk cannot
        // stall cleanup for good.
        let mut attempted = false;
        'kinds: for kind in EntityKind::EVICTION_ORDER {
            let Some(statement) = Statement::evict(kind, cutoff_ms, self.settings.chunk_size) else {
                continue;
            };

            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let expected = *self.chunk_cost.lock();
                if remaining.is_zero() || (attempted && remaining < expected) {
                    debug!("Deferring cleanup: {:?} left, a chunk takes about {:?}", remaining, expected);
                    report.deferred = true;
                    break 'kinds;
                }

                attempted = true;
                let chunk_started = Instant::now();
                match self.call(&mut session, &statement, Some(remaining)).await {
                    Ok(summary) => {
                        *self.chunk_cost.lock() = chunk_started.elapsed();
                        report.deleted += summary.count;
                        if summary.count < self.settings.chunk_size as i64 {
                            break;
                        }
                    }
                    Err(e) => {
                        if matches!(e, CallError::BudgetCut) {
                            let mut cost = self.chunk_cost.lock();
                            *cost = (*cost).max(chunk_started.elapsed());
                        }
                        debug!("Cleanup of {} entities stopped: {}", kind, e);
                        report.deferred = true;
                        break 'kinds;
                    }
                }
            }
        }

        report.roots_after = self.count_roots(&mut session).await;
        if report.roots_after == Some(0) {
            error!("🚨 Scene root missing after cleanup");
        }
        drop(session);

        let elapsed = started.elapsed();
        self.metrics.cleanup_runs.inc();
        self.metrics.cleanup_duration_seconds.observe(elapsed.as_secs_f64());
        self.metrics.entities_evicted.inc_by(report.deleted.max(0) as u64);
        if report.deferred {
            self.metrics.cleanup_deferred.inc();
        }

        if report.deleted > 0 || report.deferred {
            debug!(
                "Cleanup evicted {} entities in {:?}{}",
                report.deleted,
                elapsed,
                if report.deferred { " (remainder deferred)" } else { "" }
            );
        }
        report
    }

    async fn count_roots(&self, session: &mut Option<PooledSession<F>>) -> Option<i64> {
        self.call(session, &Statement::CountRoots, None)
            .await
            .ok()
            .map(|summary| summary.count)
    }

    /// One store call, bounded by the query timeout and, when given, by the
    /// remaining budget. Only a store failure (including the query timeout
    /// itself) discards the session; a budget cut leaves it in place.
    async fn call(
        &self,
        session: &mut Option<PooledSession<F>>,
        statement: &Statement,
        budget_left: Option<Duration>,
    ) -> Result<RunSummary, CallError> {
        let Some(active) = session.as_mut() else {
            return Err(CallError::Store(StoreError::Connection("no session".to_string())));
        };

        let query_timeout = self.settings.query_timeout;
        let budget_bound = budget_left.map_or(false, |left| left < query_timeout);
        let limit = budget_left.map_or(query_timeout, |left| left.min(query_timeout));

        let outcome = tokio::time::timeout(limit, active.run(std::slice::from_ref(statement))).await;
        let error = match outcome {
            Ok(Ok(summary)) => return Ok(summary),
            Ok(Err(e)) => e,
            Err(_) if budget_bound => return Err(CallError::BudgetCut),
            Err(_) => StoreError::Timeout,
        };

        if error.is_transient() {
            if let Some(broken) = session.take() {
                broken.discard().await;
            }
        }
        Err(CallError::Store(error))
    }
}
