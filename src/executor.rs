//! Query Executor
//!
//! Runs one mutation plan on one pooled session with a per-call timeout.
//! Timeouts and connection errors retry the whole statement list on a fresh
//! session with exponential backoff; after the last attempt the batch is
//! dropped and counted.

use crate::metrics::Metrics;
use crate::mutation::MutationPlan;
use crate::pool::{ConnectionPool, PooledSession};
use crate::store::{RunSummary, SessionFactory, StoreError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("statement list rejected by the store: {0}")]
    Rejected(#[source] StoreError),
    #[error("gave up after {attempts} attempt(s): {last}")]
    GaveUp { attempts: u32, last: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub query_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Delay after the given failed attempt: base, 2x base, 4x base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

pub struct QueryExecutor<F: SessionFactory> {
    pool: ConnectionPool<F>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl<F: SessionFactory> Clone for QueryExecutor<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            policy: self.policy,
            metrics: self.metrics.clone(),
        }
    }
}

impl<F: SessionFactory> QueryExecutor<F> {
    pub fn new(pool: ConnectionPool<F>, policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self { pool, policy, metrics }
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    /// Applies `plan` starting on `session`, recording the outcome.
    /// `opened_at` is when the batch's first envelope was buffered.
    pub async fn apply(&self, session: PooledSession<F>, plan: MutationPlan, opened_at: Instant) -> bool {
        match self.execute(session, &plan).await {
            Ok(summary) => {
                self.metrics.batches_succeeded.inc();
                self.metrics.record_batch_latency(opened_at.elapsed());
                debug!(
                    "Applied batch: {} envelope(s), {} entities, {} statement(s)",
                    plan.envelope_count, plan.entity_count, summary.statements
                );
                true
            }
            Err(e) => {
                self.metrics.batches_failed.inc();
                error!(
                    "❌ Dropping batch of {} envelope(s) ({} entities): {}",
                    plan.envelope_count, plan.entity_count, e
                );
                false
            }
        }
    }

    pub async fn execute(&self, session: PooledSession<F>, plan: &MutationPlan) -> Result<RunSummary, ExecError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut next = Some(session);
        let mut last = String::new();

        for attempt in 1..=max_attempts {
            let session = match next.take() {
                Some(session) => Some(session),
                None => match self.pool.acquire().await {
                    Ok(session) => {
                        self.metrics.pool_wait_seconds.observe(session.waited().as_secs_f64());
                        Some(session)
                    }
                    Err(e) => {
                        last = e.to_string();
                        None
                    }
                },
            };

            if let Some(mut session) = session {
                let outcome = tokio::time::timeout(self.policy.query_timeout, session.run(&plan.statements)).await;
                match outcome {
                    Ok(Ok(summary)) => return Ok(summary),
                    Ok(Err(e)) if !e.is_transient() => return Err(ExecError::Rejected(e)),
                    Ok(Err(e)) => {
                        last = e.to_string();
                        session.discard().await;
                    }
                    Err(_) => {
                        last = StoreError::Timeout.to_string();
                        session.discard().await;
                    }
                }
            }

            if attempt < max_attempts {
                let delay = self.policy.backoff(attempt);
                warn!(
                    "⚠️  Batch attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, max_attempts, last, delay
                );
                self.metrics.batch_retries.inc();
                tokio::time::sleep(delay).await;
            }
        }

        Err(ExecError::GaveUp {
            attempts: max_attempts,
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            query_timeout: Duration::from_millis(50),
            max_attempts: 4,
            backoff_base: Duration::from_millis(5),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(10));
        assert_eq!(policy.backoff(3), Duration::from_millis(20));
    }
}
