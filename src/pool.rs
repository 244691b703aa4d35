//! Connection Pool
//!
//! A fixed number of graph sessions shared by ingestion and cleanup. A
//! semaphore bounds how many are borrowed at once; acquisition waits at most
//! the configured timeout. Sessions that failed are discarded and lazily
//! reopened by the next borrower instead of being reused.

use crate::store::{GraphSession, RunSummary, SessionFactory, StoreError};
use crate::mutation::Statement;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session became available within {0:?}")]
    Exhausted(Duration),
    #[error("pool is closed")]
    Closed,
    #[error("failed to open a session: {0}")]
    Connect(#[source] StoreError),
}

/// What the ingestion path does with a batch when the pool stays exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Keep the batch and retry acquisition, delaying further intake.
    Wait,
    /// Drop the batch and count it as failed.
    Drop,
}

impl FromStr for ExhaustionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(ExhaustionPolicy::Wait),
            "drop" => Ok(ExhaustionPolicy::Drop),
            other => Err(format!("unknown exhaustion policy `{}` (expected wait or drop)", other)),
        }
    }
}

struct PoolInner<F: SessionFactory> {
    factory: F,
    idle: Mutex<Vec<F::Session>>,
    permits: Arc<Semaphore>,
    size: usize,
    closing: AtomicBool,
}

pub struct ConnectionPool<F: SessionFactory> {
    inner: Arc<PoolInner<F>>,
    acquire_timeout: Duration,
}

impl<F: SessionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            acquire_timeout: self.acquire_timeout,
        }
    }
}

impl<F: SessionFactory> ConnectionPool<F> {
    /// Opens `size` sessions up front.
    pub async fn connect(factory: F, size: usize, acquire_timeout: Duration) -> Result<Self, PoolError> {
        let size = size.max(1);
        let mut sessions = Vec::with_capacity(size);
        for _ in 0..size {
            sessions.push(factory.connect().await.map_err(PoolError::Connect)?);
        }
        info!("✅ Connection pool ready ({} sessions)", size);

        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                idle: Mutex::new(sessions),
                permits: Arc::new(Semaphore::new(size)),
                size,
                closing: AtomicBool::new(false),
            }),
            acquire_timeout,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    pub async fn acquire(&self) -> Result<PooledSession<F>, PoolError> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Borrows a session, waiting at most `wait`.
    pub async fn acquire_within(&self, wait: Duration) -> Result<PooledSession<F>, PoolError> {
        if self.is_closing() {
            return Err(PoolError::Closed);
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(wait, self.inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Exhausted(wait)),
        };

        let reused = self.inner.idle.lock().pop();
        let session = match reused {
            Some(session) => session,
            None => self.inner.factory.connect().await.map_err(PoolError::Connect)?,
        };

        Ok(PooledSession {
            session: Some(session),
            pool: self.inner.clone(),
            waited: started.elapsed(),
            _permit: permit,
        })
    }

    /// Stops lending sessions, waits up to `grace` for borrowed ones to come
    /// back, then closes every idle session. Returns how many were closed.
    pub async fn close(&self, grace: Duration) -> usize {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let all = self.inner.size as u32;
        let drained = tokio::time::timeout(grace, self.inner.permits.acquire_many(all)).await;
        if drained.is_err() {
            warn!("⚠️  {} session(s) still borrowed after {:?}, closing the rest", self.inner.size - self.idle_count(), grace);
        }
        self.inner.permits.close();

        let sessions: Vec<F::Session> = std::mem::take(&mut *self.inner.idle.lock());
        let closed = sessions.len();
        for session in sessions {
            session.close().await;
        }
        info!("🔌 Connection pool closed ({} sessions)", closed);
        closed
    }
}

/// A borrowed session. Returned to the pool on drop unless discarded.
pub struct PooledSession<F: SessionFactory> {
    session: Option<F::Session>,
    pool: Arc<PoolInner<F>>,
    waited: Duration,
    _permit: OwnedSemaphorePermit,
}

impl<F: SessionFactory> PooledSession<F> {
    /// Time spent waiting for this session.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub async fn run(&mut self, statements: &[Statement]) -> Result<RunSummary, StoreError> {
        match self.session.as_mut() {
            Some(session) => session.run(statements).await,
            None => Err(StoreError::Connection("session was discarded".to_string())),
        }
    }

    /// Closes the underlying session instead of returning it. Its slot is
    /// refilled with a fresh session on a later acquire.
    pub async fn discard(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

impl<F: SessionFactory> Drop for PooledSession<F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            // Sessions returned after the pool closed are simply dropped.
            if !self.pool.permits.is_closed() {
                self.pool.idle.lock().push(session);
            }
        }
    }
}
