//! Graph store collaborator
//!
//! The core only needs to open sessions and run a statement list on one
//! of them. `bolt` talks to a real Memgraph/Neo4j server; `memory` is an
//! in-process graph with the same semantics used by tests.

pub mod bolt;
#[cfg(test)]
pub mod memory;

use crate::mutation::Statement;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call timed out")]
    Timeout,
    #[error("connection error: {0}")]
    Connection(String),
    #[error("query rejected: {0}")]
    Query(String),
}

impl StoreError {
    /// Timeouts and connection errors are retried; rejected queries are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Connection(_))
    }
}

/// Outcome of one `run` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub statements: usize,
    /// Sum of the count column of statements that return one.
    pub count: i64,
}

#[async_trait]
pub trait GraphSession: Send + 'static {
    /// Runs the statements in order as one unit.
    async fn run(&mut self, statements: &[Statement]) -> Result<RunSummary, StoreError>;

    async fn close(self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: GraphSession;

    async fn connect(&self) -> Result<Self::Session, StoreError>;
}
