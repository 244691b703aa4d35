//! Bolt Graph Store
//!
//! Runs statement lists against Memgraph or Neo4j through `neo4rs`, one
//! explicit transaction per list. Each session owns a single Bolt
//! connection so the pool, not the driver, decides concurrency.

use super::{GraphSession, RunSummary, SessionFactory, StoreError};
use crate::envelope::Attributes;
use crate::mutation::{EdgeRow, EntityRow, Statement};
use async_trait::async_trait;
use neo4rs::{query, BoltNull, BoltType, ConfigBuilder, Graph, Query};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

// ============================================================================
// Helper: Convert to BoltType-compatible values
// ============================================================================

fn json_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => (*b).into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or(0.0).into(),
        },
        Value::String(s) => s.clone().into(),
        Value::Array(items) => items.iter().map(json_to_bolt).collect::<Vec<BoltType>>().into(),
        Value::Object(_) => value.to_string().into(),
    }
}

fn attributes_to_map(attributes: &Attributes) -> HashMap<String, BoltType> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), json_to_bolt(v)))
        .collect()
}

fn entity_row_to_map(row: &EntityRow) -> HashMap<String, BoltType> {
    let mut m: HashMap<String, BoltType> = HashMap::new();
    m.insert("id".to_string(), row.id.clone().into());
    m.insert("attrs".to_string(), attributes_to_map(&row.attributes).into());
    m.insert("received_at".to_string(), row.received_at_ms.into());
    m
}

fn edge_row_to_map(row: &EdgeRow) -> HashMap<String, BoltType> {
    let mut m: HashMap<String, BoltType> = HashMap::new();
    m.insert("parent_id".to_string(), row.parent_id.clone().into());
    m.insert("child_id".to_string(), row.child_id.clone().into());
    m.insert("received_at".to_string(), row.received_at_ms.into());
    m
}

fn to_query(statement: &Statement) -> Query {
    let q = query(&statement.cypher());
    match statement {
        Statement::EnsureRoot { id, at_ms } => q.param("id", id.clone()).param("at", *at_ms),
        Statement::UpsertEntities { rows, .. } | Statement::MergeEntities { rows, .. } => {
            let rows: Vec<HashMap<String, BoltType>> = rows.iter().map(entity_row_to_map).collect();
            q.param("rows", rows)
        }
        Statement::UpsertEdges { rows, .. } => {
            let rows: Vec<HashMap<String, BoltType>> = rows.iter().map(edge_row_to_map).collect();
            q.param("rows", rows)
        }
        Statement::EvictExpired {
            cutoff_ms, limit, ..
        } => q.param("cutoff", *cutoff_ms).param("limit", *limit as i64),
        Statement::CountRoots | Statement::CreateIndex { .. } => q,
    }
}

/// Driver errors carry the server's failure code in their message; client
/// errors (syntax, constraint, type) are not worth retrying.
fn classify(error: neo4rs::Error) -> StoreError {
    let text = error.to_string();
    if text.contains("ClientError") || text.contains("SyntaxError") || text.contains("TypeError") {
        StoreError::Query(text)
    } else {
        StoreError::Connection(text)
    }
}

// ============================================================================
// Sessions
// ============================================================================

pub struct BoltSession {
    id: Uuid,
    graph: Graph,
}

impl BoltSession {
    /// Index DDL is not allowed inside an explicit transaction, so each one
    /// runs in auto-commit mode.
    async fn run_schema(&self, statements: &[Statement]) -> Result<RunSummary, neo4rs::Error> {
        let mut summary = RunSummary::default();
        for statement in statements {
            self.graph.run(to_query(statement)).await?;
            summary.statements += 1;
        }
        Ok(summary)
    }

    async fn run_in_txn(&self, statements: &[Statement]) -> Result<RunSummary, neo4rs::Error> {
        let mut txn = self.graph.start_txn().await?;
        let mut summary = RunSummary::default();

        for statement in statements {
            let q = to_query(statement);
            match statement.count_column() {
                Some(column) => {
                    let mut stream = match txn.execute(q).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = txn.rollback().await;
                            return Err(e);
                        }
                    };
                    loop {
                        match stream.next(txn.handle()).await {
                            Ok(Some(row)) => summary.count += row.get::<i64>(column).unwrap_or(0),
                            Ok(None) => break,
                            Err(e) => {
                                let _ = txn.rollback().await;
                                return Err(e);
                            }
                        }
                    }
                }
                None => {
                    if let Err(e) = txn.run(q).await {
                        let _ = txn.rollback().await;
                        return Err(e);
                    }
                }
            }
            summary.statements += 1;
        }

        txn.commit().await?;
        Ok(summary)
    }
}

#[async_trait]
impl GraphSession for BoltSession {
    async fn run(&mut self, statements: &[Statement]) -> Result<RunSummary, StoreError> {
        if statements.is_empty() {
            return Ok(RunSummary::default());
        }
        let outcome = if statements.iter().all(Statement::is_schema) {
            self.run_schema(statements).await
        } else {
            self.run_in_txn(statements).await
        };
        outcome.map_err(|e| {
            let classified = classify(e);
            debug!("Statement list failed on session {}: {}", self.id, classified);
            classified
        })
    }

    async fn close(self) {
        debug!("Closing graph session {}", self.id);
        drop(self.graph);
    }
}

pub struct BoltSessionFactory {
    uri: String,
    user: String,
    password: String,
}

impl BoltSessionFactory {
    pub fn new(uri: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for BoltSessionFactory {
    type Session = BoltSession;

    async fn connect(&self) -> Result<BoltSession, StoreError> {
        let config = ConfigBuilder::default()
            .uri(self.uri.as_str())
            .user(self.user.as_str())
            .password(self.password.as_str())
            .max_connections(1)
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let graph = Graph::connect(config).await.map_err(|e| {
            warn!("⚠️  Failed to open graph session at {}: {}", self.uri, e);
            StoreError::Connection(e.to_string())
        })?;

        let id = Uuid::new_v4();
        debug!("Opened graph session {} at {}", id, self.uri);
        Ok(BoltSession { id, graph })
    }
}
