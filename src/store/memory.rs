//! In-memory graph store used by tests. Mirrors the merge, guard and
//! eviction semantics of the Cypher statements and records how it was used.

use super::{GraphSession, RunSummary, SessionFactory, StoreError};
use crate::envelope::{Attributes, EntityKind, Relationship};
use crate::mutation::Statement;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type NodeKey = (EntityKind, String);

#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub attributes: Attributes,
    pub created_at: i64,
    pub last_updated: Option<i64>,
    pub stub: bool,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    nodes: BTreeMap<NodeKey, StoredNode>,
    edges: BTreeSet<(Relationship, String, String)>,
    indexes: BTreeSet<EntityKind>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<GraphState>,
    latency: Mutex<Duration>,
    fail_next: AtomicUsize,
    reject_next: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    runs: AtomicUsize,
    entity_writes: AtomicUsize,
    connects: AtomicUsize,
    closed: AtomicUsize,
}

/// Shared handle to the in-memory graph and its usage counters.
#[derive(Clone, Default)]
pub struct MemoryGraph {
    inner: Arc<Inner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root_id: &str) -> Self {
        let graph = Self::new();
        graph.inner.state.lock().nodes.insert(
            (EntityKind::Root, root_id.to_string()),
            StoredNode {
                attributes: Attributes::from([("id".to_string(), Value::String(root_id.to_string()))]),
                created_at: 0,
                last_updated: Some(0),
                stub: false,
            },
        );
        graph
    }

    pub fn factory(&self) -> MemorySessionFactory {
        MemorySessionFactory { graph: self.clone() }
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// The next `n` runs fail with a connection error.
    pub fn fail_next_runs(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// The next `n` runs fail with a non-retryable query error.
    pub fn reject_next_runs(&self, n: usize) {
        self.inner.reject_next.store(n, Ordering::SeqCst);
    }

    pub fn node(&self, kind: EntityKind, id: &str) -> Option<StoredNode> {
        self.inner.state.lock().nodes.get(&(kind, id.to_string())).cloned()
    }

    pub fn node_count(&self, kind: EntityKind) -> usize {
        self.inner.state.lock().nodes.keys().filter(|(k, _)| *k == kind).count()
    }

    pub fn edges(&self, rel: Relationship) -> Vec<(String, String)> {
        self.inner
            .state
            .lock()
            .edges
            .iter()
            .filter(|(r, _, _)| *r == rel)
            .map(|(_, p, c)| (p.clone(), c.clone()))
            .collect()
    }

    /// Edges with a missing endpoint.
    pub fn dangling_edges(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .edges
            .iter()
            .filter(|(rel, parent, child)| {
                !state.nodes.contains_key(&(rel.parent_kind(), parent.clone()))
                    || !state.nodes.contains_key(&(rel.child_kind(), child.clone()))
            })
            .count()
    }

    pub fn indexed_kinds(&self) -> Vec<EntityKind> {
        self.inner.state.lock().indexes.iter().copied().collect()
    }

    pub fn runs(&self) -> usize {
        self.inner.runs.load(Ordering::SeqCst)
    }

    /// Entity rows received by successful runs.
    pub fn entity_writes(&self) -> usize {
        self.inner.entity_writes.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_runs(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ============================================================================
// Statement semantics
// ============================================================================

fn not_newer(last_updated: Option<i64>, received_at: i64) -> bool {
    last_updated.map_or(true, |lu| lu <= received_at)
}

fn apply(state: &mut GraphState, statement: &Statement) -> (i64, usize) {
    match statement {
        Statement::EnsureRoot { id, at_ms } => {
            state
                .nodes
                .entry((EntityKind::Root, id.clone()))
                .or_insert_with(|| StoredNode {
                    attributes: Attributes::from([("id".to_string(), Value::String(id.clone()))]),
                    created_at: *at_ms,
                    last_updated: Some(*at_ms),
                    stub: false,
                });
            (0, 0)
        }
        Statement::UpsertEntities { kind, rows } => {
            for row in rows {
                let key = (*kind, row.id.clone());
                if *kind == EntityKind::Root {
                    if let Some(node) = state.nodes.get_mut(&key) {
                        if not_newer(node.last_updated, row.received_at_ms) {
                            node.attributes.extend(row.attributes.clone());
                            node.attributes.insert("id".to_string(), Value::String(row.id.clone()));
                            node.last_updated = Some(row.received_at_ms);
                        }
                    }
                    continue;
                }

                let node = state.nodes.entry(key).or_insert_with(|| StoredNode {
                    attributes: Attributes::new(),
                    created_at: row.received_at_ms,
                    last_updated: None,
                    stub: false,
                });
                if node.stub || not_newer(node.last_updated, row.received_at_ms) {
                    let mut attributes = row.attributes.clone();
                    for carried in kind.carried_attributes() {
                        if !attributes.contains_key(*carried) {
                            if let Some(kept) = node.attributes.get(*carried) {
                                attributes.insert(carried.to_string(), kept.clone());
                            }
                        }
                    }
                    attributes.insert("id".to_string(), Value::String(row.id.clone()));
                    node.attributes = attributes;
                    node.last_updated = Some(row.received_at_ms);
                    node.stub = false;
                }
            }
            (0, rows.len())
        }
        Statement::MergeEntities { kind, rows } => {
            for row in rows {
                let node = state.nodes.entry((*kind, row.id.clone())).or_insert_with(|| StoredNode {
                    attributes: Attributes::new(),
                    created_at: row.received_at_ms,
                    last_updated: None,
                    stub: false,
                });
                if node.stub || not_newer(node.last_updated, row.received_at_ms) {
                    node.attributes.extend(row.attributes.clone());
                    node.attributes.insert("id".to_string(), Value::String(row.id.clone()));
                    node.last_updated = Some(row.received_at_ms);
                    node.stub = false;
                }
            }
            (0, rows.len())
        }
        Statement::UpsertEdges { rel, rows } => {
            for row in rows {
                let child_key = (rel.child_kind(), row.child_id.clone());
                match state.nodes.get(&child_key) {
                    Some(child) if not_newer(child.last_updated, row.received_at_ms) => {}
                    _ => continue,
                }

                let parent_key = (rel.parent_kind(), row.parent_id.clone());
                if !state.nodes.contains_key(&parent_key) {
                    if rel.parent_kind() == EntityKind::Root {
                        continue;
                    }
                    state.nodes.insert(
                        parent_key,
                        StoredNode {
                            attributes: Attributes::from([(
                                "id".to_string(),
                                Value::String(row.parent_id.clone()),
                            )]),
                            created_at: row.received_at_ms,
                            last_updated: Some(row.received_at_ms),
                            stub: true,
                        },
                    );
                }

                state
                    .edges
                    .retain(|(r, p, c)| !(r == rel && *c == row.child_id && *p != row.parent_id));
                state.edges.insert((*rel, row.parent_id.clone(), row.child_id.clone()));
            }
            (0, 0)
        }
        Statement::EvictExpired {
            kind,
            cutoff_ms,
            limit,
        } => {
            let doomed: Vec<NodeKey> = state
                .nodes
                .iter()
                .filter(|((k, _), node)| k == kind && node.last_updated.map_or(false, |lu| lu < *cutoff_ms))
                .take(*limit)
                .map(|(key, _)| key.clone())
                .collect();

            for key in &doomed {
                state.nodes.remove(key);
                state.edges.retain(|(rel, parent, child)| {
                    let as_parent = rel.parent_kind() == key.0 && *parent == key.1;
                    let as_child = rel.child_kind() == key.0 && *child == key.1;
                    !(as_parent || as_child)
                });
            }
            (doomed.len() as i64, 0)
        }
        Statement::CreateIndex { kind } => {
            state.indexes.insert(*kind);
            (0, 0)
        }
        Statement::CountRoots => {
            let roots = state.nodes.keys().filter(|(k, _)| *k == EntityKind::Root).count();
            (roots as i64, 0)
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Tracks concurrent runs, including ones cancelled by a timeout.
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MemorySession {
    graph: MemoryGraph,
}

#[async_trait]
impl GraphSession for MemorySession {
    async fn run(&mut self, statements: &[Statement]) -> Result<RunSummary, StoreError> {
        let inner = &self.graph.inner;
        let _in_flight = InFlight::enter(inner);

        let latency = *inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let result = if MemoryGraph::take_one(&inner.fail_next) {
            Err(StoreError::Connection("injected connection reset".to_string()))
        } else if MemoryGraph::take_one(&inner.reject_next) {
            Err(StoreError::Query("injected query rejection".to_string()))
        } else if let Some(kind) = statements.iter().find_map(|statement| match statement {
            Statement::CreateIndex { kind } if inner.state.lock().indexes.contains(kind) => Some(*kind),
            _ => None,
        }) {
            Err(StoreError::Query(format!("Index on :{}(id) already exists", kind.label())))
        } else {
            // Apply to a copy and swap it in, so a run is all-or-nothing.
            let mut state = inner.state.lock();
            let mut working = state.clone();
            let mut summary = RunSummary::default();
            let mut writes = 0;
            for statement in statements {
                let (count, rows) = apply(&mut working, statement);
                summary.statements += 1;
                summary.count += count;
                writes += rows;
            }
            *state = working;
            inner.entity_writes.fetch_add(writes, Ordering::SeqCst);
            Ok(summary)
        };

        inner.runs.fetch_add(1, Ordering::SeqCst);
        result
    }

    async fn close(self) {
        self.graph.inner.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct MemorySessionFactory {
    graph: MemoryGraph,
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, StoreError> {
        self.graph.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            graph: self.graph.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::{EdgeRow, EntityRow};
    use serde_json::json;

    fn camera_row(id: &str, fov: i64, ms: i64) -> EntityRow {
        EntityRow {
            id: id.to_string(),
            attributes: Attributes::from([("fov".to_string(), json!(fov))]),
            received_at_ms: ms,
        }
    }

    #[tokio::test]
    async fn test_older_write_does_not_overwrite_newer() {
        let graph = MemoryGraph::with_root("scene-root");
        let mut session = graph.factory().connect().await.unwrap();

        let newer = Statement::UpsertEntities {
            kind: EntityKind::Camera,
            rows: vec![camera_row("cam1", 65, 20)],
        };
        let older = Statement::UpsertEntities {
            kind: EntityKind::Camera,
            rows: vec![camera_row("cam1", 60, 10)],
        };
        session.run(&[newer]).await.unwrap();
        session.run(&[older]).await.unwrap();

        let node = graph.node(EntityKind::Camera, "cam1").unwrap();
        assert_eq!(node.attributes.get("fov"), Some(&json!(65)));
        assert_eq!(node.last_updated, Some(20));
    }

    #[tokio::test]
    async fn test_stub_parent_is_replaced_by_real_write() {
        let graph = MemoryGraph::with_root("scene-root");
        let mut session = graph.factory().connect().await.unwrap();

        session
            .run(&[
                Statement::UpsertEntities {
                    kind: EntityKind::Track,
                    rows: vec![EntityRow {
                        id: "cam9:players:1".to_string(),
                        attributes: Attributes::new(),
                        received_at_ms: 50,
                    }],
                },
                Statement::UpsertEdges {
                    rel: Relationship::HasTrack,
                    rows: vec![EdgeRow {
                        parent_id: "cam9".to_string(),
                        child_id: "cam9:players:1".to_string(),
                        received_at_ms: 50,
                    }],
                },
            ])
            .await
            .unwrap();
        assert!(graph.node(EntityKind::Camera, "cam9").unwrap().stub);

        session
            .run(&[Statement::UpsertEntities {
                kind: EntityKind::Camera,
                rows: vec![camera_row("cam9", 40, 30)],
            }])
            .await
            .unwrap();

        let camera = graph.node(EntityKind::Camera, "cam9").unwrap();
        assert!(!camera.stub);
        assert_eq!(camera.attributes.get("fov"), Some(&json!(40)));
        assert_eq!(camera.created_at, 50);
    }

    #[tokio::test]
    async fn test_merge_survives_a_later_replace() {
        let graph = MemoryGraph::with_root("scene-root");
        let mut session = graph.factory().connect().await.unwrap();

        session
            .run(&[
                Statement::UpsertEntities {
                    kind: EntityKind::Camera,
                    rows: vec![camera_row("cam1", 60, 10)],
                },
                Statement::MergeEntities {
                    kind: EntityKind::Camera,
                    rows: vec![EntityRow {
                        id: "cam1".to_string(),
                        attributes: Attributes::from([(
                            "gimbal_position".to_string(),
                            json!(r#"{"pan":10.0}"#),
                        )]),
                        received_at_ms: 11,
                    }],
                },
            ])
            .await
            .unwrap();
        let merged = graph.node(EntityKind::Camera, "cam1").unwrap();
        assert_eq!(merged.attributes.get("fov"), Some(&json!(60)));
        assert!(merged.attributes.contains_key("gimbal_position"));

        session
            .run(&[Statement::UpsertEntities {
                kind: EntityKind::Camera,
                rows: vec![camera_row("cam1", 70, 12)],
            }])
            .await
            .unwrap();
        let replaced = graph.node(EntityKind::Camera, "cam1").unwrap();
        assert_eq!(replaced.attributes.get("fov"), Some(&json!(70)));
        assert_eq!(replaced.attributes.get("gimbal_position"), Some(&json!(r#"{"pan":10.0}"#)));
    }

    #[tokio::test]
    async fn test_injected_failure_leaves_state_untouched() {
        let graph = MemoryGraph::with_root("scene-root");
        let mut session = graph.factory().connect().await.unwrap();
        graph.fail_next_runs(1);

        let err = session
            .run(&[Statement::UpsertEntities {
                kind: EntityKind::Camera,
                rows: vec![camera_row("cam1", 60, 1)],
            }])
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(graph.node(EntityKind::Camera, "cam1").is_none());
        assert_eq!(graph.entity_writes(), 0);
    }
}
