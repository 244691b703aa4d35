//! Mutation Builder
//!
//! Turns a batch of envelopes into an ordered list of idempotent graph
//! statements: entity upserts in parent-before-child order, then the
//! ownership edges that reference them. All conditional logic lives in the
//! statements themselves as merge semantics.

use crate::envelope::{Attributes, EntityKind, Envelope, Relationship, WriteMode};
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub id: String,
    pub attributes: Attributes,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub parent_id: String,
    pub child_id: String,
    pub received_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Creates the scene root if it does not exist yet.
    EnsureRoot { id: String, at_ms: i64 },
    UpsertEntities {
        kind: EntityKind,
        rows: Vec<EntityRow>,
    },
    /// Merges attributes into entities, creating them if needed.
    MergeEntities {
        kind: EntityKind,
        rows: Vec<EntityRow>,
    },
    UpsertEdges {
        rel: Relationship,
        rows: Vec<EdgeRow>,
    },
    /// Deletes up to `limit` entities of `kind` last updated before
    /// `cutoff_ms`, together with their edges. Returns `deleted`.
    EvictExpired {
        kind: EntityKind,
        cutoff_ms: i64,
        limit: usize,
    },
    /// Returns `roots`, the number of scene root nodes.
    CountRoots,
    /// Creates the `id` lookup index for `kind`.
    CreateIndex { kind: EntityKind },
}

impl Statement {
    /// Schema statements that must run outside an explicit transaction.
    pub fn is_schema(&self) -> bool {
        matches!(self, Statement::CreateIndex { .. })
    }

    /// Eviction statement for `kind`. The root kind is never evictable.
    pub fn evict(kind: EntityKind, cutoff_ms: i64, limit: usize) -> Option<Statement> {
        if kind == EntityKind::Root {
            return None;
        }
        Some(Statement::EvictExpired {
            kind,
            cutoff_ms,
            limit,
        })
    }

    /// Column holding the single integer this statement returns, if any.
    pub fn count_column(&self) -> Option<&'static str> {
        match self {
            Statement::EvictExpired { .. } => Some("deleted"),
            Statement::CountRoots => Some("roots"),
            _ => None,
        }
    }

    pub fn cypher(&self) -> String {
        match self {
            Statement::EnsureRoot { .. } => {
                "MERGE (r:SceneRoot {id: $id})
                 ON CREATE SET r.created_at = $at, r.last_updated = $at"
                    .to_string()
            }
            Statement::UpsertEntities { kind: EntityKind::Root, .. } => {
                "UNWIND $rows AS row
                 MATCH (n:SceneRoot {id: row.id})
                 WHERE n.last_updated IS NULL OR n.last_updated <= row.received_at
                 SET n += row.attrs
                 SET n.id = row.id, n.last_updated = row.received_at"
                    .to_string()
            }
            Statement::UpsertEntities { kind, .. } => {
                let carried = kind.carried_attributes();
                let keep: String = carried
                    .iter()
                    .map(|a| format!(", n.{a} AS kept_{a}"))
                    .collect();
                let restore: String = carried
                    .iter()
                    .map(|a| format!(", n.{a} = coalesce(row.attrs.{a}, kept_{a})"))
                    .collect();
                format!(
                    "UNWIND $rows AS row
                 MERGE (n:{label} {{id: row.id}})
                 ON CREATE SET n.created_at = row.received_at
                 WITH n, row
                 WHERE n._stub IS NOT NULL OR n.last_updated IS NULL OR n.last_updated <= row.received_at
                 WITH n, row, n.created_at AS created_at{keep}
                 SET n = row.attrs
                 SET n.id = row.id, n.created_at = created_at, n.last_updated = row.received_at{restore}",
                    label = kind.label(),
                    keep = keep,
                    restore = restore
                )
            }
            Statement::MergeEntities { kind, .. } => format!(
                "UNWIND $rows AS row
                 MERGE (n:{label} {{id: row.id}})
                 ON CREATE SET n.created_at = row.received_at
                 WITH n, row
                 WHERE n._stub IS NOT NULL OR n.last_updated IS NULL OR n.last_updated <= row.received_at
                 SET n += row.attrs
                 SET n.id = row.id, n.last_updated = row.received_at
                 REMOVE n._stub",
                label = kind.label()
            ),
            Statement::UpsertEdges { rel, .. } => {
                let parent = rel.parent_kind();
                let parent_clause = if parent == EntityKind::Root {
                    format!("MATCH (p:{} {{id: row.parent_id}})", parent.label())
                } else {
                    format!(
                        "MERGE (p:{} {{id: row.parent_id}})
                 ON CREATE SET p.created_at = row.received_at, p.last_updated = row.received_at, p._stub = true",
                        parent.label()
                    )
                };
                format!(
                    "UNWIND $rows AS row
                 MATCH (c:{child} {{id: row.child_id}})
                 WHERE c.last_updated IS NULL OR c.last_updated <= row.received_at
                 {parent_clause}
                 MERGE (p)-[:{rel}]->(c)
                 WITH p, c
                 OPTIONAL MATCH (other)-[stale:{rel}]->(c)
                 WHERE other <> p
                 DELETE stale",
                    child = rel.child_kind().label(),
                    parent_clause = parent_clause,
                    rel = rel.as_str()
                )
            }
            Statement::EvictExpired { kind, .. } => format!(
                "MATCH (n:{label})
                 WHERE n.last_updated < $cutoff
                 WITH n LIMIT $limit
                 DETACH DELETE n
                 RETURN count(*) AS deleted",
                label = kind.label()
            ),
            Statement::CountRoots => "MATCH (r:SceneRoot) RETURN count(r) AS roots".to_string(),
            Statement::CreateIndex { kind } => format!("CREATE INDEX ON :{}(id)", kind.label()),
        }
    }
}

// ============================================================================
// Plan Construction
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MutationPlan {
    pub statements: Vec<Statement>,
    /// Envelopes the plan was built from, before collapsing.
    pub envelope_count: usize,
    /// Distinct entities written by the plan.
    pub entity_count: usize,
}

impl MutationPlan {
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}

/// Builds the statement list for one batch. Envelopes for the same entity
/// and write mode collapse to the last one in receive order; replaces are
/// written before merges.
pub fn build_plan(envelopes: Vec<Envelope>) -> MutationPlan {
    let envelope_count = envelopes.len();

    let mut latest: HashMap<(EntityKind, WriteMode, String), Envelope> = HashMap::new();
    for env in envelopes {
        latest.insert((env.kind, env.mode, env.entity_id.clone()), env);
    }
    let entity_count = latest
        .keys()
        .map(|(kind, _, id)| (*kind, id.as_str()))
        .collect::<BTreeSet<_>>()
        .len();

    let mut by_kind: BTreeMap<(EntityKind, WriteMode), Vec<Envelope>> = BTreeMap::new();
    for (_, env) in latest {
        by_kind.entry((env.kind, env.mode)).or_default().push(env);
    }
    for group in by_kind.values_mut() {
        group.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    }

    let mut statements = Vec::new();
    let mut edges: Vec<Statement> = Vec::new();

    for kind in EntityKind::WRITE_ORDER {
        // One ownership edge per child, from its newest envelope.
        let mut edge_rows: BTreeMap<String, EdgeRow> = BTreeMap::new();

        for mode in [WriteMode::Replace, WriteMode::Merge] {
            let Some(group) = by_kind.remove(&(kind, mode)) else {
                continue;
            };

            for env in &group {
                let Some(parent) = env.parent_id.as_ref() else {
                    continue;
                };
                let row = EdgeRow {
                    parent_id: parent.clone(),
                    child_id: env.entity_id.clone(),
                    received_at_ms: env.received_at_ms(),
                };
                match edge_rows.get(&row.child_id) {
                    Some(existing) if existing.received_at_ms > row.received_at_ms => {}
                    _ => {
                        edge_rows.insert(row.child_id.clone(), row);
                    }
                }
            }

            let rows = group
                .into_iter()
                .map(|env| EntityRow {
                    received_at_ms: env.received_at_ms(),
                    id: env.entity_id,
                    attributes: env.attributes,
                })
                .collect();
            statements.push(match mode {
                WriteMode::Replace => Statement::UpsertEntities { kind, rows },
                WriteMode::Merge => Statement::MergeEntities { kind, rows },
            });
        }

        if let Some(rel) = kind.ownership() {
            if !edge_rows.is_empty() {
                edges.push(Statement::UpsertEdges {
                    rel,
                    rows: edge_rows.into_values().collect(),
                });
            }
        }
    }

    statements.extend(edges);

    MutationPlan {
        statements,
        envelope_count,
        entity_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn envelope(kind: EntityKind, id: &str, parent: Option<&str>, ms: i64, attrs: serde_json::Value) -> Envelope {
        let attributes = match attrs {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Attributes::new(),
        };
        Envelope {
            kind,
            entity_id: id.to_string(),
            parent_id: parent.map(str::to_string),
            attributes,
            received_at: Utc.timestamp_millis_opt(ms).unwrap(),
            mode: WriteMode::Replace,
        }
    }

    #[test]
    fn test_entities_precede_edges_and_parents_precede_children() {
        let plan = build_plan(vec![
            envelope(EntityKind::Track, "cam1:players:4", Some("cam1"), 3, json!({})),
            envelope(EntityKind::Camera, "cam1", Some("scene-root"), 1, json!({"fov": 60})),
            envelope(EntityKind::Root, "scene-root", None, 2, json!({"count": 5})),
        ]);

        let shape: Vec<String> = plan
            .statements
            .iter()
            .map(|s| match s {
                Statement::UpsertEntities { kind, .. } => format!("node:{}", kind.as_str()),
                Statement::UpsertEdges { rel, .. } => format!("edge:{}", rel.as_str()),
                other => panic!("unexpected statement {:?}", other),
            })
            .collect();

        assert_eq!(
            shape,
            vec![
                "node:root",
                "node:camera",
                "node:track",
                "edge:HAS_CAMERA",
                "edge:HAS_TRACK"
            ]
        );
    }

    #[test]
    fn test_same_entity_collapses_to_last_in_receive_order() {
        let plan = build_plan(vec![
            envelope(EntityKind::Camera, "cam1", Some("scene-root"), 10, json!({"fov": 60})),
            envelope(EntityKind::Camera, "cam2", Some("scene-root"), 11, json!({"fov": 10})),
            envelope(EntityKind::Camera, "cam1", Some("scene-root"), 12, json!({"fov": 65})),
        ]);

        assert_eq!(plan.envelope_count, 3);
        assert_eq!(plan.entity_count, 2);

        let Statement::UpsertEntities { rows, .. } = &plan.statements[0] else {
            panic!("expected entity upsert first");
        };
        let cam1 = rows.iter().find(|r| r.id == "cam1").unwrap();
        assert_eq!(cam1.attributes.get("fov"), Some(&json!(65)));
        assert_eq!(cam1.received_at_ms, 12);

        let Statement::UpsertEdges { rows, .. } = &plan.statements[1] else {
            panic!("expected edge upsert second");
        };
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_same_id_different_kinds_stay_distinct() {
        let plan = build_plan(vec![
            envelope(EntityKind::Camera, "cam5", Some("scene-root"), 1, json!({})),
            envelope(EntityKind::Intent, "cam5", Some("cam5"), 2, json!({"status": "active"})),
        ]);
        assert_eq!(plan.entity_count, 2);
    }

    #[test]
    fn test_merge_follows_replace_with_a_single_edge() {
        let mut merge = envelope(
            EntityKind::Camera,
            "cam1",
            Some("scene-root"),
            20,
            json!({"gimbal_position": "{\"pan\":10.0}"}),
        );
        merge.mode = WriteMode::Merge;
        let plan = build_plan(vec![
            merge,
            envelope(EntityKind::Camera, "cam1", Some("scene-root"), 10, json!({"fov": 60})),
        ]);

        assert_eq!(plan.entity_count, 1);
        assert_eq!(plan.statements.len(), 3);
        assert!(matches!(&plan.statements[0], Statement::UpsertEntities { kind: EntityKind::Camera, rows } if rows.len() == 1));
        assert!(matches!(&plan.statements[1], Statement::MergeEntities { kind: EntityKind::Camera, rows } if rows.len() == 1));
        let Statement::UpsertEdges { rows, .. } = &plan.statements[2] else {
            panic!("expected edge upsert last");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].received_at_ms, 20);
    }

    #[test]
    fn test_camera_replace_keeps_merged_attributes() {
        let replace = Statement::UpsertEntities {
            kind: EntityKind::Camera,
            rows: Vec::new(),
        };
        let cypher = replace.cypher();
        assert!(cypher.contains("n.gimbal_position AS kept_gimbal_position"));
        assert!(cypher.contains("n.camera_parameters = coalesce(row.attrs.camera_parameters, kept_camera_parameters)"));

        let merge = Statement::MergeEntities {
            kind: EntityKind::Camera,
            rows: Vec::new(),
        };
        assert!(merge.cypher().contains("SET n += row.attrs"));
        assert!(!Statement::UpsertEntities { kind: EntityKind::Track, rows: Vec::new() }
            .cypher()
            .contains("kept_"));
    }

    #[test]
    fn test_index_statement_per_label() {
        let stmt = Statement::CreateIndex { kind: EntityKind::FusedBall };
        assert_eq!(stmt.cypher(), "CREATE INDEX ON :FusionBall(id)");
        assert_eq!(stmt.count_column(), None);
        assert!(stmt.is_schema());
        assert!(!Statement::CountRoots.is_schema());
    }

    #[test]
    fn test_empty_batch_builds_empty_plan() {
        let plan = build_plan(Vec::new());
        assert!(plan.is_empty());
        assert_eq!(plan.entity_count, 0);
    }

    #[test]
    fn test_root_is_never_evicted() {
        assert!(Statement::evict(EntityKind::Root, 0, 10).is_none());
        let stmt = Statement::evict(EntityKind::Track, 0, 10).unwrap();
        assert!(stmt.cypher().contains("MATCH (n:Track)"));
        assert!(stmt.cypher().contains("DETACH DELETE"));
        assert_eq!(stmt.count_column(), Some("deleted"));
    }

    #[test]
    fn test_root_upsert_matches_without_creating() {
        let stmt = Statement::UpsertEntities {
            kind: EntityKind::Root,
            rows: Vec::new(),
        };
        let cypher = stmt.cypher();
        assert!(cypher.contains("MATCH (n:SceneRoot"));
        assert!(!cypher.contains("MERGE"));
    }

    #[test]
    fn test_edges_to_root_never_create_the_parent() {
        let to_root = Statement::UpsertEdges {
            rel: Relationship::HasCamera,
            rows: Vec::new(),
        };
        assert!(to_root.cypher().contains("MATCH (p:SceneRoot"));

        let to_camera = Statement::UpsertEdges {
            rel: Relationship::HasTrack,
            rows: Vec::new(),
        };
        assert!(to_camera.cypher().contains("MERGE (p:CameraConfig"));
        assert!(to_camera.cypher().contains("DELETE stale"));
    }
}
