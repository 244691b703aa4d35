//! Envelope Normalizer
//!
//! Classifies a bus topic through a fixed topic table, extracts entity and
//! parent ids with kind-specific rules, validates them and emits typed
//! envelopes. Malformed payloads are rejected with a `ValidationError`,
//! never forwarded.

use crate::envelope::{Attributes, EntityKind, Envelope, RawMessage, WriteMode};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed payload on {topic}: {source}")]
    Malformed {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{topic}: missing required field `{field}`")]
    MissingField { topic: String, field: String },
    #[error("{topic}: field `{field}` has the wrong type, expected {expected}")]
    WrongType {
        topic: String,
        field: String,
        expected: &'static str,
    },
    #[error("{topic}: expected {expected} payload")]
    UnexpectedShape { topic: String, expected: &'static str },
}

// ============================================================================
// Topic Patterns
// ============================================================================

/// Dot-separated topic pattern: `*` matches exactly one token, a trailing
/// `>` matches one or more tokens.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    matcher: Regex,
}

impl TopicPattern {
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let tokens: Vec<&str> = pattern.split('.').collect();
        let last = tokens.len().saturating_sub(1);
        let parts: Vec<String> = tokens
            .iter()
            .enumerate()
            .map(|(i, token)| match *token {
                "*" => "[^.]+".to_string(),
                ">" if i == last => ".+".to_string(),
                other => regex::escape(other),
            })
            .collect();

        let matcher = Regex::new(&format!("^{}$", parts.join(r"\.")))?;
        Ok(Self { matcher })
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.matcher.is_match(topic)
    }
}

/// Allow/deny filter applied before routing.
#[derive(Debug, Clone, Default)]
pub struct TopicFilter {
    allow: Vec<TopicPattern>,
    deny: Vec<TopicPattern>,
}

impl TopicFilter {
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            allow: allow.iter().map(|p| TopicPattern::compile(p)).collect::<Result<_, _>>()?,
            deny: deny.iter().map(|p| TopicPattern::compile(p)).collect::<Result<_, _>>()?,
        })
    }

    pub fn permits(&self, topic: &str) -> bool {
        if self.deny.iter().any(|p| p.matches(topic)) {
            return false;
        }
        self.allow.is_empty() || self.allow.iter().any(|p| p.matches(topic))
    }
}

// ============================================================================
// Topic Table
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum PayloadShape {
    /// A single JSON object describes one entity.
    Object,
    /// A JSON array, one entity per element.
    Array,
    /// A JSON object holding the named arrays, one entity per element.
    Lists(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
enum IdRule {
    SceneRoot,
    TopicToken(usize),
    Field(&'static str),
    /// The first of these fields that is present and not null.
    FirstOf(&'static [&'static str]),
    Constant(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum ParentRule {
    None,
    SceneRoot,
    TopicToken(usize),
    Field(&'static str),
}

/// Blocks of a payload that update an entity other than the rule's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SideUpdate {
    None,
    /// `PTZ` and `cam_params` merge into the camera named by topic token 1.
    CameraPose,
}

struct TopicRule {
    pattern: &'static str,
    kind: EntityKind,
    shape: PayloadShape,
    id: IdRule,
    parent: ParentRule,
    side: SideUpdate,
}

const TOPIC_TABLE: &[TopicRule] = &[
    TopicRule {
        pattern: "tickperframe",
        kind: EntityKind::Root,
        shape: PayloadShape::Object,
        id: IdRule::SceneRoot,
        parent: ParentRule::None,
        side: SideUpdate::None,
    },
    TopicRule {
        pattern: "ptzinfo.*",
        kind: EntityKind::Camera,
        shape: PayloadShape::Object,
        id: IdRule::TopicToken(1),
        parent: ParentRule::SceneRoot,
        side: SideUpdate::None,
    },
    TopicRule {
        pattern: "fused_players",
        kind: EntityKind::FusedPlayer,
        shape: PayloadShape::Array,
        id: IdRule::Field("id"),
        parent: ParentRule::SceneRoot,
        side: SideUpdate::None,
    },
    TopicRule {
        pattern: "fusion.ball_3d",
        kind: EntityKind::FusedBall,
        shape: PayloadShape::Object,
        id: IdRule::Constant("singleton"),
        parent: ParentRule::SceneRoot,
        side: SideUpdate::None,
    },
    TopicRule {
        pattern: "intents.processed",
        kind: EntityKind::Intent,
        shape: PayloadShape::Object,
        id: IdRule::Field("camera_id"),
        parent: ParentRule::Field("camera_id"),
        side: SideUpdate::None,
    },
    TopicRule {
        pattern: "all_tracks.*",
        kind: EntityKind::Track,
        shape: PayloadShape::Lists(&["players", "balls"]),
        id: IdRule::FirstOf(&["track_id", "id"]),
        parent: ParentRule::TopicToken(1),
        side: SideUpdate::CameraPose,
    },
];

// ============================================================================
// Normalizer
// ============================================================================

#[derive(Debug)]
pub enum NormalizeOutcome {
    /// Dropped by the allow/deny filter.
    Filtered,
    /// Passed the filter but matched no topic rule.
    Unrouted,
    /// Routed; `rejected` holds whatever failed validation.
    Routed {
        envelopes: Vec<Envelope>,
        rejected: Vec<ValidationError>,
    },
}

pub struct Normalizer {
    scene_root_id: String,
    filter: TopicFilter,
    routes: Vec<(TopicPattern, &'static TopicRule)>,
}

impl Normalizer {
    pub fn new(scene_root_id: impl Into<String>, filter: TopicFilter) -> Result<Self, regex::Error> {
        let routes = TOPIC_TABLE
            .iter()
            .map(|rule| TopicPattern::compile(rule.pattern).map(|p| (p, rule)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            scene_root_id: scene_root_id.into(),
            filter,
            routes,
        })
    }

    pub fn normalize(&self, msg: &RawMessage) -> NormalizeOutcome {
        if !self.filter.permits(&msg.topic) {
            return NormalizeOutcome::Filtered;
        }

        let rule = match self.routes.iter().find(|(p, _)| p.matches(&msg.topic)) {
            Some((_, rule)) => *rule,
            None => return NormalizeOutcome::Unrouted,
        };

        let mut envelopes = Vec::new();
        let mut rejected = Vec::new();

        let payload: Value = match serde_json::from_slice(&msg.payload) {
            Ok(v) => v,
            Err(source) => {
                rejected.push(ValidationError::Malformed {
                    topic: msg.topic.clone(),
                    source,
                });
                return NormalizeOutcome::Routed { envelopes, rejected };
            }
        };

        let ctx = RuleContext {
            topic: &msg.topic,
            rule,
            scene_root_id: &self.scene_root_id,
            received_at: msg.arrival,
        };

        match (rule.shape, &payload) {
            (PayloadShape::Object, Value::Object(fields)) => {
                push_result(ctx.envelope(fields, None), &mut envelopes, &mut rejected);
            }
            (PayloadShape::Array, Value::Array(items)) => {
                for item in items {
                    let result = match item {
                        Value::Object(fields) => ctx.envelope(fields, None),
                        _ => Err(ctx.shape_error("array of objects")),
                    };
                    push_result(result, &mut envelopes, &mut rejected);
                }
            }
            (PayloadShape::Lists(lists), Value::Object(fields)) => {
                if rule.side == SideUpdate::CameraPose {
                    if let Some(result) = ctx.camera_pose(fields) {
                        push_result(result, &mut envelopes, &mut rejected);
                    }
                }
                for list in lists {
                    match fields.get(*list) {
                        None | Some(Value::Null) => {}
                        Some(Value::Array(items)) => {
                            for item in items {
                                let result = match item {
                                    Value::Object(element) => ctx.envelope(element, Some(*list)),
                                    _ => Err(ctx.shape_error("array of objects")),
                                };
                                push_result(result, &mut envelopes, &mut rejected);
                            }
                        }
                        Some(_) => rejected.push(ValidationError::WrongType {
                            topic: msg.topic.clone(),
                            field: list.to_string(),
                            expected: "array",
                        }),
                    }
                }
            }
            (PayloadShape::Array, _) => rejected.push(ctx.shape_error("array")),
            (_, _) => rejected.push(ctx.shape_error("object")),
        }

        NormalizeOutcome::Routed { envelopes, rejected }
    }
}

fn push_result(
    result: Result<Envelope, ValidationError>,
    envelopes: &mut Vec<Envelope>,
    rejected: &mut Vec<ValidationError>,
) {
    match result {
        Ok(env) => envelopes.push(env),
        Err(e) => rejected.push(e),
    }
}

struct RuleContext<'a> {
    topic: &'a str,
    rule: &'static TopicRule,
    scene_root_id: &'a str,
    received_at: DateTime<Utc>,
}

impl RuleContext<'_> {
    fn envelope(&self, fields: &Map<String, Value>, list: Option<&str>) -> Result<Envelope, ValidationError> {
        let parent_id = match self.rule.parent {
            ParentRule::None => None,
            ParentRule::SceneRoot => Some(self.scene_root_id.to_string()),
            ParentRule::TopicToken(i) => Some(self.topic_token(i)?),
            ParentRule::Field(name) => Some(self.id_field(fields, name)?),
        };

        let raw_id = match self.rule.id {
            IdRule::SceneRoot => self.scene_root_id.to_string(),
            IdRule::TopicToken(i) => self.topic_token(i)?,
            IdRule::Field(name) => self.id_field(fields, name)?,
            IdRule::FirstOf(names) => {
                let present = names
                    .iter()
                    .find(|name| fields.get(**name).map_or(false, |v| !v.is_null()));
                match present {
                    Some(name) => self.id_field(fields, name)?,
                    None => {
                        return Err(ValidationError::MissingField {
                            topic: self.topic.to_string(),
                            field: names.join(" or "),
                        })
                    }
                }
            }
            IdRule::Constant(id) => id.to_string(),
        };

        let mut attributes = to_attributes(fields);
        let entity_id = match (list, parent_id.as_deref()) {
            (Some(list), Some(parent)) => {
                attributes.insert("source_list".to_string(), Value::String(list.to_string()));
                format!("{}:{}:{}", parent, list, raw_id)
            }
            _ => raw_id,
        };

        Ok(Envelope {
            kind: self.rule.kind,
            entity_id,
            parent_id,
            attributes,
            received_at: self.received_at,
            mode: WriteMode::Replace,
        })
    }

    /// Gimbal position and calibration carried alongside tracks, merged
    /// into the camera as JSON strings. `None` when neither block is set.
    fn camera_pose(&self, fields: &Map<String, Value>) -> Option<Result<Envelope, ValidationError>> {
        let ptz = match self.optional_block(fields, "PTZ") {
            Ok(block) => block,
            Err(e) => return Some(Err(e)),
        };
        let params = match self.optional_block(fields, "cam_params") {
            Ok(block) => block,
            Err(e) => return Some(Err(e)),
        };
        if ptz.is_none() && params.is_none() {
            return None;
        }

        let camera_id = match self.topic_token(1) {
            Ok(id) => id,
            Err(e) => return Some(Err(e)),
        };

        // Only the blocks that are set are merged, so an absent one keeps
        // whatever the camera already holds.
        let pick = |block: &Map<String, Value>, key: &str| block.get(key).cloned().unwrap_or(Value::Null);
        let mut attributes = Attributes::new();
        if let Some(ptz) = ptz {
            let gimbal_position = json!({
                "pan": pick(ptz, "panposition"),
                "tilt": pick(ptz, "tiltposition"),
                "zoom": pick(ptz, "zoomposition"),
            });
            attributes.insert("gimbal_position".to_string(), Value::String(gimbal_position.to_string()));
        }
        if let Some(params) = params {
            let camera_parameters = json!({
                "intrinsic": pick(params, "intrinsic"),
                "rotation": pick(params, "rotation"),
                "translation": pick(params, "translation"),
            });
            attributes.insert("camera_parameters".to_string(), Value::String(camera_parameters.to_string()));
        }

        Some(Ok(Envelope {
            kind: EntityKind::Camera,
            entity_id: camera_id,
            parent_id: Some(self.scene_root_id.to_string()),
            attributes,
            received_at: self.received_at,
            mode: WriteMode::Merge,
        }))
    }

    /// An optional nested object; absent, null and empty all count as unset.
    fn optional_block<'f>(
        &self,
        fields: &'f Map<String, Value>,
        name: &str,
    ) -> Result<Option<&'f Map<String, Value>>, ValidationError> {
        match fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(block)) if block.is_empty() => Ok(None),
            Some(Value::Object(block)) => Ok(Some(block)),
            Some(_) => Err(ValidationError::WrongType {
                topic: self.topic.to_string(),
                field: name.to_string(),
                expected: "object",
            }),
        }
    }

    fn topic_token(&self, index: usize) -> Result<String, ValidationError> {
        match self.topic.split('.').nth(index) {
            Some(token) if !token.is_empty() => Ok(token.to_string()),
            _ => Err(ValidationError::MissingField {
                topic: self.topic.to_string(),
                field: format!("topic token {}", index),
            }),
        }
    }

    fn id_field(&self, fields: &Map<String, Value>, name: &str) -> Result<String, ValidationError> {
        match fields.get(name) {
            None | Some(Value::Null) => Err(ValidationError::MissingField {
                topic: self.topic.to_string(),
                field: name.to_string(),
            }),
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
            Some(_) => Err(ValidationError::WrongType {
                topic: self.topic.to_string(),
                field: name.to_string(),
                expected: "non-empty string or integer",
            }),
        }
    }

    fn shape_error(&self, expected: &'static str) -> ValidationError {
        ValidationError::UnexpectedShape {
            topic: self.topic.to_string(),
            expected,
        }
    }
}

/// Property values a graph node can hold: scalars and arrays of scalars are
/// kept, nested structures become JSON strings, nulls are dropped.
fn to_attributes(fields: &Map<String, Value>) -> Attributes {
    fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), to_property(v)))
        .collect()
}

fn to_property(value: &Value) -> Value {
    match value {
        Value::Object(_) => Value::String(value.to_string()),
        Value::Array(items) if items.iter().any(|i| i.is_object() || i.is_array()) => {
            Value::String(value.to_string())
        }
        other => other.clone(),
    }
}
