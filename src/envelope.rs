//! Envelope Types
//!
//! The pipeline's internal representation of one inbound bus message,
//! plus the closed set of entity kinds and ownership relationships the
//! scene graph is made of.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map carried by an envelope. Ordered so that hashing and
/// statement parameters are deterministic.
pub type Attributes = BTreeMap<String, Value>;

// ============================================================================
// Entity Kinds and Relationships
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Root,
    Camera,
    FusedPlayer,
    FusedBall,
    Intent,
    Track,
}

impl EntityKind {
    /// Kinds in the order their upserts are emitted: parents before children.
    pub const WRITE_ORDER: [EntityKind; 6] = [
        EntityKind::Root,
        EntityKind::Camera,
        EntityKind::FusedPlayer,
        EntityKind::FusedBall,
        EntityKind::Intent,
        EntityKind::Track,
    ];

    /// Kinds the cleanup scheduler may delete, leaves first. `Root` is never
    /// part of this list.
    pub const EVICTION_ORDER: [EntityKind; 5] = [
        EntityKind::Track,
        EntityKind::Intent,
        EntityKind::FusedPlayer,
        EntityKind::FusedBall,
        EntityKind::Camera,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EntityKind::Root => "SceneRoot",
            EntityKind::Camera => "CameraConfig",
            EntityKind::FusedPlayer => "FusedPlayer",
            EntityKind::FusedBall => "FusionBall",
            EntityKind::Intent => "Intent",
            EntityKind::Track => "Track",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Root => "root",
            EntityKind::Camera => "camera",
            EntityKind::FusedPlayer => "fused-player",
            EntityKind::FusedBall => "fused-ball",
            EntityKind::Intent => "intent",
            EntityKind::Track => "track",
        }
    }

    /// Attributes only written by merge updates. A full replace keeps their
    /// stored values unless it carries the key itself.
    pub fn carried_attributes(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Camera => &["gimbal_position", "camera_parameters"],
            _ => &[],
        }
    }

    /// The ownership edge linking this kind to its logical parent.
    pub fn ownership(&self) -> Option<Relationship> {
        match self {
            EntityKind::Root => None,
            EntityKind::Camera => Some(Relationship::HasCamera),
            EntityKind::FusedPlayer => Some(Relationship::HasPlayer),
            EntityKind::FusedBall => Some(Relationship::HasBall),
            EntityKind::Intent => Some(Relationship::HasIntent),
            EntityKind::Track => Some(Relationship::HasTrack),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed, directed ownership edges from a parent entity to a child entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Relationship {
    HasCamera,
    HasPlayer,
    HasBall,
    HasIntent,
    HasTrack,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::HasCamera => "HAS_CAMERA",
            Relationship::HasPlayer => "HAS_PLAYER",
            Relationship::HasBall => "HAS_BALL",
            Relationship::HasIntent => "HAS_INTENT",
            Relationship::HasTrack => "HAS_TRACK",
        }
    }

    pub fn parent_kind(&self) -> EntityKind {
        match self {
            Relationship::HasCamera
            | Relationship::HasPlayer
            | Relationship::HasBall => EntityKind::Root,
            Relationship::HasIntent | Relationship::HasTrack => EntityKind::Camera,
        }
    }

    pub fn child_kind(&self) -> EntityKind {
        match self {
            Relationship::HasCamera => EntityKind::Camera,
            Relationship::HasPlayer => EntityKind::FusedPlayer,
            Relationship::HasBall => EntityKind::FusedBall,
            Relationship::HasIntent => EntityKind::Intent,
            Relationship::HasTrack => EntityKind::Track,
        }
    }
}

// ============================================================================
// Messages and Envelopes
// ============================================================================

/// One message as delivered by the bus (or replayed from a capture file).
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub arrival: DateTime<Utc>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, arrival: DateTime<Utc>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            arrival,
        }
    }
}

/// How an envelope's attributes are applied to the stored entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriteMode {
    /// The attribute set replaces the stored one.
    #[default]
    Replace,
    /// The attributes are merged into the stored ones.
    Merge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EntityKind,
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub attributes: Attributes,
    pub received_at: DateTime<Utc>,
    pub mode: WriteMode,
}

impl Envelope {
    pub fn received_at_ms(&self) -> i64 {
        self.received_at.timestamp_millis()
    }
}
