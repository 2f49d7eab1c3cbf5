//! Operation data model for the grove op log.
//!
//! An [`Operation`] is the immutable, serializable unit peers exchange. Each
//! one targets a single `(entity_id, field_key)` register. For tree edges the
//! field key is the candidate parent's node id, so entity and field share the
//! [`NodeId`] type. `value` carries the edge counter; a tombstone carries
//! `deleted = true` and no value.
//!
//! # Wire format
//!
//! Field names are normative; the encoding is whatever the transport picks
//! (JSON via serde here). `value` and `deleted` are optional on the wire and
//! mutually exclusive:
//!
//! ```text
//! { "entity_id": "a", "field_key": "(ROOT)", "value": 3,
//!   "peer_id": "peer-1", "timestamp": 1700000000000 }
//! ```
//!
//! Transports may reorder or duplicate operations freely; the LWW order makes
//! redelivery idempotent.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Reserved identifier for the tree root.
///
/// All peers must agree on this sentinel. The root is never the `entity_id`
/// of any operation.
pub const ROOT_ID: &str = "(ROOT)";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Opaque identifier of a tree node.
///
/// Also used as a field key, since a tree edge's field key is the candidate
/// parent's id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Wrap an identifier without validation.
    ///
    /// Emptiness is checked at the `apply` boundary, not here; the universe
    /// of ids is open and nodes are created implicitly.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The reserved root identifier.
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    /// Whether this id is the root sentinel.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (invalid in any operation).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// Identifier of an originating peer.
///
/// Any globally-unique string works; peers are totally ordered by
/// lexicographic comparison, which is the LWW tiebreak.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap a peer identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is empty (invalid in any operation).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A single immutable write to one `(entity_id, field_key)` register.
///
/// For tree edges: `entity_id` is the child, `field_key` is the candidate
/// parent, and `value` is the edge counter. A tombstone has `deleted = true`
/// and no value; it competes under the same LWW order as value writes, with
/// no special priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// The child node this operation writes.
    pub entity_id: NodeId,

    /// The register key. For tree edges, the candidate parent's id.
    pub field_key: NodeId,

    /// Edge counter. Absent on tombstones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,

    /// Tombstone flag: the field is logically removed but keeps competing in
    /// LWW order so later writes can still resurrect it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    /// Originating peer.
    pub peer_id: PeerId,

    /// Wall-clock milliseconds, monotonically advanced per peer.
    pub timestamp: i64,
}

impl Operation {
    /// Build a value write.
    #[must_use]
    pub fn set(
        entity_id: NodeId,
        field_key: NodeId,
        value: i64,
        peer_id: PeerId,
        timestamp: i64,
    ) -> Self {
        Self {
            entity_id,
            field_key,
            value: Some(value),
            deleted: false,
            peer_id,
            timestamp,
        }
    }

    /// Build a tombstone.
    #[must_use]
    pub fn tombstone(entity_id: NodeId, field_key: NodeId, peer_id: PeerId, timestamp: i64) -> Self {
        Self {
            entity_id,
            field_key,
            value: None,
            deleted: true,
            peer_id,
            timestamp,
        }
    }

    /// The value visible to readers: `None` for tombstones.
    #[must_use]
    pub fn visible_value(&self) -> Option<i64> {
        if self.deleted {
            None
        } else {
            self.value
        }
    }

    /// Total order among operations on the same field.
    ///
    /// Larger timestamp wins; ties break by lexicographically larger peer id.
    /// Both components together are the entire LWW discipline; there is no
    /// tombstone priority.
    #[must_use]
    pub fn lww_cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.peer_id.cmp(&other.peer_id))
    }

    /// Whether this operation strictly dominates `other` under the LWW order.
    #[must_use]
    pub fn wins_over(&self, other: &Self) -> bool {
        self.lww_cmp(other) == Ordering::Greater
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let payload = if self.deleted {
            "tombstone".to_string()
        } else {
            match self.value {
                Some(v) => v.to_string(),
                None => "-".to_string(),
            }
        };
        write!(
            f,
            "{}@{} {}[{}] = {}",
            self.peer_id, self.timestamp, self.entity_id, self.field_key, payload
        )
    }
}
