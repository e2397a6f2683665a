//! Core types for the event queue.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Region name carried by marker identities.
pub const MARKER_REGION: &str = "__marker__";

/// Identifier of a hosting (or producing) member.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub u64);

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

/// Identifier of a subscribing client.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Globally unique identity of a queued event.
///
/// Sequences are assigned per producing member and start at 1. Two identities
/// from different producers have no defined order.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventIdentity {
    pub producing_member: MemberId,
    pub region: String,
    pub sequence: u64,
}

impl EventIdentity {
    pub fn new(producing_member: MemberId, region: impl Into<String>, sequence: u64) -> Self {
        Self {
            producing_member,
            region: region.into(),
            sequence,
        }
    }

    /// True if both identities come from the same producer and `self` was
    /// assigned earlier.
    pub fn precedes(&self, other: &EventIdentity) -> bool {
        self.producing_member == other.producing_member && self.sequence < other.sequence
    }
}

impl fmt::Debug for EventIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventIdentity({}/{}#{})",
            self.producing_member.0, self.region, self.sequence
        )
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Kind of mutation reported by the storage engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Destroy,
    Invalidate,
}

/// What a queue entry carries: a mutation, or a continuity marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "op", rename_all = "snake_case")]
pub enum EventKind {
    Operation(OperationKind),
    Marker,
}

/// Opaque reference to the mutated value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef(pub Vec<u8>);

impl PayloadRef {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        PayloadRef(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadRef({} bytes)", self.0.len())
    }
}

/// An entry in a client's subscription queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub identity: EventIdentity,
    /// Entry key; empty for markers.
    pub key: String,
    pub kind: EventKind,
    pub payload: Option<PayloadRef>,
    pub origin_timestamp: Timestamp,
}

impl QueueEvent {
    /// Create a mutation event.
    pub fn operation(
        identity: EventIdentity,
        key: impl Into<String>,
        op: OperationKind,
        payload: Option<PayloadRef>,
    ) -> Self {
        Self {
            identity,
            key: key.into(),
            kind: EventKind::Operation(op),
            payload,
            origin_timestamp: Timestamp::now(),
        }
    }

    /// Create a marker inserted by `member` with its local marker sequence.
    pub fn marker(member: MemberId, sequence: u64) -> Self {
        Self {
            identity: EventIdentity::new(member, MARKER_REGION, sequence),
            key: String::new(),
            kind: EventKind::Marker,
            payload: None,
            origin_timestamp: Timestamp::now(),
        }
    }

    pub fn is_marker(&self) -> bool {
        matches!(self.kind, EventKind::Marker)
    }

    /// The mutation kind, or None for markers.
    pub fn operation_kind(&self) -> Option<OperationKind> {
        match self.kind {
            EventKind::Operation(op) => Some(op),
            EventKind::Marker => None,
        }
    }
}

/// Role a replica queue believes it holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}
