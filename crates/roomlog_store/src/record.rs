//! Records held by the logical stores.

use crate::event::{Event, Relation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Identifier of a segment within a room.
pub type SegmentId = u32;

/// Position of an event within its segment.
pub type Position = u32;

/// Durable aggregate of one annotation key on a target event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationAggregate {
    /// Number of confirmed, unredacted annotations with this key.
    pub count: u32,
    /// Whether the local user contributed one of them.
    pub me: bool,
    /// Earliest timestamp among the contributing annotations.
    pub first_timestamp: u64,
}

/// Outcome of decrypting an encrypted event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecryptionResult {
    /// The event decrypted to this payload.
    Decrypted {
        /// Type of the cleartext event.
        event_type: String,
        /// Content of the cleartext event.
        content: Value,
    },
    /// Decryption failed for this event.
    Failed {
        /// Reason reported by the decryptor.
        reason: String,
    },
}

/// A stored timeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Room the event belongs to.
    pub room_id: String,
    /// Segment holding the event.
    pub segment_id: SegmentId,
    /// Position within the segment.
    pub position: Position,
    /// The event itself.
    pub event: Event,
    /// Sender display name at the time of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Sender avatar at the time of the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Confirmed annotation aggregates keyed by annotation key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, AnnotationAggregate>,
    /// Decryption outcome for encrypted events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption: Option<DecryptionResult>,
}

impl EventRecord {
    /// Creates a record for `event` at the given location.
    #[must_use]
    pub fn new(
        room_id: impl Into<String>,
        segment_id: SegmentId,
        position: Position,
        event: Event,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            segment_id,
            position,
            event,
            display_name: None,
            avatar_url: None,
            annotations: BTreeMap::new(),
            decryption: None,
        }
    }

    /// Returns the event id.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.event.event_id
    }
}

/// A stored segment: a contiguous, internally ordered run of events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    /// Room the segment belongs to.
    pub room_id: String,
    /// Segment id.
    pub id: SegmentId,
    /// Segment known to precede this one.
    pub previous_id: Option<SegmentId>,
    /// Segment known to follow this one.
    pub next_id: Option<SegmentId>,
    /// Pagination cursor at the start edge.
    pub previous_token: Option<String>,
    /// Pagination cursor at the end edge.
    pub next_token: Option<String>,
}

impl SegmentRecord {
    /// Creates an unlinked segment.
    #[must_use]
    pub fn new(room_id: impl Into<String>, id: SegmentId) -> Self {
        Self {
            room_id: room_id.into(),
            id,
            previous_id: None,
            next_id: None,
            previous_token: None,
            next_token: None,
        }
    }

    /// Sets the start-edge pagination cursor.
    #[must_use]
    pub fn with_previous_token(mut self, token: Option<String>) -> Self {
        self.previous_token = token;
        self
    }
}

/// An edge in the relation index: `source` relates to `target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationRecord {
    /// Room the relation lives in.
    pub room_id: String,
    /// Event being related to.
    pub target_event_id: String,
    /// Relation type.
    pub rel_type: String,
    /// Event carrying the relation.
    pub source_event_id: String,
}

/// A locally created event waiting for the server to confirm it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEventRecord {
    /// Room the event is sent to.
    pub room_id: String,
    /// Local send order.
    pub queue_index: u32,
    /// Client transaction id.
    pub txn_id: String,
    /// Event type.
    pub event_type: String,
    /// Event content.
    pub content: Value,
    /// Sender (the local user).
    pub sender: String,
    /// Target of a redaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
}

impl PendingEventRecord {
    /// Returns the relation descriptor of the content, if any.
    #[must_use]
    pub fn relation(&self) -> Option<Relation> {
        Relation::from_content(&self.content)
    }

    /// Returns true for pending redactions.
    #[must_use]
    pub fn is_redaction(&self) -> bool {
        self.event_type == crate::event::REDACTION_TYPE
    }
}
