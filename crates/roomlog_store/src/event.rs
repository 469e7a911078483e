//! Room event payloads as delivered by the server.
//!
//! Events are kept close to their wire shape: the fixed top-level fields are
//! typed, `content` and `unsigned` stay as JSON values so unknown event types
//! survive a round trip through the store untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type of redactions.
pub const REDACTION_TYPE: &str = "m.room.redaction";
/// Event type of membership state events.
pub const MEMBER_TYPE: &str = "m.room.member";
/// Event type of encrypted events.
pub const ENCRYPTED_TYPE: &str = "m.room.encrypted";
/// Relation type of reactions.
pub const ANNOTATION_RELATION: &str = "m.annotation";

/// A single room event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Server-assigned event id.
    pub event_id: String,
    /// Event type, e.g. `m.room.message`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Room id, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// User id of the sender.
    pub sender: String,
    /// Server timestamp in milliseconds.
    #[serde(default)]
    pub origin_server_ts: u64,
    /// Event content.
    #[serde(default)]
    pub content: Value,
    /// State key, present only on state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Unsigned data (prev content, redacted_because, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
    /// Target of a redaction event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacts: Option<String>,
}

/// Relation descriptor parsed from `content["m.relates_to"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    /// Relation type, e.g. `m.annotation`.
    pub rel_type: String,
    /// Id of the event this one relates to.
    pub event_id: String,
    /// Aggregation key for annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Relation {
    /// Parses a relation from event content.
    #[must_use]
    pub fn from_content(content: &Value) -> Option<Self> {
        let relates_to = content.get("m.relates_to")?;
        let rel_type = relates_to.get("rel_type")?.as_str()?;
        let event_id = relates_to.get("event_id")?.as_str()?;
        let key = relates_to
            .get("key")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Some(Self {
            rel_type: rel_type.to_owned(),
            event_id: event_id.to_owned(),
            key,
        })
    }

    /// Returns the annotation key if this is an annotation.
    #[must_use]
    pub fn annotation_key(&self) -> Option<&str> {
        if self.rel_type == ANNOTATION_RELATION {
            self.key.as_deref()
        } else {
            None
        }
    }
}

impl Event {
    /// Returns true for redaction events.
    #[must_use]
    pub fn is_redaction(&self) -> bool {
        self.event_type == REDACTION_TYPE
    }

    /// Returns true for state events.
    #[must_use]
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// Returns true for membership events about `user_id`.
    #[must_use]
    pub fn is_member_event_for(&self, user_id: &str) -> bool {
        self.event_type == MEMBER_TYPE && self.state_key.as_deref() == Some(user_id)
    }

    /// Returns the id of the event a redaction targets.
    ///
    /// Older room versions carry it at the top level, newer ones in content.
    #[must_use]
    pub fn redacted_event_id(&self) -> Option<&str> {
        if !self.is_redaction() {
            return None;
        }
        self.redacts
            .as_deref()
            .or_else(|| self.content.get("redacts").and_then(Value::as_str))
    }

    /// Returns the relation descriptor, if any.
    #[must_use]
    pub fn relation(&self) -> Option<Relation> {
        Relation::from_content(&self.content)
    }

    /// Returns the content this state event replaced.
    #[must_use]
    pub fn prev_content(&self) -> Option<&Value> {
        self.unsigned.as_ref()?.get("prev_content")
    }

    /// Returns true if this event has been redacted.
    #[must_use]
    pub fn is_redacted(&self) -> bool {
        self.unsigned
            .as_ref()
            .and_then(|u| u.get("redacted_because"))
            .is_some()
    }

    /// Returns true for encrypted events.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.event_type == ENCRYPTED_TYPE
    }
}
