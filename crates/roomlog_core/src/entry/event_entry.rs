use super::local_relations::{LocalRelationChange, LocalRelationState};
use super::pending::PendingEventEntry;
use crate::sort_key::SortKey;
use roomlog_store::{AnnotationAggregate, DecryptionResult, Event, EventRecord};
use serde_json::Value;
use std::collections::BTreeMap;

/// A confirmed event in the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEntry {
    record: EventRecord,
    local: LocalRelationState,
}

impl EventEntry {
    /// Wraps a stored event.
    #[must_use]
    pub fn new(record: EventRecord) -> Self {
        Self {
            record,
            local: LocalRelationState::default(),
        }
    }

    /// The stored record.
    #[must_use]
    pub fn record(&self) -> &EventRecord {
        &self.record
    }

    /// The raw event as received.
    #[must_use]
    pub fn event(&self) -> &Event {
        &self.record.event
    }

    /// Event id.
    #[must_use]
    pub fn event_id(&self) -> &str {
        &self.record.event.event_id
    }

    /// Position in the room log.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        SortKey::of(&self.record)
    }

    /// Sender user id.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.record.event.sender
    }

    /// Sender display name at the time of the event.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.record.display_name.as_deref()
    }

    /// Sender avatar at the time of the event.
    #[must_use]
    pub fn avatar_url(&self) -> Option<&str> {
        self.record.avatar_url.as_deref()
    }

    /// Type of the event, after decryption if it succeeded.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match &self.record.decryption {
            Some(DecryptionResult::Decrypted { event_type, .. }) => event_type,
            _ => &self.record.event.event_type,
        }
    }

    /// Content of the event, after decryption if it succeeded.
    #[must_use]
    pub fn content(&self) -> &Value {
        match &self.record.decryption {
            Some(DecryptionResult::Decrypted { content, .. }) => content,
            _ => &self.record.event.content,
        }
    }

    /// Transaction id of the local echo this event confirms, if it was sent
    /// from this device.
    #[must_use]
    pub fn transaction_id(&self) -> Option<&str> {
        self.record
            .event
            .unsigned
            .as_ref()?
            .get("transaction_id")?
            .as_str()
    }

    /// Returns true for encrypted events.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.record.event.is_encrypted()
    }

    /// Returns true for encrypted events without a decrypted payload.
    #[must_use]
    pub fn needs_decryption(&self) -> bool {
        self.is_encrypted()
            && !matches!(
                self.record.decryption,
                Some(DecryptionResult::Decrypted { .. })
            )
    }

    /// Megolm session the event was encrypted with.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.record.event.content.get("session_id")?.as_str()
    }

    /// Sender key of the encrypting device.
    #[must_use]
    pub fn sender_key(&self) -> Option<&str> {
        self.record.event.content.get("sender_key")?.as_str()
    }

    /// Reason the last decryption attempt failed.
    #[must_use]
    pub fn decryption_error(&self) -> Option<&str> {
        match &self.record.decryption {
            Some(DecryptionResult::Failed { reason }) => Some(reason),
            _ => None,
        }
    }

    /// Attaches a decryption outcome.
    pub fn set_decryption(&mut self, result: DecryptionResult) {
        self.record.decryption = Some(result);
    }

    /// Returns true if the server redacted this event.
    #[must_use]
    pub fn is_redacted(&self) -> bool {
        self.record.event.is_redacted()
    }

    /// Returns true while a local redaction of this event is queued.
    #[must_use]
    pub fn is_redacting(&self) -> bool {
        self.local.is_redacting()
    }

    /// Durable annotation aggregates.
    #[must_use]
    pub fn annotations(&self) -> &BTreeMap<String, AnnotationAggregate> {
        &self.record.annotations
    }

    /// Whether the local user has, or is about to have, annotated with `key`.
    #[must_use]
    pub fn have_annotation(&self, key: &str) -> bool {
        let durable_me = self.record.annotations.get(key).is_some_and(|a| a.me);
        self.local.have_annotation(key, durable_me)
    }

    /// Annotation count for `key` including in-flight relations.
    #[must_use]
    pub fn annotation_count(&self, key: &str) -> i64 {
        let durable = self.record.annotations.get(key).map_or(0, |a| a.count);
        self.local.annotation_count(key, durable)
    }

    /// Local relations targeting this entry.
    #[must_use]
    pub fn local_relations(&self) -> &LocalRelationState {
        &self.local
    }

    /// Applies a pending relation that targets this entry.
    pub fn add_local_relation(
        &mut self,
        candidate: &PendingEventEntry,
    ) -> Option<LocalRelationChange> {
        let id = self.record.event.event_id.clone();
        self.local.add(&id, candidate)
    }

    /// Removes a pending relation that targets this entry.
    pub fn remove_local_relation(
        &mut self,
        candidate: &PendingEventEntry,
    ) -> Option<LocalRelationChange> {
        let id = self.record.event.event_id.clone();
        self.local.remove(&id, candidate)
    }

    /// Replaces the stored record, keeping local relation state.
    pub fn update_record(&mut self, record: EventRecord) {
        self.record = record;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlog_store::PendingEventRecord;
    use serde_json::json;

    fn encrypted() -> EventEntry {
        let event: Event = serde_json::from_value(json!({
            "event_id": "$e", "type": "m.room.encrypted", "sender": "@a:hs",
            "origin_server_ts": 5,
            "content": {"algorithm": "m.megolm.v1.aes-sha2", "session_id": "s1", "ciphertext": "xx"}
        }))
        .unwrap();
        EventEntry::new(EventRecord::new("!r", 0, 1, event))
    }

    #[test]
    fn decryption_replaces_visible_payload() {
        let mut entry = encrypted();
        assert!(entry.needs_decryption());
        assert_eq!(entry.session_id(), Some("s1"));

        entry.set_decryption(DecryptionResult::Failed {
            reason: "missing key".into(),
        });
        assert!(entry.needs_decryption());
        assert_eq!(entry.decryption_error(), Some("missing key"));

        entry.set_decryption(DecryptionResult::Decrypted {
            event_type: "m.room.message".into(),
            content: json!({"body": "hi"}),
        });
        assert!(!entry.needs_decryption());
        assert_eq!(entry.event_type(), "m.room.message");
        assert_eq!(entry.content()["body"], "hi");
    }

    #[test]
    fn annotation_view_merges_durable_and_local() {
        let mut entry = encrypted();
        let mut record = entry.record().clone();
        record.annotations.insert(
            "👍".into(),
            AnnotationAggregate {
                count: 2,
                me: true,
                first_timestamp: 1,
            },
        );
        entry.update_record(record);

        let mut unreact = PendingEventEntry::new(PendingEventRecord {
            room_id: "!r".into(),
            queue_index: 0,
            txn_id: "t0".into(),
            event_type: "m.room.redaction".into(),
            content: json!({}),
            sender: "@me:hs".into(),
            redacts: Some("$mine".into()),
        });
        unreact.set_redacted_relation(roomlog_store::Relation::from_content(
            &json!({"m.relates_to": {"rel_type": "m.annotation", "event_id": "$e", "key": "👍"}}),
        ));

        assert!(entry.have_annotation("👍"));
        assert!(entry.add_local_relation(&unreact).is_some());
        assert!(!entry.have_annotation("👍"));
        assert_eq!(entry.annotation_count("👍"), 1);
    }
}
