use super::local_relations::{LocalRelationChange, LocalRelationState};
use crate::sort_key::SortKey;
use roomlog_store::{PendingEventRecord, Relation};
use serde_json::Value;

/// A locally created event shown before the server confirms it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEventEntry {
    record: PendingEventRecord,
    redacted_relation: Option<Relation>,
    local: LocalRelationState,
}

impl PendingEventEntry {
    /// Wraps a queued event.
    #[must_use]
    pub fn new(record: PendingEventRecord) -> Self {
        Self {
            record,
            redacted_relation: None,
            local: LocalRelationState::default(),
        }
    }

    /// The stored queue record.
    #[must_use]
    pub fn record(&self) -> &PendingEventRecord {
        &self.record
    }

    /// Client transaction id.
    #[must_use]
    pub fn txn_id(&self) -> &str {
        &self.record.txn_id
    }

    /// Local send order.
    #[must_use]
    pub fn queue_index(&self) -> u32 {
        self.record.queue_index
    }

    /// Always sorts after every confirmed entry.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        SortKey::pending(self.record.queue_index)
    }

    /// Event type.
    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.record.event_type
    }

    /// Event content.
    #[must_use]
    pub fn content(&self) -> &Value {
        &self.record.content
    }

    /// Sender.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.record.sender
    }

    /// Returns true if this is a redaction.
    #[must_use]
    pub fn is_redaction(&self) -> bool {
        self.record.is_redaction()
    }

    /// Target of the redaction, for redactions.
    #[must_use]
    pub fn redacted_event_id(&self) -> Option<&str> {
        if !self.is_redaction() {
            return None;
        }
        self.record
            .redacts
            .as_deref()
            .or_else(|| self.record.content.get("redacts").and_then(Value::as_str))
    }

    /// Relation carried by the content.
    #[must_use]
    pub fn relation(&self) -> Option<Relation> {
        self.record.relation()
    }

    /// Relation of the event this redaction removes, once known.
    #[must_use]
    pub fn redacted_relation(&self) -> Option<&Relation> {
        self.redacted_relation.as_ref()
    }

    /// Records the relation of the redacted event.
    ///
    /// A redaction of a reaction affects the reacted-to event, so the
    /// relation of the redacted reaction must be known to route it there.
    pub fn set_redacted_relation(&mut self, relation: Option<Relation>) {
        self.redacted_relation = relation;
    }

    /// The annotation this entry adds or removes, if any.
    #[must_use]
    pub fn annotation_relation(&self) -> Option<Relation> {
        let relation = if self.is_redaction() {
            self.redacted_relation.clone()
        } else {
            self.relation()
        }?;
        relation.annotation_key().is_some().then_some(relation)
    }

    /// Entry id used as relation target for other pending events.
    #[must_use]
    pub fn id(&self) -> &str {
        self.txn_id()
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
        let id = self.record.txn_id.clone();
        self.local.add(&id, candidate)
    }

    /// Removes a pending relation that targets this entry.
    pub fn remove_local_relation(
        &mut self,
        candidate: &PendingEventEntry,
    ) -> Option<LocalRelationChange> {
        let id = self.record.txn_id.clone();
        self.local.remove(&id, candidate)
    }
}
