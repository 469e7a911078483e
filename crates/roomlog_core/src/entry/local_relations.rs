//! Local (unconfirmed) relation state held by timeline entries.
//!
//! Only the local send queue mutates this state: relations are added when a
//! pending event is queued and removed when it is confirmed or aborted. It is
//! kept apart from the durable aggregates stored on the event.

use super::pending::PendingEventEntry;
use std::collections::BTreeMap;

/// A pending event contributing to local relation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRelation {
    /// Client transaction id of the pending event.
    pub txn_id: String,
    /// Local send order.
    pub queue_index: u32,
    /// Whether the pending event is a redaction (an un-react).
    pub is_redaction: bool,
}

impl PendingRelation {
    fn of(candidate: &PendingEventEntry) -> Self {
        Self {
            txn_id: candidate.txn_id().to_owned(),
            queue_index: candidate.queue_index(),
            is_redaction: candidate.is_redaction(),
        }
    }
}

/// In-flight annotations for one key, ordered by local send order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingAnnotation {
    entries: Vec<PendingRelation>,
}

impl PendingAnnotation {
    fn add(&mut self, relation: PendingRelation) {
        if self.entries.iter().any(|e| e.txn_id == relation.txn_id) {
            return;
        }
        let at = self
            .entries
            .partition_point(|e| e.queue_index <= relation.queue_index);
        self.entries.insert(at, relation);
    }

    fn remove(&mut self, txn_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.txn_id != txn_id);
        before != self.entries.len()
    }

    /// Returns true if no pending relation remains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Net change this key will see once everything is sent.
    #[must_use]
    pub fn count(&self) -> i64 {
        self.entries
            .iter()
            .map(|e| if e.is_redaction { -1 } else { 1 })
            .sum()
    }

    /// Whether the most recently queued relation is an addition.
    #[must_use]
    pub fn will_annotate(&self) -> bool {
        self.entries.last().is_some_and(|e| !e.is_redaction)
    }

    /// The pending relations in send order.
    #[must_use]
    pub fn entries(&self) -> &[PendingRelation] {
        &self.entries
    }
}

/// What part of an entry's local relation state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalRelationChange {
    /// The first pending redaction arrived or the last one left.
    Redacting,
    /// An annotation key gained its first or lost its last pending relation.
    PendingAnnotations,
}

/// Pending redactions and annotations targeting one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalRelationState {
    pending_redactions: Vec<PendingRelation>,
    pending_annotations: BTreeMap<String, PendingAnnotation>,
}

impl LocalRelationState {
    /// Records `candidate` if it relates to `target_id`.
    pub fn add(
        &mut self,
        target_id: &str,
        candidate: &PendingEventEntry,
    ) -> Option<LocalRelationChange> {
        if candidate.redacted_event_id() == Some(target_id) {
            if self
                .pending_redactions
                .iter()
                .any(|r| r.txn_id == candidate.txn_id())
            {
                return None;
            }
            self.pending_redactions.push(PendingRelation::of(candidate));
            return (self.pending_redactions.len() == 1).then_some(LocalRelationChange::Redacting);
        }

        let relation = candidate.annotation_relation()?;
        if relation.event_id != target_id {
            return None;
        }
        let key = relation.key?;
        let created = !self.pending_annotations.contains_key(&key);
        self.pending_annotations
            .entry(key)
            .or_default()
            .add(PendingRelation::of(candidate));
        created.then_some(LocalRelationChange::PendingAnnotations)
    }

    /// Forgets `candidate` if it relates to `target_id`.
    pub fn remove(
        &mut self,
        target_id: &str,
        candidate: &PendingEventEntry,
    ) -> Option<LocalRelationChange> {
        if candidate.redacted_event_id() == Some(target_id) {
            let before = self.pending_redactions.len();
            self.pending_redactions
                .retain(|r| r.txn_id != candidate.txn_id());
            let removed = before != self.pending_redactions.len();
            return (removed && self.pending_redactions.is_empty())
                .then_some(LocalRelationChange::Redacting);
        }

        let relation = candidate.annotation_relation()?;
        if relation.event_id != target_id {
            return None;
        }
        let key = relation.key?;
        let annotation = self.pending_annotations.get_mut(&key)?;
        if annotation.remove(candidate.txn_id()) && annotation.is_empty() {
            self.pending_annotations.remove(&key);
            return Some(LocalRelationChange::PendingAnnotations);
        }
        None
    }

    /// Returns true while a redaction of the entry is waiting to be sent.
    #[must_use]
    pub fn is_redacting(&self) -> bool {
        !self.pending_redactions.is_empty()
    }

    /// Returns the in-flight aggregate for `key`.
    #[must_use]
    pub fn pending_annotation(&self, key: &str) -> Option<&PendingAnnotation> {
        self.pending_annotations.get(key)
    }

    /// Iterates over keys with in-flight annotations.
    pub fn pending_annotation_keys(&self) -> impl Iterator<Item = &str> {
        self.pending_annotations.keys().map(String::as_str)
    }

    /// Whether the latest queued intent for `key` is to annotate.
    #[must_use]
    pub fn will_annotate(&self, key: &str) -> bool {
        self.pending_annotations
            .get(key)
            .is_some_and(PendingAnnotation::will_annotate)
    }

    /// Combines the durable `me` flag with local intent for `key`.
    ///
    /// Pending intent wins when present; otherwise the durable flag holds.
    #[must_use]
    pub fn have_annotation(&self, key: &str, durable_me: bool) -> bool {
        match self.pending_annotations.get(key) {
            Some(pending) => pending.will_annotate(),
            None => durable_me,
        }
    }

    /// Durable count for `key` adjusted by in-flight relations.
    #[must_use]
    pub fn annotation_count(&self, key: &str, durable_count: u32) -> i64 {
        let delta = self
            .pending_annotations
            .get(key)
            .map_or(0, PendingAnnotation::count);
        (i64::from(durable_count) + delta).max(0)
    }

    /// Returns true when no local relation is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending_redactions.is_empty() && self.pending_annotations.is_empty()
    }
}
