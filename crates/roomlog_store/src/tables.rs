//! The logical stores and their operations.
//!
//! Every store is partitioned by room, so scans never leave the room they
//! were started in. Partitions sit behind `Arc`s: a write transaction starts
//! from a shallow copy and clones only the partitions it writes to, leaving
//! the committed ones shared with readers.

use crate::error::{StoreError, StoreResult};
use crate::event::Event;
use crate::record::{
    EventRecord, PendingEventRecord, Position, RelationRecord, SegmentId, SegmentRecord,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

/// The complete contents of a store.
///
/// Read transactions expose these through shared references; write
/// transactions mutate a private copy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    rooms: BTreeMap<String, Arc<RoomTables>>,
}

/// One room's partition of every store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RoomTables {
    events: BTreeMap<SegmentId, Arc<SegmentEvents>>,
    segments: Arc<BTreeMap<SegmentId, SegmentRecord>>,
    relations: Arc<RelationIndex>,
    state: Arc<BTreeMap<(String, String), Event>>,
    pending: Arc<BTreeMap<u32, PendingEventRecord>>,
}

/// Events of one segment with their event id index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SegmentEvents {
    events: BTreeMap<Position, EventRecord>,
    #[serde(skip)]
    ids: HashMap<String, Position>,
}

/// Relation edges keyed by target, plus the targets of each source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RelationIndex {
    by_target: BTreeMap<String, BTreeSet<RelationRecord>>,
    #[serde(skip)]
    by_source: HashMap<String, BTreeSet<String>>,
}

impl RelationIndex {
    fn insert(&mut self, relation: RelationRecord) {
        self.by_source
            .entry(relation.source_event_id.clone())
            .or_default()
            .insert(relation.target_event_id.clone());
        self.by_target
            .entry(relation.target_event_id.clone())
            .or_default()
            .insert(relation);
    }

    fn remove(&mut self, relation: &RelationRecord) -> bool {
        let Some(edges) = self.by_target.get_mut(&relation.target_event_id) else {
            return false;
        };
        if !edges.remove(relation) {
            return false;
        }
        let still_linked = edges
            .iter()
            .any(|r| r.source_event_id == relation.source_event_id);
        if edges.is_empty() {
            self.by_target.remove(&relation.target_event_id);
        }
        if !still_linked {
            self.unlink_source(&relation.source_event_id, &relation.target_event_id);
        }
        true
    }

    fn unlink_source(&mut self, source: &str, target: &str) {
        if let Some(targets) = self.by_source.get_mut(source) {
            targets.remove(target);
            if targets.is_empty() {
                self.by_source.remove(source);
            }
        }
    }

    fn remove_from_source(&mut self, source: &str) -> usize {
        let Some(targets) = self.by_source.remove(source) else {
            return 0;
        };
        let mut removed = 0;
        for target in targets {
            if let Some(edges) = self.by_target.get_mut(&target) {
                let before = edges.len();
                edges.retain(|r| r.source_event_id != source);
                removed += before - edges.len();
                if edges.is_empty() {
                    self.by_target.remove(&target);
                }
            }
        }
        removed
    }

    fn remove_to_target(&mut self, target: &str) -> usize {
        let Some(edges) = self.by_target.remove(target) else {
            return 0;
        };
        for edge in &edges {
            self.unlink_source(&edge.source_event_id, target);
        }
        edges.len()
    }

    fn rebuild_sources(&mut self) {
        self.by_source.clear();
        for edge in self.by_target.values().flatten() {
            self.by_source
                .entry(edge.source_event_id.clone())
                .or_default()
                .insert(edge.target_event_id.clone());
        }
    }
}

impl Tables {
    /// Rebuilds the in-memory indexes after deserialization.
    pub(crate) fn rebuild_indexes(&mut self) {
        for room in self.rooms.values_mut() {
            let room = Arc::make_mut(room);
            for bucket in room.events.values_mut() {
                let bucket = Arc::make_mut(bucket);
                bucket.ids = bucket
                    .events
                    .iter()
                    .map(|(position, record)| (record.event.event_id.clone(), *position))
                    .collect();
            }
            Arc::make_mut(&mut room.relations).rebuild_sources();
        }
    }

    fn room(&self, room_id: &str) -> Option<&RoomTables> {
        self.rooms.get(room_id).map(|room| &**room)
    }

    fn room_mut(&mut self, room_id: &str) -> &mut RoomTables {
        Arc::make_mut(self.rooms.entry(room_id.to_owned()).or_default())
    }

    fn bucket(&self, room_id: &str, segment_id: SegmentId) -> Option<&SegmentEvents> {
        self.room(room_id)?
            .events
            .get(&segment_id)
            .map(|bucket| &**bucket)
    }

    // --- event log ---

    /// Gets the event at `(segment_id, position)`.
    #[must_use]
    pub fn event(
        &self,
        room_id: &str,
        segment_id: SegmentId,
        position: Position,
    ) -> Option<&EventRecord> {
        self.bucket(room_id, segment_id)?.events.get(&position)
    }

    /// Gets an event by its event id.
    #[must_use]
    pub fn event_by_id(&self, room_id: &str, event_id: &str) -> Option<&EventRecord> {
        self.room(room_id)?
            .events
            .values()
            .find_map(|bucket| bucket.ids.get(event_id).and_then(|p| bucket.events.get(p)))
    }

    /// Returns the first id of `event_ids`, in list order, that is already
    /// stored.
    #[must_use]
    pub fn find_first_occurring_event_id<'a>(
        &self,
        room_id: &str,
        event_ids: &[&'a str],
    ) -> Option<&'a str> {
        event_ids
            .iter()
            .copied()
            .find(|id| self.event_by_id(room_id, id).is_some())
    }

    /// Returns up to `amount` events strictly before `position`, ascending.
    #[must_use]
    pub fn events_before(
        &self,
        room_id: &str,
        segment_id: SegmentId,
        position: Position,
        amount: usize,
    ) -> Vec<EventRecord> {
        let Some(bucket) = self.bucket(room_id, segment_id) else {
            return Vec::new();
        };
        let mut events: Vec<EventRecord> = bucket
            .events
            .range(..position)
            .rev()
            .take(amount)
            .map(|(_, r)| r.clone())
            .collect();
        events.reverse();
        events
    }

    /// Returns up to `amount` events strictly after `position`, ascending.
    #[must_use]
    pub fn events_after(
        &self,
        room_id: &str,
        segment_id: SegmentId,
        position: Position,
        amount: usize,
    ) -> Vec<EventRecord> {
        let Some(bucket) = self.bucket(room_id, segment_id) else {
            return Vec::new();
        };
        bucket
            .events
            .range((Bound::Excluded(position), Bound::Unbounded))
            .take(amount)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Returns the first `amount` events of a segment, ascending.
    #[must_use]
    pub fn first_events(
        &self,
        room_id: &str,
        segment_id: SegmentId,
        amount: usize,
    ) -> Vec<EventRecord> {
        self.bucket(room_id, segment_id)
            .map(|bucket| bucket.events.values().take(amount).cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the last `amount` events of a segment, ascending.
    #[must_use]
    pub fn last_events(
        &self,
        room_id: &str,
        segment_id: SegmentId,
        amount: usize,
    ) -> Vec<EventRecord> {
        let Some(bucket) = self.bucket(room_id, segment_id) else {
            return Vec::new();
        };
        let mut events: Vec<EventRecord> =
            bucket.events.values().rev().take(amount).cloned().collect();
        events.reverse();
        events
    }

    /// Iterates over every event of a room in storage order.
    pub fn room_events<'s>(
        &'s self,
        room_id: &str,
    ) -> impl Iterator<Item = &'s EventRecord> + 's {
        self.room(room_id)
            .into_iter()
            .flat_map(|room| room.events.values())
            .flat_map(|bucket| bucket.events.values())
    }

    pub(crate) fn insert_event(&mut self, record: EventRecord) -> StoreResult<()> {
        if self
            .event(&record.room_id, record.segment_id, record.position)
            .is_some()
        {
            return Err(StoreError::duplicate_key(
                "timeline_events",
                format!("{}/{}/{}", record.room_id, record.segment_id, record.position),
            ));
        }
        if self
            .event_by_id(&record.room_id, &record.event.event_id)
            .is_some()
        {
            return Err(StoreError::DuplicateEventId {
                room_id: record.room_id,
                event_id: record.event.event_id,
            });
        }
        let room = self.room_mut(&record.room_id);
        let bucket = Arc::make_mut(room.events.entry(record.segment_id).or_default());
        bucket
            .ids
            .insert(record.event.event_id.clone(), record.position);
        bucket.events.insert(record.position, record);
        Ok(())
    }

    pub(crate) fn update_event(&mut self, record: EventRecord) -> StoreResult<()> {
        let matches = self
            .event(&record.room_id, record.segment_id, record.position)
            .is_some_and(|existing| existing.event.event_id == record.event.event_id);
        if !matches {
            return Err(StoreError::not_found(
                "timeline_events",
                format!("{}/{}", record.room_id, record.event.event_id),
            ));
        }
        let room = self.room_mut(&record.room_id);
        let bucket = Arc::make_mut(room.events.entry(record.segment_id).or_default());
        bucket.events.insert(record.position, record);
        Ok(())
    }

    // --- segments ---

    /// Gets a segment by id.
    #[must_use]
    pub fn segment(&self, room_id: &str, id: SegmentId) -> Option<&SegmentRecord> {
        self.room(room_id)?.segments.get(&id)
    }

    /// Returns every segment of a room, ordered by id.
    #[must_use]
    pub fn segments(&self, room_id: &str) -> Vec<SegmentRecord> {
        self.room(room_id)
            .map(|room| room.segments.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the live segment: the one with the highest id.
    #[must_use]
    pub fn live_segment(&self, room_id: &str) -> Option<&SegmentRecord> {
        self.room(room_id)?.segments.values().next_back()
    }

    /// Returns the ids of all rooms that have segments.
    #[must_use]
    pub fn room_ids(&self) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, room)| !room.segments.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn add_segment(&mut self, segment: SegmentRecord) -> StoreResult<()> {
        if self.segment(&segment.room_id, segment.id).is_some() {
            return Err(StoreError::duplicate_key(
                "timeline_segments",
                format!("{}/{}", segment.room_id, segment.id),
            ));
        }
        let room = self.room_mut(&segment.room_id);
        Arc::make_mut(&mut room.segments).insert(segment.id, segment);
        Ok(())
    }

    pub(crate) fn update_segment(&mut self, segment: SegmentRecord) -> StoreResult<()> {
        if self.segment(&segment.room_id, segment.id).is_none() {
            return Err(StoreError::not_found(
                "timeline_segments",
                format!("{}/{}", segment.room_id, segment.id),
            ));
        }
        let room = self.room_mut(&segment.room_id);
        Arc::make_mut(&mut room.segments).insert(segment.id, segment);
        Ok(())
    }

    // --- relation index ---

    /// Returns all relation edges pointing at `target_event_id`.
    #[must_use]
    pub fn relations_for_target(
        &self,
        room_id: &str,
        target_event_id: &str,
    ) -> Vec<RelationRecord> {
        self.target_edges(room_id, target_event_id)
            .map(|edges| edges.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns relation edges of one type pointing at `target_event_id`.
    #[must_use]
    pub fn relations_for_target_and_type(
        &self,
        room_id: &str,
        target_event_id: &str,
        rel_type: &str,
    ) -> Vec<RelationRecord> {
        self.target_edges(room_id, target_event_id)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|r| r.rel_type == rel_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn target_edges(
        &self,
        room_id: &str,
        target_event_id: &str,
    ) -> Option<&BTreeSet<RelationRecord>> {
        self.room(room_id)?.relations.by_target.get(target_event_id)
    }

    /// Returns every relation edge in a room.
    pub fn room_relations<'s>(
        &'s self,
        room_id: &str,
    ) -> impl Iterator<Item = &'s RelationRecord> + 's {
        self.room(room_id)
            .into_iter()
            .flat_map(|room| room.relations.by_target.values())
            .flatten()
    }

    pub(crate) fn add_relation(&mut self, relation: RelationRecord) {
        let room = self.room_mut(&relation.room_id);
        Arc::make_mut(&mut room.relations).insert(relation);
    }

    pub(crate) fn remove_relation(&mut self, relation: &RelationRecord) -> bool {
        let stored = self
            .target_edges(&relation.room_id, &relation.target_event_id)
            .is_some_and(|edges| edges.contains(relation));
        if !stored {
            return false;
        }
        let room = self.room_mut(&relation.room_id);
        Arc::make_mut(&mut room.relations).remove(relation)
    }

    pub(crate) fn remove_relations_from_source(&mut self, room_id: &str, source: &str) -> usize {
        let known = self
            .room(room_id)
            .is_some_and(|room| room.relations.by_source.contains_key(source));
        if !known {
            return 0;
        }
        let room = self.room_mut(room_id);
        Arc::make_mut(&mut room.relations).remove_from_source(source)
    }

    pub(crate) fn remove_relations_to_target(&mut self, room_id: &str, target: &str) -> usize {
        if self.target_edges(room_id, target).is_none() {
            return 0;
        }
        let room = self.room_mut(room_id);
        Arc::make_mut(&mut room.relations).remove_to_target(target)
    }

    // --- room state ---

    /// Gets the current state event for `(event_type, state_key)`.
    #[must_use]
    pub fn room_state(&self, room_id: &str, event_type: &str, state_key: &str) -> Option<&Event> {
        self.room(room_id)?
            .state
            .get(&(event_type.to_owned(), state_key.to_owned()))
    }

    pub(crate) fn set_room_state(&mut self, room_id: &str, event: Event) {
        let state_key = event.state_key.clone().unwrap_or_default();
        let room = self.room_mut(room_id);
        Arc::make_mut(&mut room.state).insert((event.event_type.clone(), state_key), event);
    }

    // --- pending events ---

    /// Returns the pending events of a room in queue order.
    #[must_use]
    pub fn pending_events(&self, room_id: &str) -> Vec<PendingEventRecord> {
        self.room(room_id)
            .map(|room| room.pending.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn add_pending(&mut self, pending: PendingEventRecord) -> StoreResult<()> {
        let taken = self
            .room(&pending.room_id)
            .is_some_and(|room| room.pending.contains_key(&pending.queue_index));
        if taken {
            return Err(StoreError::duplicate_key(
                "pending_events",
                format!("{}/{}", pending.room_id, pending.queue_index),
            ));
        }
        let room = self.room_mut(&pending.room_id);
        Arc::make_mut(&mut room.pending).insert(pending.queue_index, pending);
        Ok(())
    }

    pub(crate) fn remove_pending(
        &mut self,
        room_id: &str,
        queue_index: u32,
    ) -> Option<PendingEventRecord> {
        let queued = self
            .room(room_id)
            .is_some_and(|room| room.pending.contains_key(&queue_index));
        if !queued {
            return None;
        }
        let room = self.room_mut(room_id);
        Arc::make_mut(&mut room.pending).remove(&queue_index)
    }

    /// Returns true if this and `other` share the partition of `room_id`.
    #[cfg(test)]
    pub(crate) fn shares_room_with(&self, other: &Self, room_id: &str) -> bool {
        match (self.rooms.get(room_id), other.rooms.get(room_id)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Returns true if this and `other` share the events of one segment.
    #[cfg(test)]
    pub(crate) fn shares_segment_events_with(
        &self,
        other: &Self,
        room_id: &str,
        segment_id: SegmentId,
    ) -> bool {
        let bucket = |tables: &Self| {
            tables
                .rooms
                .get(room_id)
                .and_then(|room| room.events.get(&segment_id).cloned())
        };
        match (bucket(self), bucket(other)) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }
}
