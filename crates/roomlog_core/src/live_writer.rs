//! Writes events arriving from the live sync feed.
//!
//! New events are appended to the live segment, the one with the highest id.
//! A discontinuity in the feed starts a new live segment that is *not* linked
//! to the previous one: the two only become ordered once a gap fill finds
//! the overlap between them.

use crate::config::TimelineConfig;
use crate::entry::{EventEntry, SegmentBoundaryEntry, TimelineEntry};
use crate::error::{CoreError, CoreResult};
use crate::member::{find_member_in_batch, MemberCache, MemberChange, MemberInfo};
use crate::relations::{merge_updated_records, RelationWriter};
use crate::sort_key::{SortKey, MIN_SEGMENT_ID};
use roomlog_store::{Event, EventRecord, SegmentRecord, Tables, WriteTransaction};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// State delivered alongside a timeline batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateBlock {
    /// State events preceding the timeline batch.
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Timeline part of a live sync response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineBlock {
    /// New events, oldest first.
    #[serde(default)]
    pub events: Vec<Event>,
    /// Whether events were left out before `events`.
    #[serde(default)]
    pub limited: bool,
    /// Pagination cursor for fetching what was left out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// One room's share of a live sync response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    /// State block.
    #[serde(default)]
    pub state: StateBlock,
    /// Timeline block.
    #[serde(default)]
    pub timeline: TimelineBlock,
}

/// Outcome of [`LiveWriter::write_live`].
#[derive(Debug, Clone)]
pub struct LiveWriteResult {
    /// New entries in log order, including new segment boundaries.
    pub entries: Vec<TimelineEntry>,
    /// Previously stored events that changed (relation targets).
    pub updated_entries: Vec<EventEntry>,
    /// Key of the last written live event.
    pub new_live_key: SortKey,
    /// Membership changes seen in the payload.
    pub member_changes: Vec<MemberChange>,
    /// Segments created or modified, to be applied to the order index
    /// after the transaction commits.
    pub changed_segments: Vec<SegmentRecord>,
}

/// Appends live events for one room.
#[derive(Debug)]
pub struct LiveWriter {
    room_id: String,
    relations: RelationWriter,
    member_cache: MemberCache,
    last_live_key: Option<SortKey>,
}

impl LiveWriter {
    /// Creates a writer for `room_id`.
    #[must_use]
    pub fn new(room_id: impl Into<String>, config: &TimelineConfig) -> Self {
        let room_id = room_id.into();
        Self {
            relations: RelationWriter::new(room_id.clone(), config.own_user_id.clone()),
            member_cache: MemberCache::new(config.member_cache_capacity),
            room_id,
            last_live_key: None,
        }
    }

    /// Reads the current live position from the store.
    pub fn load(&mut self, tables: &Tables) {
        self.last_live_key = live_key(&self.room_id, tables);
        tracing::debug!(
            room_id = %self.room_id,
            live_key = ?self.last_live_key,
            "loaded live position"
        );
    }

    /// Key of the last written live event, if any segment exists.
    #[must_use]
    pub fn last_live_key(&self) -> Option<SortKey> {
        self.last_live_key
    }

    /// Writes one sync payload inside `txn`.
    ///
    /// Nothing in the writer changes until [`after_commit`](Self::after_commit)
    /// is called, so a discarded transaction leaves it untouched.
    pub fn write_live(
        &mut self,
        payload: &SyncPayload,
        is_rejoin: bool,
        txn: &mut WriteTransaction<'_>,
    ) -> CoreResult<LiveWriteResult> {
        let mut events = dedupe_events(&self.room_id, &payload.timeline.events);
        let mut limited = payload.timeline.limited;
        let current = self.last_live_key.or_else(|| live_key(&self.room_id, txn));

        if is_rejoin {
            if let Some(index) = current.and_then(|key| self.rejoin_overlap(key, &events, txn)) {
                tracing::debug!(
                    room_id = %self.room_id,
                    skipped = index + 1,
                    "dropping events already written before rejoin"
                );
                events.drain(..=index);
                limited = false;
            }
        }

        let mut entries: Vec<TimelineEntry> = Vec::new();
        let mut changed_segments = Vec::new();
        let prev_batch = payload.timeline.prev_batch.clone();

        let mut key = match current {
            None => {
                let segment = SegmentRecord::new(self.room_id.clone(), MIN_SEGMENT_ID)
                    .with_previous_token(prev_batch);
                txn.add_segment(segment.clone())?;
                entries.push(SegmentBoundaryEntry::start(segment.clone()).into());
                changed_segments.push(segment);
                SortKey::live_default()
            }
            Some(key) if limited => {
                let mut old = txn
                    .segment(&self.room_id, key.segment_id)
                    .cloned()
                    .ok_or(CoreError::UnknownSegment {
                        segment_id: key.segment_id,
                    })?;
                old.next_token = prev_batch.clone();
                txn.update_segment(old.clone())?;

                let new_key = key.next_segment_key()?;
                let segment = SegmentRecord::new(self.room_id.clone(), new_key.segment_id)
                    .with_previous_token(prev_batch);
                txn.add_segment(segment.clone())?;
                tracing::debug!(
                    room_id = %self.room_id,
                    old_segment = old.id,
                    new_segment = segment.id,
                    "limited sync, starting new live segment"
                );

                entries.push(SegmentBoundaryEntry::end(old.clone()).into());
                entries.push(SegmentBoundaryEntry::start(segment.clone()).into());
                changed_segments.push(old);
                changed_segments.push(segment);
                new_key
            }
            Some(key) => key,
        };

        let mut batch_members: HashMap<String, MemberInfo> = HashMap::new();
        let mut member_changes = Vec::new();
        for event in &payload.state.events {
            self.apply_state(event, &mut batch_members, &mut member_changes, txn);
        }

        let mut updated_entries = Vec::new();
        let mut written = 0;
        for (index, event) in events.iter().enumerate() {
            if let Some(stored) = txn.event_by_id(&self.room_id, &event.event_id) {
                tracing::warn!(
                    room_id = %self.room_id,
                    event_id = %event.event_id,
                    segment_id = stored.segment_id,
                    "live event already stored, skipping it"
                );
                continue;
            }
            key = key.next();
            written += 1;
            let mut record =
                EventRecord::new(self.room_id.clone(), key.segment_id, key.position, event.clone());
            let member = self.resolve_member(
                event,
                index,
                &events,
                &payload.state.events,
                &batch_members,
                txn,
            );
            if let Some(member) = member {
                record.display_name = member.display_name;
                record.avatar_url = member.avatar_url;
            }
            self.relations.aggregate_on_arrival(&mut record, txn);
            txn.insert_event(record.clone())?;
            let updated = self.relations.apply_relation(&record, txn)?;
            entries.push(EventEntry::new(record).into());
            merge_updated_records(&mut entries, &mut updated_entries, updated);

            // state changes apply after the event, so it renders with the old state
            if event.is_state() {
                self.apply_state(event, &mut batch_members, &mut member_changes, txn);
            }
        }

        tracing::debug!(
            room_id = %self.room_id,
            written,
            updated = updated_entries.len(),
            live_key = %key,
            "wrote live events"
        );

        Ok(LiveWriteResult {
            entries,
            updated_entries,
            new_live_key: key,
            member_changes,
            changed_segments,
        })
    }

    /// Adopts the outcome of a committed [`write_live`](Self::write_live).
    pub fn after_commit(&mut self, result: &LiveWriteResult) {
        self.last_live_key = Some(result.new_live_key);
        for change in &result.member_changes {
            self.member_cache.set(change.member.clone());
        }
    }

    fn rejoin_overlap(&self, key: SortKey, events: &[Event], tables: &Tables) -> Option<usize> {
        let last = tables.event(&self.room_id, key.segment_id, key.position)?;
        events
            .iter()
            .position(|e| e.event_id == last.event.event_id)
    }

    fn apply_state(
        &self,
        event: &Event,
        batch_members: &mut HashMap<String, MemberInfo>,
        member_changes: &mut Vec<MemberChange>,
        txn: &mut WriteTransaction<'_>,
    ) {
        if let Some(member) = MemberInfo::from_member_event(event) {
            let previous_membership = event
                .prev_content()
                .and_then(|c| c.get("membership"))
                .and_then(|m| m.as_str())
                .map(str::to_owned)
                .or_else(|| {
                    let stored = txn.room_state(&self.room_id, &event.event_type, &member.user_id)?;
                    MemberInfo::from_member_event(stored).map(|m| m.membership)
                });
            batch_members.insert(member.user_id.clone(), member.clone());
            member_changes.push(MemberChange {
                member,
                previous_membership,
            });
        }
        txn.set_room_state(&self.room_id, event.clone());
    }

    fn resolve_member(
        &mut self,
        event: &Event,
        index: usize,
        events: &[Event],
        state: &[Event],
        batch_members: &HashMap<String, MemberInfo>,
        tables: &Tables,
    ) -> Option<MemberInfo> {
        let sender = event.sender.as_str();
        if event.is_member_event_for(sender) {
            if let Some(member) = MemberInfo::from_replacing_event(event) {
                return Some(member);
            }
        }
        if let Some(member) = batch_members.get(sender) {
            return Some(member.clone());
        }
        if let Some(member) = self.member_cache.get(sender) {
            return Some(member);
        }
        if let Some(stored) = tables.room_state(&self.room_id, roomlog_store::MEMBER_TYPE, sender) {
            if let Some(member) = MemberInfo::from_member_event(stored) {
                return Some(member);
            }
        }
        find_member_in_batch(sender, events, index, state)
    }
}

/// Key of the last event in the live segment, or the segment's starting key
/// if it's empty.
fn live_key(room_id: &str, tables: &Tables) -> Option<SortKey> {
    let live = tables.live_segment(room_id)?;
    let key = tables
        .last_events(room_id, live.id, 1)
        .first()
        .map_or(SortKey::segment_default(live.id), SortKey::of);
    Some(key)
}

/// Drops repeated event ids, keeping the first occurrence.
fn dedupe_events(room_id: &str, events: &[Event]) -> Vec<Event> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(events.len());
    for event in events {
        if seen.insert(event.event_id.as_str()) {
            unique.push(event.clone());
        } else {
            tracing::warn!(
                room_id = %room_id,
                event_id = %event.event_id,
                "duplicate event in sync batch, dropped"
            );
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomlog_store::Store;
    use serde_json::json;

    fn message(id: &str, sender: &str) -> Event {
        Event {
            event_id: id.into(),
            event_type: "m.room.message".into(),
            room_id: None,
            sender: sender.into(),
            origin_server_ts: 1,
            content: json!({"body": id}),
            state_key: None,
            unsigned: None,
            redacts: None,
        }
    }

    fn join(id: &str, user: &str, name: &str) -> Event {
        Event {
            event_id: id.into(),
            event_type: "m.room.member".into(),
            room_id: None,
            sender: user.into(),
            origin_server_ts: 1,
            content: json!({"membership": "join", "displayname": name}),
            state_key: Some(user.into()),
            unsigned: None,
            redacts: None,
        }
    }

    fn payload(events: Vec<Event>, limited: bool, prev_batch: Option<&str>) -> SyncPayload {
        SyncPayload {
            state: StateBlock::default(),
            timeline: TimelineBlock {
                events,
                limited,
                prev_batch: prev_batch.map(str::to_owned),
            },
        }
    }

    fn write(
        store: &Store,
        writer: &mut LiveWriter,
        payload: &SyncPayload,
        rejoin: bool,
    ) -> LiveWriteResult {
        let mut txn = store.begin_write();
        let result = writer.write_live(payload, rejoin, &mut txn).unwrap();
        txn.commit().unwrap();
        writer.after_commit(&result);
        result
    }

    fn event_ids(result: &LiveWriteResult) -> Vec<&str> {
        result.entries.iter().filter_map(TimelineEntry::event_id).collect()
    }

    #[test]
    fn first_sync_creates_live_segment() {
        let store = Store::new();
        let mut writer = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        let result = write(
            &store,
            &mut writer,
            &payload(vec![message("$a", "@a:hs"), message("$b", "@a:hs")], false, Some("t0")),
            false,
        );
        assert!(result.entries[0].as_boundary().unwrap().is_start());
        assert_eq!(event_ids(&result), ["$a", "$b"]);
        assert_eq!(result.changed_segments.len(), 1);

        let read = store.begin_read();
        let segment = read.live_segment("!r").unwrap();
        assert_eq!(segment.id, 0);
        assert_eq!(segment.previous_token.as_deref(), Some("t0"));
        assert_eq!(result.new_live_key, SortKey::of(read.event_by_id("!r", "$b").unwrap()));
    }

    #[test]
    fn duplicate_ids_in_one_payload_are_written_once() {
        let store = Store::new();
        let mut writer = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        let mut second = message("$a", "@a:hs");
        second.content = json!({"body": "second copy"});
        let result = write(
            &store,
            &mut writer,
            &payload(vec![message("$a", "@a:hs"), second], false, None),
            false,
        );
        assert_eq!(event_ids(&result), ["$a"]);
        let read = store.begin_read();
        assert_eq!(read.event_by_id("!r", "$a").unwrap().event.content["body"], "$a");
    }

    #[test]
    fn event_stored_by_earlier_payload_is_skipped() {
        let store = Store::new();
        let mut writer = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        let first = payload(vec![message("$a", "@a:hs"), message("$b", "@a:hs")], false, None);
        write(&store, &mut writer, &first, false);
        let second = payload(vec![message("$b", "@a:hs"), message("$c", "@a:hs")], false, None);
        let result = write(&store, &mut writer, &second, false);

        assert_eq!(event_ids(&result), ["$c"]);
        let read = store.begin_read();
        let b = read.event_by_id("!r", "$b").unwrap();
        let c = read.event_by_id("!r", "$c").unwrap();
        assert_eq!(c.position, b.position + 1);
        assert_eq!(result.new_live_key, SortKey::of(c));
    }

    #[test]
    fn limited_sync_starts_unlinked_segment() {
        let store = Store::new();
        let mut writer = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        let first = payload(vec![message("$a", "@a:hs")], false, Some("t0"));
        write(&store, &mut writer, &first, false);
        let result = write(
            &store,
            &mut writer,
            &payload(vec![message("$z", "@a:hs")], true, Some("t5")),
            false,
        );

        let boundaries: Vec<_> = result
            .entries
            .iter()
            .filter_map(TimelineEntry::as_boundary)
            .collect();
        assert_eq!(boundaries.len(), 2);
        assert!(!boundaries[0].is_start());
        assert_eq!(boundaries[0].segment_id(), 0);
        assert!(boundaries[1].is_start());
        assert_eq!(boundaries[1].segment_id(), 1);

        let read = store.begin_read();
        let old = read.segment("!r", 0).unwrap();
        let new = read.segment("!r", 1).unwrap();
        assert_eq!(old.next_token.as_deref(), Some("t5"));
        assert_eq!(new.previous_token.as_deref(), Some("t5"));
        assert_eq!(old.next_id, None);
        assert_eq!(new.previous_id, None);
        assert_eq!(read.event_by_id("!r", "$z").unwrap().segment_id, 1);
    }

    #[test]
    fn rejoin_skips_overlap_with_previous_tail() {
        let store = Store::new();
        let mut writer = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        let first = payload(
            vec![message("$a", "@a:hs"), message("$b", "@a:hs")],
            false,
            None,
        );
        write(&store, &mut writer, &first, false);

        let mut fresh = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        fresh.load(&store.begin_read());
        let result = write(
            &store,
            &mut fresh,
            &payload(
                vec![message("$a", "@a:hs"), message("$b", "@a:hs"), message("$c", "@a:hs")],
                true,
                Some("t9"),
            ),
            true,
        );
        assert_eq!(event_ids(&result), ["$c"]);
        assert!(result.changed_segments.is_empty());
        assert_eq!(store.begin_read().segments("!r").len(), 1);
    }

    #[test]
    fn state_applies_after_the_event() {
        let store = Store::new();
        let mut writer = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        let joined = payload(vec![join("$j1", "@a:hs", "Alice")], false, None);
        write(&store, &mut writer, &joined, false);

        let mut rename = join("$j2", "@a:hs", "Alicia");
        rename.unsigned = Some(json!({
            "prev_content": {"membership": "join", "displayname": "Alice"}
        }));
        let result = write(
            &store,
            &mut writer,
            &payload(vec![rename, message("$m", "@a:hs")], false, None),
            false,
        );

        let read = store.begin_read();
        assert_eq!(read.event_by_id("!r", "$j2").unwrap().display_name.as_deref(), Some("Alice"));
        assert_eq!(read.event_by_id("!r", "$m").unwrap().display_name.as_deref(), Some("Alicia"));
        let state = read.room_state("!r", "m.room.member", "@a:hs").unwrap();
        assert_eq!(state.event_id, "$j2");
        assert_eq!(result.member_changes.len(), 1);
        assert_eq!(result.member_changes[0].previous_membership.as_deref(), Some("join"));
    }

    #[test]
    fn discarded_transaction_leaves_writer_untouched() {
        let store = Store::new();
        let mut writer = LiveWriter::new("!r", &TimelineConfig::new("@me:hs"));
        {
            let mut txn = store.begin_write();
            writer
                .write_live(&payload(vec![message("$a", "@a:hs")], false, None), false, &mut txn)
                .unwrap();
        }
        assert!(writer.last_live_key().is_none());
        assert!(store.begin_read().live_segment("!r").is_none());
    }
}
