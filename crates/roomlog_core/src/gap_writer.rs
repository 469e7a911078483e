//! Merges paginated history into the log.
//!
//! A fill starts at a segment boundary that still has a pagination token.
//! Fetched events are written outward from the segment's edge until they
//! run into an event that is already stored; the segment holding that event
//! becomes the neighbour and both segments are linked.

use crate::config::TimelineConfig;
use crate::entry::{EventEntry, SegmentBoundaryEntry, TimelineEntry};
use crate::error::{CoreError, CoreResult};
use crate::member::{find_member_in_batch, MemberInfo};
use crate::relations::{merge_updated_records, RelationWriter};
use crate::sort_key::{Direction, SortKey};
use roomlog_store::{Event, EventRecord, SegmentId, SegmentRecord, Tables, WriteTransaction};
use serde::{Deserialize, Serialize};

/// One page of history returned by the pagination collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedPage {
    /// Events, ordered away from the edge the fetch started at.
    #[serde(default)]
    pub chunk: Vec<Event>,
    /// Token the fetch was issued from.
    pub start: String,
    /// Token to continue from; absent once the edge of the log is reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Member state for the senders in `chunk`.
    #[serde(default)]
    pub state: Vec<Event>,
}

/// Outcome of [`GapWriter::write_segment_fill`].
#[derive(Debug, Clone, Default)]
pub struct GapWriteResult {
    /// New events and refreshed boundaries, in log order.
    pub entries: Vec<TimelineEntry>,
    /// Previously stored events that changed (relation targets).
    pub updated_entries: Vec<EventEntry>,
    /// Segments whose links changed, to be applied to the order index after
    /// the transaction commits.
    pub changed_segments: Vec<SegmentRecord>,
}

struct Overlap {
    non_overlapping: Vec<Event>,
    neighbour: Option<SegmentRecord>,
}

/// Writes gap fills for one room.
#[derive(Debug, Clone)]
pub struct GapWriter {
    room_id: String,
    relations: RelationWriter,
}

impl GapWriter {
    /// Creates a writer for `room_id`.
    #[must_use]
    pub fn new(room_id: impl Into<String>, config: &TimelineConfig) -> Self {
        let room_id = room_id.into();
        Self {
            relations: RelationWriter::new(room_id.clone(), config.own_user_id.clone()),
            room_id,
        }
    }

    /// Merges `page`, fetched from `boundary`, into the store.
    ///
    /// Fails without writing anything if the boundary's token changed since
    /// the fetch was issued, or if linking would overwrite an existing link.
    pub fn write_segment_fill(
        &self,
        boundary: &SegmentBoundaryEntry,
        page: &FetchedPage,
        txn: &mut WriteTransaction<'_>,
    ) -> CoreResult<GapWriteResult> {
        let direction = boundary.direction();
        let segment = self.segment(boundary.segment_id(), txn)?;
        let mut edge = SegmentBoundaryEntry::for_direction(segment, direction);

        if edge.token() != Some(page.start.as_str()) {
            return Err(CoreError::StaleGapToken {
                segment_id: edge.segment_id(),
                fetched: Some(page.start.clone()),
                stored: edge.token().map(str::to_owned),
            });
        }

        if page.chunk.is_empty() {
            tracing::debug!(
                room_id = %self.room_id,
                segment_id = edge.segment_id(),
                direction = direction.as_api_str(),
                "edge of the log reached"
            );
            edge.set_token(None);
            txn.update_segment(edge.segment().clone())?;
            return Ok(GapWriteResult {
                entries: vec![edge.into()],
                ..GapWriteResult::default()
            });
        }

        let start_key = self.edge_key(&edge, txn);
        let Overlap {
            non_overlapping,
            neighbour,
        } = self.find_overlap(&edge, &page.chunk, txn)?;

        // member lookup scans in chronological order
        let chronological: Vec<Event> = match direction {
            Direction::Forward => non_overlapping.clone(),
            Direction::Backward => non_overlapping.iter().rev().cloned().collect(),
        };
        let last = non_overlapping.len().saturating_sub(1);

        let mut entries = Vec::with_capacity(non_overlapping.len() + 2);
        let mut updated_entries = Vec::new();
        let mut written = 0;
        let mut key = start_key;
        for (index, event) in non_overlapping.iter().enumerate() {
            if txn.event_by_id(&self.room_id, &event.event_id).is_some() {
                tracing::warn!(
                    room_id = %self.room_id,
                    event_id = %event.event_id,
                    "fetched event repeated within the page, skipping it"
                );
                continue;
            }
            key = key.next_for_direction(direction);
            written += 1;
            let mut record =
                EventRecord::new(self.room_id.clone(), key.segment_id, key.position, event.clone());
            let chronological_index = match direction {
                Direction::Forward => index,
                Direction::Backward => last - index,
            };
            let member = find_member(event, &chronological, chronological_index, &page.state);
            if let Some(member) = member {
                record.display_name = member.display_name;
                record.avatar_url = member.avatar_url;
            }
            self.relations.aggregate_on_arrival(&mut record, txn);
            txn.insert_event(record.clone())?;
            let updated = self.relations.apply_relation(&record, txn)?;
            entries.push(TimelineEntry::from(EventEntry::new(record)));
            merge_updated_records(&mut entries, &mut updated_entries, updated);
        }

        let changed_segments =
            self.update_segments(&mut edge, neighbour, page.end.clone(), &mut entries, txn)?;

        // entries were collected walking away from the edge
        if direction == Direction::Backward {
            entries.reverse();
        }

        tracing::debug!(
            room_id = %self.room_id,
            segment_id = edge.segment_id(),
            direction = direction.as_api_str(),
            fetched = page.chunk.len(),
            written,
            linked = !changed_segments.is_empty(),
            "filled gap"
        );

        Ok(GapWriteResult {
            entries,
            updated_entries,
            changed_segments,
        })
    }

    fn segment(&self, id: SegmentId, tables: &Tables) -> CoreResult<SegmentRecord> {
        tables
            .segment(&self.room_id, id)
            .cloned()
            .ok_or(CoreError::UnknownSegment { segment_id: id })
    }

    /// Key of the outermost event on the filled side, or the segment's
    /// starting key if it holds no events.
    fn edge_key(&self, edge: &SegmentBoundaryEntry, tables: &Tables) -> SortKey {
        let id = edge.segment_id();
        let events = match edge.direction() {
            Direction::Backward => tables.first_events(&self.room_id, id, 1),
            Direction::Forward => tables.last_events(&self.room_id, id, 1),
        };
        events
            .first()
            .map_or(SortKey::segment_default(id), SortKey::of)
    }

    /// Id of the event the fill should run into if the edge already has a
    /// linked neighbour: that neighbour's event facing back at us.
    fn expected_overlap_id(&self, edge: &SegmentBoundaryEntry, tables: &Tables) -> Option<String> {
        let neighbour = edge.linked_segment_id()?;
        let events = match edge.direction().reverse() {
            Direction::Backward => tables.first_events(&self.room_id, neighbour, 1),
            Direction::Forward => tables.last_events(&self.room_id, neighbour, 1),
        };
        events.into_iter().next().map(|r| r.event.event_id)
    }

    fn find_overlap(
        &self,
        edge: &SegmentBoundaryEntry,
        chunk: &[Event],
        tables: &Tables,
    ) -> CoreResult<Overlap> {
        let expected = self.expected_overlap_id(edge, tables);
        let mut non_overlapping = Vec::new();
        let mut neighbour = None;
        let mut remaining = chunk;

        while !remaining.is_empty() {
            let ids: Vec<&str> = remaining.iter().map(|e| e.event_id.as_str()).collect();
            let Some(duplicate) = tables.find_first_occurring_event_id(&self.room_id, &ids) else {
                non_overlapping.extend_from_slice(remaining);
                break;
            };
            let index = remaining
                .iter()
                .position(|e| e.event_id == duplicate)
                .ok_or_else(|| CoreError::unknown_event(&self.room_id, duplicate))?;
            non_overlapping.extend_from_slice(&remaining[..index]);

            if expected.as_deref().map_or(true, |id| id == duplicate) {
                let stored = tables
                    .event_by_id(&self.room_id, duplicate)
                    .ok_or_else(|| CoreError::unknown_event(&self.room_id, duplicate))?;
                if stored.segment_id == edge.segment_id() {
                    tracing::warn!(
                        room_id = %self.room_id,
                        segment_id = edge.segment_id(),
                        event_id = %duplicate,
                        "overlap found in the segment being filled, not linking it to itself"
                    );
                } else {
                    neighbour = Some(self.segment(stored.segment_id, tables)?);
                }
                break;
            }

            tracing::warn!(
                room_id = %self.room_id,
                segment_id = edge.segment_id(),
                event_id = %duplicate,
                expected = ?expected,
                "fetched event already stored away from the linked neighbour, skipping it"
            );
            remaining = &remaining[index + 1..];
        }

        Ok(Overlap {
            non_overlapping,
            neighbour,
        })
    }

    fn update_segments(
        &self,
        edge: &mut SegmentBoundaryEntry,
        neighbour: Option<SegmentRecord>,
        end: Option<String>,
        entries: &mut Vec<TimelineEntry>,
        txn: &mut WriteTransaction<'_>,
    ) -> CoreResult<Vec<SegmentRecord>> {
        let mut changed = Vec::new();
        match neighbour {
            Some(neighbour) => {
                let mut facing = edge.neighbour_boundary(neighbour);
                self.link(edge, facing.segment_id())?;
                self.link(&mut facing, edge.segment_id())?;
                edge.set_token(None);
                facing.set_token(None);
                txn.update_segment(facing.segment().clone())?;
                txn.update_segment(edge.segment().clone())?;
                changed.push(edge.segment().clone());
                changed.push(facing.segment().clone());
                entries.push(edge.clone().into());
                entries.push(facing.into());
            }
            None => {
                edge.set_token(end);
                txn.update_segment(edge.segment().clone())?;
                entries.push(edge.clone().into());
            }
        }
        Ok(changed)
    }

    fn link(&self, boundary: &mut SegmentBoundaryEntry, to: SegmentId) -> CoreResult<()> {
        match boundary.linked_segment_id() {
            None => {
                boundary.set_linked_segment_id(Some(to));
                Ok(())
            }
            Some(existing) if existing == to => Ok(()),
            Some(existing) => Err(CoreError::SegmentLinkConflict {
                room_id: self.room_id.clone(),
                segment_id: boundary.segment_id(),
                existing,
                requested: to,
            }),
        }
    }
}

/// Resolves the sender profile of `events[index]`, where `events` is in
/// chronological order.
fn find_member(
    event: &Event,
    events: &[Event],
    index: usize,
    state: &[Event],
) -> Option<MemberInfo> {
    let sender = event.sender.as_str();
    if event.is_member_event_for(sender) {
        if let Some(member) = MemberInfo::from_replacing_event(event) {
            return Some(member);
        }
    }
    find_member_in_batch(sender, events, index, state)
}
