//! Reads stored entries across segments.
//!
//! Reading continues into a linked neighbour only when the edge between the
//! two has no pagination token left, i.e. when nothing is missing in between.
//! Boundary entries are emitted for every segment edge that is crossed or
//! reached.

use crate::entry::{EventEntry, SegmentBoundaryEntry, TimelineEntry};
use crate::error::{CoreError, CoreResult};
use crate::sort_key::{Direction, SortKey};
use roomlog_store::{SegmentRecord, Tables};

/// Reads one room's stored entries.
#[derive(Debug, Clone, Copy)]
pub struct TimelineReader<'a> {
    room_id: &'a str,
    tables: &'a Tables,
}

impl<'a> TimelineReader<'a> {
    /// Creates a reader over `tables`.
    #[must_use]
    pub fn new(room_id: &'a str, tables: &'a Tables) -> Self {
        Self { room_id, tables }
    }

    /// Reads up to `amount` entries backward from the end of the live segment.
    ///
    /// The live segment's end boundary is always included. Returns nothing
    /// for a room that has never been synced.
    pub fn read_from_end(&self, amount: usize) -> CoreResult<Vec<TimelineEntry>> {
        let Some(live) = self.tables.live_segment(self.room_id) else {
            return Ok(Vec::new());
        };
        let end = SegmentBoundaryEntry::end(live.clone());
        let mut entries = self.read_from(end.sort_key(), Direction::Backward, amount)?;
        entries.push(end.into());
        Ok(entries)
    }

    /// Reads up to about `amount` entries from `key` in `direction`,
    /// excluding `key` itself. Entries are returned in log order.
    pub fn read_from(
        &self,
        key: SortKey,
        direction: Direction,
        amount: usize,
    ) -> CoreResult<Vec<TimelineEntry>> {
        let mut walked: Vec<TimelineEntry> = Vec::new();
        let mut next_key = Some(key);

        while let Some(current) = next_key.take() {
            if walked.len() >= amount {
                break;
            }
            let remaining = amount - walked.len();
            let events = match direction {
                Direction::Forward => self.tables.events_after(
                    self.room_id,
                    current.segment_id,
                    current.position,
                    remaining,
                ),
                Direction::Backward => {
                    let mut events = self.tables.events_before(
                        self.room_id,
                        current.segment_id,
                        current.position,
                        remaining,
                    );
                    events.reverse();
                    events
                }
            };
            walked.extend(events.into_iter().map(|r| TimelineEntry::from(EventEntry::new(r))));
            if walked.len() >= amount {
                break;
            }

            let segment = self.segment(current.segment_id)?;
            let boundary = SegmentBoundaryEntry::for_direction(segment, direction);
            let crossing = if boundary.has_gap() {
                None
            } else {
                boundary.linked_segment_id()
            };
            walked.push(boundary.into());

            if let Some(neighbour_id) = crossing {
                let neighbour = self
                    .tables
                    .segment(self.room_id, neighbour_id)
                    .cloned()
                    .ok_or_else(|| {
                        CoreError::broken_link(
                            self.room_id,
                            format!(
                                "segment {} links to missing segment {neighbour_id}",
                                current.segment_id
                            ),
                        )
                    })?;
                let facing = SegmentBoundaryEntry::for_direction(neighbour, direction.reverse());
                next_key = Some(facing.sort_key());
                walked.push(facing.into());
            }
        }

        if direction == Direction::Backward {
            walked.reverse();
        }
        Ok(walked)
    }

    fn segment(&self, id: u32) -> CoreResult<SegmentRecord> {
        self.tables
            .segment(self.room_id, id)
            .cloned()
            .ok_or(CoreError::UnknownSegment { segment_id: id })
    }
}
