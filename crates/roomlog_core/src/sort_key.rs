//! Sort keys: `(segment id, position)` pairs.
//!
//! Keys in the same segment order by position alone. Keys in different
//! segments can only be ordered through a [`SegmentOrderIndex`], and only when
//! both segments sit on the same island.

use crate::error::{CoreError, CoreResult};
use crate::segment_index::SegmentOrderIndex;
use roomlog_store::{EventRecord, Position, SegmentId};
use std::cmp::Ordering;
use std::fmt;

/// Lowest segment id; the first live segment of a room gets it.
pub const MIN_SEGMENT_ID: SegmentId = 0;
/// Reserved segment id for pending (unconfirmed) entries.
pub const PENDING_SEGMENT_ID: SegmentId = SegmentId::MAX;
/// Position of a segment's start boundary.
pub const MIN_POSITION: Position = Position::MIN;
/// Starting position of a fresh segment, leaving room in both directions.
pub const MID_POSITION: Position = 0x8000_0000;
/// Position of a segment's end boundary.
pub const MAX_POSITION: Position = Position::MAX;

/// Pagination / reading direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Towards older events.
    Backward,
    /// Towards newer events.
    Forward,
}

impl Direction {
    /// Returns the opposite direction.
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Backward => Self::Forward,
            Self::Forward => Self::Backward,
        }
    }

    /// Returns true for [`Direction::Forward`].
    #[must_use]
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::Forward)
    }

    /// Returns the server API spelling (`b` or `f`).
    #[must_use]
    pub const fn as_api_str(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

/// Position of an entry in the room log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SortKey {
    /// Segment holding the entry.
    pub segment_id: SegmentId,
    /// Position within the segment.
    pub position: Position,
}

impl SortKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(segment_id: SegmentId, position: Position) -> Self {
        Self {
            segment_id,
            position,
        }
    }

    /// Key the first live segment starts from.
    #[must_use]
    pub const fn live_default() -> Self {
        Self::segment_default(MIN_SEGMENT_ID)
    }

    /// Starting key of segment `segment_id`.
    #[must_use]
    pub const fn segment_default(segment_id: SegmentId) -> Self {
        Self::new(segment_id, MID_POSITION)
    }

    /// Key of the start boundary of a segment.
    #[must_use]
    pub const fn min_for(segment_id: SegmentId) -> Self {
        Self::new(segment_id, MIN_POSITION)
    }

    /// Key of the end boundary of a segment.
    #[must_use]
    pub const fn max_for(segment_id: SegmentId) -> Self {
        Self::new(segment_id, MAX_POSITION)
    }

    /// Key of the pending entry with the given queue index.
    #[must_use]
    pub const fn pending(queue_index: u32) -> Self {
        Self::new(PENDING_SEGMENT_ID, queue_index)
    }

    /// Key of a stored event.
    #[must_use]
    pub fn of(record: &EventRecord) -> Self {
        Self::new(record.segment_id, record.position)
    }

    /// Returns true if this key belongs to a pending entry.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        self.segment_id == PENDING_SEGMENT_ID
    }

    /// The key one position later.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::new(self.segment_id, self.position.saturating_add(1))
    }

    /// The key one position earlier.
    #[must_use]
    pub const fn previous(self) -> Self {
        Self::new(self.segment_id, self.position.saturating_sub(1))
    }

    /// The neighbouring key in `direction`.
    #[must_use]
    pub const fn next_for_direction(self, direction: Direction) -> Self {
        match direction {
            Direction::Forward => self.next(),
            Direction::Backward => self.previous(),
        }
    }

    /// Starting key of the segment allocated after this one.
    ///
    /// Fails once the next id would collide with [`PENDING_SEGMENT_ID`].
    pub fn next_segment_key(self) -> CoreResult<Self> {
        match self.segment_id.checked_add(1) {
            Some(id) if id != PENDING_SEGMENT_ID => Ok(Self::segment_default(id)),
            _ => Err(CoreError::SegmentIdsExhausted {
                last: self.segment_id,
            }),
        }
    }

    /// Compares two keys.
    ///
    /// Same-segment keys compare by position. Pending keys sort after every
    /// real segment. Everything else is resolved by `index` and fails if the
    /// two segments are unknown or on different islands.
    pub fn compare(&self, other: &Self, index: &SegmentOrderIndex) -> CoreResult<Ordering> {
        if self.segment_id == other.segment_id {
            return Ok(self.position.cmp(&other.position));
        }
        if self.is_pending() {
            return Ok(Ordering::Greater);
        }
        if other.is_pending() {
            return Ok(Ordering::Less);
        }
        index.compare(self.segment_id, other.segment_id)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.segment_id, self.position)
    }
}
