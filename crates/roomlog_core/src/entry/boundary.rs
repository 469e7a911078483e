use crate::sort_key::{Direction, SortKey};
use roomlog_store::{SegmentId, SegmentRecord};

/// Marks the start or end edge of a segment.
///
/// A boundary with a token is a gap: more events can be fetched there. A
/// boundary without a token and without a linked neighbour marks the start
/// of the room or the end of what the server had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentBoundaryEntry {
    segment: SegmentRecord,
    is_start: bool,
}

impl SegmentBoundaryEntry {
    /// Start boundary of `segment`.
    #[must_use]
    pub fn start(segment: SegmentRecord) -> Self {
        Self {
            segment,
            is_start: true,
        }
    }

    /// End boundary of `segment`.
    #[must_use]
    pub fn end(segment: SegmentRecord) -> Self {
        Self {
            segment,
            is_start: false,
        }
    }

    /// Boundary of `segment` on the side facing `direction`.
    #[must_use]
    pub fn for_direction(segment: SegmentRecord, direction: Direction) -> Self {
        match direction {
            Direction::Backward => Self::start(segment),
            Direction::Forward => Self::end(segment),
        }
    }

    /// Returns true for a start boundary.
    #[must_use]
    pub fn is_start(&self) -> bool {
        self.is_start
    }

    /// Segment the boundary belongs to.
    #[must_use]
    pub fn segment(&self) -> &SegmentRecord {
        &self.segment
    }

    /// Id of the segment the boundary belongs to.
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.segment.id
    }

    /// Start boundaries sort first in their segment, end boundaries last.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        if self.is_start {
            SortKey::min_for(self.segment.id)
        } else {
            SortKey::max_for(self.segment.id)
        }
    }

    /// Direction in which this boundary is filled.
    #[must_use]
    pub fn direction(&self) -> Direction {
        if self.is_start {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    /// Pagination cursor on this side.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        if self.is_start {
            self.segment.previous_token.as_deref()
        } else {
            self.segment.next_token.as_deref()
        }
    }

    /// Replaces the pagination cursor on this side.
    pub fn set_token(&mut self, token: Option<String>) {
        if self.is_start {
            self.segment.previous_token = token;
        } else {
            self.segment.next_token = token;
        }
    }

    /// Segment linked on this side.
    #[must_use]
    pub fn linked_segment_id(&self) -> Option<SegmentId> {
        if self.is_start {
            self.segment.previous_id
        } else {
            self.segment.next_id
        }
    }

    /// Links a segment on this side.
    pub fn set_linked_segment_id(&mut self, id: Option<SegmentId>) {
        if self.is_start {
            self.segment.previous_id = id;
        } else {
            self.segment.next_id = id;
        }
    }

    /// Returns true if events can still be fetched here.
    #[must_use]
    pub fn has_gap(&self) -> bool {
        self.token().is_some()
    }

    /// Returns true if nothing is known beyond this edge and nothing can be fetched.
    #[must_use]
    pub fn is_edge_of_log(&self) -> bool {
        self.token().is_none() && self.linked_segment_id().is_none()
    }

    /// The facing boundary of the neighbouring segment.
    #[must_use]
    pub fn neighbour_boundary(&self, neighbour: SegmentRecord) -> Self {
        Self {
            segment: neighbour,
            is_start: !self.is_start,
        }
    }

    /// Refreshes the segment after a write.
    pub fn update_segment(&mut self, segment: SegmentRecord) {
        self.segment = segment;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort_key::{MAX_POSITION, MIN_POSITION};

    #[test]
    fn start_boundary_reads_previous_side() {
        let mut segment = SegmentRecord::new("!r", 2);
        segment.previous_token = Some("p".into());
        segment.next_token = Some("n".into());
        let start = SegmentBoundaryEntry::start(segment.clone());
        let end = SegmentBoundaryEntry::end(segment);
        assert_eq!(start.token(), Some("p"));
        assert_eq!(end.token(), Some("n"));
        assert_eq!(start.sort_key().position, MIN_POSITION);
        assert_eq!(end.sort_key().position, MAX_POSITION);
        assert_eq!(start.direction(), Direction::Backward);
    }

    #[test]
    fn edge_of_log_without_token_or_link() {
        let mut boundary = SegmentBoundaryEntry::start(SegmentRecord::new("!r", 0));
        assert!(boundary.is_edge_of_log());
        boundary.set_linked_segment_id(Some(4));
        assert!(!boundary.is_edge_of_log());
        assert!(!boundary.has_gap());
    }

    #[test]
    fn neighbour_boundary_faces_back() {
        let start = SegmentBoundaryEntry::start(SegmentRecord::new("!r", 1));
        let neighbour = start.neighbour_boundary(SegmentRecord::new("!r", 0));
        assert!(!neighbour.is_start());
        assert_eq!(neighbour.segment_id(), 0);
    }
}
