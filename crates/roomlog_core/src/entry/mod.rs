//! Timeline entries.
//!
//! Every item shown in a timeline is one of three variants, all ordered by
//! their [`SortKey`]:
//!
//! - [`EventEntry`]: a confirmed event from the store
//! - [`PendingEventEntry`]: a local echo waiting for the server
//! - [`SegmentBoundaryEntry`]: the start or end edge of a segment

mod boundary;
mod event_entry;
mod local_relations;
mod pending;

pub use boundary::SegmentBoundaryEntry;
pub use event_entry::EventEntry;
pub use local_relations::{
    LocalRelationChange, LocalRelationState, PendingAnnotation, PendingRelation,
};
pub use pending::PendingEventEntry;

use crate::error::CoreResult;
use crate::segment_index::SegmentOrderIndex;
use crate::sort_key::SortKey;
use std::cmp::Ordering;

/// One item of a timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEntry {
    /// A confirmed event.
    Event(EventEntry),
    /// A local echo.
    Pending(PendingEventEntry),
    /// A segment edge.
    Boundary(SegmentBoundaryEntry),
}

impl TimelineEntry {
    /// Position of the entry.
    #[must_use]
    pub fn sort_key(&self) -> SortKey {
        match self {
            Self::Event(e) => e.sort_key(),
            Self::Pending(p) => p.sort_key(),
            Self::Boundary(b) => b.sort_key(),
        }
    }

    /// Orders two entries through `index`.
    pub fn compare(&self, other: &Self, index: &SegmentOrderIndex) -> CoreResult<Ordering> {
        self.sort_key().compare(&other.sort_key(), index)
    }

    /// Id other entries use to relate to this one.
    ///
    /// Event id for confirmed events, transaction id for local echoes.
    #[must_use]
    pub fn relation_target_id(&self) -> Option<&str> {
        match self {
            Self::Event(e) => Some(e.event_id()),
            Self::Pending(p) => Some(p.id()),
            Self::Boundary(_) => None,
        }
    }

    /// Event id of a confirmed event.
    #[must_use]
    pub fn event_id(&self) -> Option<&str> {
        match self {
            Self::Event(e) => Some(e.event_id()),
            _ => None,
        }
    }

    /// Returns the confirmed event, if this is one.
    #[must_use]
    pub fn as_event(&self) -> Option<&EventEntry> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }

    /// Mutable access to the confirmed event, if this is one.
    pub fn as_event_mut(&mut self) -> Option<&mut EventEntry> {
        match self {
            Self::Event(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the local echo, if this is one.
    #[must_use]
    pub fn as_pending(&self) -> Option<&PendingEventEntry> {
        match self {
            Self::Pending(p) => Some(p),
            _ => None,
        }
    }

    /// Returns the boundary, if this is one.
    #[must_use]
    pub fn as_boundary(&self) -> Option<&SegmentBoundaryEntry> {
        match self {
            Self::Boundary(b) => Some(b),
            _ => None,
        }
    }

    /// Local relation state of events and local echoes.
    #[must_use]
    pub fn local_relations(&self) -> Option<&LocalRelationState> {
        match self {
            Self::Event(e) => Some(e.local_relations()),
            Self::Pending(p) => Some(p.local_relations()),
            Self::Boundary(_) => None,
        }
    }

    /// Applies a pending relation if it targets this entry.
    pub fn add_local_relation(
        &mut self,
        candidate: &PendingEventEntry,
    ) -> Option<LocalRelationChange> {
        match self {
            Self::Event(e) => e.add_local_relation(candidate),
            Self::Pending(p) => p.add_local_relation(candidate),
            Self::Boundary(_) => None,
        }
    }

    /// Removes a pending relation if it targets this entry.
    pub fn remove_local_relation(
        &mut self,
        candidate: &PendingEventEntry,
    ) -> Option<LocalRelationChange> {
        match self {
            Self::Event(e) => e.remove_local_relation(candidate),
            Self::Pending(p) => p.remove_local_relation(candidate),
            Self::Boundary(_) => None,
        }
    }
}

impl From<EventEntry> for TimelineEntry {
    fn from(entry: EventEntry) -> Self {
        Self::Event(entry)
    }
}

impl From<PendingEventEntry> for TimelineEntry {
    fn from(entry: PendingEventEntry) -> Self {
        Self::Pending(entry)
    }
}

impl From<SegmentBoundaryEntry> for TimelineEntry {
    fn from(entry: SegmentBoundaryEntry) -> Self {
        Self::Boundary(entry)
    }
}
