//! Error types for timeline operations.

use roomlog_store::{SegmentId, StoreError};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while writing or ordering a timeline.
///
/// Every variant is a hard failure: the write transaction it occurred in is
/// discarded and nothing is patched up behind the caller's back.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Previous/next pointers of two segments disagree.
    #[error("broken segment link in room {room_id}: {message}")]
    BrokenSegmentLink {
        /// Room whose segment chain is broken.
        room_id: String,
        /// Description of the broken link.
        message: String,
    },

    /// A segment id is not known to the order index or the store.
    #[error("unknown segment {segment_id}")]
    UnknownSegment {
        /// The unknown segment.
        segment_id: SegmentId,
    },

    /// Two segments live on different islands and cannot be ordered.
    #[error("segments {a} and {b} are not on the same island")]
    UnrelatedSegments {
        /// First segment.
        a: SegmentId,
        /// Second segment.
        b: SegmentId,
    },

    /// The pagination token stored for a segment edge changed since the
    /// fetch was issued.
    #[error(
        "stale gap token for segment {segment_id}: fetched from {fetched:?}, stored {stored:?}"
    )]
    StaleGapToken {
        /// Segment being filled.
        segment_id: SegmentId,
        /// Token the fetch was issued with.
        fetched: Option<String>,
        /// Token currently stored.
        stored: Option<String>,
    },

    /// A segment edge is already linked to a different segment.
    #[error(
        "refusing to relink segment {segment_id} from {existing} to {requested} in room {room_id}"
    )]
    SegmentLinkConflict {
        /// Room of the segment.
        room_id: String,
        /// Segment whose link would change.
        segment_id: SegmentId,
        /// Currently linked segment.
        existing: SegmentId,
        /// Segment the writer tried to link.
        requested: SegmentId,
    },

    /// Every usable segment id is taken.
    #[error("no segment id left after {last}")]
    SegmentIdsExhausted {
        /// Highest segment id in use.
        last: SegmentId,
    },

    /// An event expected in the store is missing.
    #[error("unknown event {event_id} in room {room_id}")]
    UnknownEvent {
        /// Room searched.
        room_id: String,
        /// Missing event id.
        event_id: String,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a broken segment link error.
    pub fn broken_link(room_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BrokenSegmentLink {
            room_id: room_id.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown event error.
    pub fn unknown_event(room_id: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self::UnknownEvent {
            room_id: room_id.into(),
            event_id: event_id.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}
