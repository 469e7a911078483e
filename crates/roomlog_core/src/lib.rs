//! # roomlog core
//!
//! Segment-ordered timeline engine for chat rooms.
//!
//! This crate provides:
//! - Sort keys and the segment order index (islands of linked segments)
//! - Timeline entries: stored events, local echoes and segment boundaries
//! - The live writer, which appends sync batches to the live segment
//! - The gap writer, which merges back-paginated pages and links segments
//! - Relation aggregation for redactions and annotations
//! - The [`Timeline`] facade with an ordered diff feed
//!
//! ## Key Invariants
//!
//! - Two segments are ordered only once a gap fill has linked them
//! - Writers never touch in-memory state before their transaction commits
//! - Pending entries always sort after every stored entry
//! - A redacted event never contributes to an annotation aggregate
//!
//! ## Example
//!
//! ```rust,ignore
//! let store = Store::new();
//! let config = TimelineConfig::new("@me:example.org");
//! let mut writer = LiveWriter::new("!room:example.org", &config);
//! let mut timeline = Timeline::new("!room:example.org", config);
//!
//! let mut txn = store.begin_write();
//! let result = writer.write_live(&payload, false, &mut txn)?;
//! txn.commit()?;
//! writer.after_commit(&result);
//! timeline.apply_segments(&result.changed_segments)?;
//! timeline.append_live(result.entries)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod config;
pub mod entry;
mod error;
mod gap_writer;
mod live_writer;
pub mod member;
mod reader;
pub mod relations;
mod segment_index;
pub mod sort_key;
mod timeline;

pub use change_feed::{ChangeFeed, TimelineDiff};
pub use config::TimelineConfig;
pub use entry::{
    EventEntry, LocalRelationChange, LocalRelationState, PendingEventEntry, SegmentBoundaryEntry,
    TimelineEntry,
};
pub use error::{CoreError, CoreResult};
pub use gap_writer::{FetchedPage, GapWriteResult, GapWriter};
pub use live_writer::{LiveWriteResult, LiveWriter, StateBlock, SyncPayload, TimelineBlock};
pub use member::{MemberCache, MemberChange, MemberInfo};
pub use reader::TimelineReader;
pub use relations::RelationWriter;
pub use segment_index::SegmentOrderIndex;
pub use sort_key::{Direction, SortKey};
pub use timeline::Timeline;
