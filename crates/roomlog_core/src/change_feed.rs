//! Ordered diffs of a timeline's entry list.
//!
//! The timeline emits one diff per structural change of its entry list.
//! Subscribers replay them against their own copy of the list; the view
//! layer decides how to render them.
//!
//! # Usage
//!
//! ```rust,ignore
//! let diffs = timeline.subscribe();
//! timeline.append_live(result.entries)?;
//! while let Ok(diff) = diffs.try_recv() {
//!     view.apply(diff);
//! }
//! ```

use crate::entry::{LocalRelationChange, TimelineEntry};
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// A single change to the entry list.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineDiff {
    /// `entry` was inserted at `index`.
    Insert {
        /// Position in the list after insertion.
        index: usize,
        /// The new entry.
        entry: TimelineEntry,
    },
    /// The entry at `index` changed in place.
    Update {
        /// Position in the list.
        index: usize,
        /// The entry after the change.
        entry: TimelineEntry,
        /// Which local relation state changed, if that's what changed.
        change: Option<LocalRelationChange>,
    },
    /// The entry at `index` was removed.
    Remove {
        /// Position in the list before removal.
        index: usize,
    },
}

/// Distributes timeline diffs to subscribers.
///
/// Diffs are delivered in the order they were emitted. Disconnected
/// subscribers are dropped on the next emit.
#[derive(Debug, Default)]
pub struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<TimelineDiff>>>,
}

impl ChangeFeed {
    /// Creates a feed with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to every future diff.
    pub fn subscribe(&self) -> Receiver<TimelineDiff> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends a diff to every live subscriber.
    pub fn emit(&self, diff: TimelineDiff) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(diff.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
