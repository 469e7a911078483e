//! The timeline facade.
//!
//! A [`Timeline`] holds the loaded window of stored entries, sorted by sort
//! key, followed by the local echoes in send order. New entries are merged
//! in by binary search; the list is never re-sorted. Every change to the
//! list is published as a [`TimelineDiff`].

use crate::change_feed::{ChangeFeed, TimelineDiff};
use crate::config::TimelineConfig;
use crate::entry::{EventEntry, PendingEventEntry, TimelineEntry};
use crate::error::CoreResult;
use crate::reader::TimelineReader;
use crate::segment_index::SegmentOrderIndex;
use crate::sort_key::{Direction, SortKey};
use roomlog_store::{DecryptionResult, PendingEventRecord, Relation, SegmentRecord, Tables};
use std::cmp::Ordering;
use std::sync::mpsc::Receiver;

/// Ordered view over one room's stored and pending entries.
#[derive(Debug)]
pub struct Timeline {
    room_id: String,
    config: TimelineConfig,
    index: SegmentOrderIndex,
    remote: Vec<TimelineEntry>,
    pending: Vec<TimelineEntry>,
    feed: ChangeFeed,
}

impl Timeline {
    /// Creates an empty timeline for `room_id`.
    #[must_use]
    pub fn new(room_id: impl Into<String>, config: TimelineConfig) -> Self {
        let room_id = room_id.into();
        Self {
            index: SegmentOrderIndex::new(room_id.clone()),
            room_id,
            config,
            remote: Vec::new(),
            pending: Vec::new(),
            feed: ChangeFeed::new(),
        }
    }

    /// Room this timeline shows.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Subscribes to diffs of the entry list.
    pub fn subscribe(&self) -> Receiver<TimelineDiff> {
        self.feed.subscribe()
    }

    /// The segment order index used for comparisons.
    #[must_use]
    pub fn segment_index(&self) -> &SegmentOrderIndex {
        &self.index
    }

    /// Number of entries, pending ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.remote.len() + self.pending.len()
    }

    /// Returns true if nothing is loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries: stored ones in log order, then pending ones.
    pub fn entries(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.remote.iter().chain(self.pending.iter())
    }

    /// Entry at `index` of [`entries`](Self::entries).
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&TimelineEntry> {
        self.remote
            .get(index)
            .or_else(|| self.pending.get(index.checked_sub(self.remote.len())?))
    }

    /// Finds a loaded event by id.
    #[must_use]
    pub fn find_event(&self, event_id: &str) -> Option<&EventEntry> {
        self.remote
            .iter()
            .filter_map(TimelineEntry::as_event)
            .find(|e| e.event_id() == event_id)
    }

    /// Finds a pending entry by transaction id.
    #[must_use]
    pub fn find_pending(&self, txn_id: &str) -> Option<&PendingEventEntry> {
        self.pending
            .iter()
            .filter_map(TimelineEntry::as_pending)
            .find(|p| p.txn_id() == txn_id)
    }

    /// Rebuilds the segment index and loads the most recent window.
    pub fn load(&mut self, tables: &Tables) -> CoreResult<()> {
        self.index.rebuild(&tables.segments(&self.room_id))?;
        let entries = TimelineReader::new(&self.room_id, tables)
            .read_from_end(self.config.initial_load_amount)?;

        self.clear();
        for record in tables.pending_events(&self.room_id) {
            self.add_pending(record, tables);
        }
        self.add_entries(entries)?;
        tracing::debug!(
            room_id = %self.room_id,
            loaded = self.remote.len(),
            pending = self.pending.len(),
            islands = self.index.islands().len(),
            "loaded timeline"
        );
        Ok(())
    }

    /// Applies segments created or relinked by a committed write.
    pub fn apply_segments(&mut self, segments: &[SegmentRecord]) -> CoreResult<()> {
        self.index.apply(segments)
    }

    /// Merges entries produced by the live writer.
    ///
    /// A discontinuity leaves the new live segment on its own island. The
    /// loaded window can't hold entries from two islands, so it then restarts
    /// with the new live entries; older ones come back once a gap fill links
    /// the islands.
    pub fn append_live(&mut self, entries: Vec<TimelineEntry>) -> CoreResult<()> {
        let Some(live_key) = entries.last().map(TimelineEntry::sort_key) else {
            return Ok(());
        };
        let comparable = self
            .remote
            .last()
            .map_or(true, |last| last.sort_key().compare(&live_key, &self.index).is_ok());

        let entries = if comparable {
            entries
        } else {
            tracing::debug!(
                room_id = %self.room_id,
                "live segment not linked to loaded window, restarting it"
            );
            self.clear_remote();
            entries
                .into_iter()
                .filter(|e| e.sort_key().compare(&live_key, &self.index).is_ok())
                .collect()
        };

        let echoes: Vec<String> = entries
            .iter()
            .filter_map(TimelineEntry::as_event)
            .filter_map(|e| e.transaction_id().map(str::to_owned))
            .collect();
        for echo in echoes {
            if self.remove_pending(&echo).is_some() {
                tracing::debug!(
                    room_id = %self.room_id,
                    txn_id = %echo,
                    "remote echo replaced local echo"
                );
            }
        }
        self.add_entries(entries)
    }

    /// Merges entries produced by the gap writer.
    pub fn add_gap_entries(&mut self, entries: Vec<TimelineEntry>) -> CoreResult<()> {
        self.add_entries(entries)
    }

    /// Replaces loaded copies of updated events, keeping local state.
    ///
    /// Events outside the loaded window are ignored.
    pub fn replace_entries(&mut self, updated: Vec<EventEntry>) -> CoreResult<()> {
        for entry in updated {
            // an error means the event sits on an island that isn't loaded
            if let Ok(Ok(index)) = self.position_of(entry.sort_key()) {
                if let Some(existing) = self.remote[index].as_event_mut() {
                    existing.update_record(entry.record().clone());
                    let entry = self.remote[index].clone();
                    self.feed.emit(TimelineDiff::Update {
                        index,
                        entry,
                        change: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// Loads up to `amount` older entries above the first loaded event.
    ///
    /// Returns true if fewer entries were available, i.e. the top of what is
    /// stored, or a gap, was reached.
    pub fn load_at_top(&mut self, tables: &Tables, amount: usize) -> CoreResult<bool> {
        let Some(first) = self
            .remote
            .iter()
            .find_map(TimelineEntry::as_event)
            .map(EventEntry::sort_key)
        else {
            return Ok(true);
        };
        let entries = TimelineReader::new(&self.room_id, tables).read_from(
            first,
            Direction::Backward,
            amount,
        )?;
        let reached_top = entries.len() < amount;
        self.add_entries(entries)?;
        Ok(reached_top)
    }

    /// Adds a local echo and applies its relations to loaded entries.
    pub fn add_pending(&mut self, record: PendingEventRecord, tables: &Tables) {
        let mut entry = PendingEventEntry::new(record);
        if let Some(redacted) = entry.redacted_event_id().map(str::to_owned) {
            let relation = self.relation_of(&redacted, tables);
            entry.set_redacted_relation(relation);
        }
        self.apply_local_relation(&entry, true);

        let at = self
            .pending
            .partition_point(|p| p.sort_key().position <= entry.queue_index());
        let index = self.remote.len() + at;
        self.pending.insert(at, entry.into());
        self.feed.emit(TimelineDiff::Insert {
            index,
            entry: self.pending[at].clone(),
        });
    }

    /// Removes a local echo, e.g. after its send was aborted.
    pub fn remove_pending(&mut self, txn_id: &str) -> Option<PendingEventEntry> {
        let at = self
            .pending
            .iter()
            .position(|p| p.as_pending().is_some_and(|p| p.txn_id() == txn_id))?;
        let index = self.remote.len() + at;
        let TimelineEntry::Pending(entry) = self.pending.remove(at) else {
            return None;
        };
        self.feed.emit(TimelineDiff::Remove { index });
        self.apply_local_relation(&entry, false);
        Some(entry)
    }

    /// Replaces a local echo with the stored event the server confirmed.
    pub fn confirm_pending(&mut self, txn_id: &str, remote: EventEntry) -> CoreResult<()> {
        self.remove_pending(txn_id);
        self.add_entries(vec![remote.into()])
    }

    /// Attaches a decryption outcome to a loaded event.
    ///
    /// Returns false if the event isn't loaded.
    pub fn apply_decryption(&mut self, event_id: &str, result: DecryptionResult) -> bool {
        let Some(index) = self
            .remote
            .iter()
            .position(|e| e.event_id() == Some(event_id))
        else {
            return false;
        };
        if let Some(event) = self.remote[index].as_event_mut() {
            event.set_decryption(result);
        }
        self.feed.emit(TimelineDiff::Update {
            index,
            entry: self.remote[index].clone(),
            change: None,
        });
        true
    }

    /// Ids of loaded events still waiting for a decryption key, optionally
    /// limited to one session.
    #[must_use]
    pub fn undecrypted_event_ids(&self, session_id: Option<&str>) -> Vec<String> {
        self.remote
            .iter()
            .filter_map(TimelineEntry::as_event)
            .filter(|e| e.needs_decryption())
            .filter(|e| session_id.map_or(true, |s| e.session_id() == Some(s)))
            .map(|e| e.event_id().to_owned())
            .collect()
    }

    fn add_entries(&mut self, mut entries: Vec<TimelineEntry>) -> CoreResult<()> {
        for pending in self.pending.iter().filter_map(TimelineEntry::as_pending) {
            for entry in &mut entries {
                entry.add_local_relation(pending);
            }
        }

        for entry in entries {
            match self.position_of(entry.sort_key())? {
                Ok(index) => {
                    let existing = &mut self.remote[index];
                    match entry {
                        // keep local relation state of the loaded entry
                        TimelineEntry::Event(incoming) if existing.as_event().is_some() => {
                            if let Some(current) = existing.as_event_mut() {
                                current.update_record(incoming.record().clone());
                            }
                        }
                        other => *existing = other,
                    }
                    self.feed.emit(TimelineDiff::Update {
                        index,
                        entry: self.remote[index].clone(),
                        change: None,
                    });
                }
                Err(index) => {
                    self.remote.insert(index, entry);
                    self.feed.emit(TimelineDiff::Insert {
                        index,
                        entry: self.remote[index].clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Binary search over the loaded stored entries.
    fn position_of(&self, key: SortKey) -> CoreResult<Result<usize, usize>> {
        let (mut low, mut high) = (0, self.remote.len());
        while low < high {
            let mid = low + (high - low) / 2;
            match self.remote[mid].sort_key().compare(&key, &self.index)? {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    fn apply_local_relation(&mut self, candidate: &PendingEventEntry, add: bool) {
        let mut diffs = Vec::new();
        for (index, entry) in self.remote.iter_mut().chain(self.pending.iter_mut()).enumerate() {
            let change = if add {
                entry.add_local_relation(candidate)
            } else {
                entry.remove_local_relation(candidate)
            };
            if let Some(change) = change {
                diffs.push(TimelineDiff::Update {
                    index,
                    entry: entry.clone(),
                    change: Some(change),
                });
            }
        }
        for diff in diffs {
            self.feed.emit(diff);
        }
    }

    /// Relation carried by the entry `id`, stored, loaded or pending.
    fn relation_of(&self, id: &str, tables: &Tables) -> Option<Relation> {
        if let Some(event) = self.find_event(id) {
            return event.event().relation();
        }
        if let Some(pending) = self.find_pending(id) {
            return pending.relation();
        }
        tables
            .event_by_id(&self.room_id, id)
            .and_then(|r| r.event.relation())
    }

    fn clear_remote(&mut self) {
        for index in (0..self.remote.len()).rev() {
            self.feed.emit(TimelineDiff::Remove { index });
        }
        self.remote.clear();
    }

    fn clear(&mut self) {
        for index in (0..self.len()).rev() {
            self.feed.emit(TimelineDiff::Remove { index });
        }
        self.remote.clear();
        self.pending.clear();
    }
}
