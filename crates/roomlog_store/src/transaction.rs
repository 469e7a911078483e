//! Read and write transactions.

use crate::error::StoreResult;
use crate::event::Event;
use crate::record::{EventRecord, PendingEventRecord, RelationRecord, SegmentRecord};
use crate::store::Store;
use crate::tables::Tables;
use parking_lot::MutexGuard;
use std::ops::Deref;
use std::sync::Arc;

/// A consistent, read-only view of the store.
#[derive(Debug, Clone)]
pub struct ReadTransaction {
    tables: Arc<Tables>,
}

impl ReadTransaction {
    pub(crate) fn new(tables: Arc<Tables>) -> Self {
        Self { tables }
    }
}

impl Deref for ReadTransaction {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.tables
    }
}

/// A read-write transaction spanning every logical store.
///
/// Holds the store's single writer lock for its whole lifetime. Writes go to
/// a shallow copy of the tables that clones a room partition the first time
/// it is written, and replaces the committed state in one step on
/// [`commit`](Self::commit). Dropping the transaction without
/// committing discards every write.
pub struct WriteTransaction<'a> {
    store: &'a Store,
    tables: Tables,
    write_count: usize,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(store: &'a Store, tables: Tables, guard: MutexGuard<'a, ()>) -> Self {
        Self {
            store,
            tables,
            write_count: 0,
            _guard: guard,
        }
    }

    /// Returns the number of writes recorded so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.write_count
    }

    /// Inserts a new event. Fails if the key or the event id is taken.
    pub fn insert_event(&mut self, record: EventRecord) -> StoreResult<()> {
        self.tables.insert_event(record)?;
        self.write_count += 1;
        Ok(())
    }

    /// Replaces an existing event record.
    pub fn update_event(&mut self, record: EventRecord) -> StoreResult<()> {
        self.tables.update_event(record)?;
        self.write_count += 1;
        Ok(())
    }

    /// Adds a new segment. Fails if the id is taken.
    pub fn add_segment(&mut self, segment: SegmentRecord) -> StoreResult<()> {
        self.tables.add_segment(segment)?;
        self.write_count += 1;
        Ok(())
    }

    /// Replaces an existing segment.
    pub fn update_segment(&mut self, segment: SegmentRecord) -> StoreResult<()> {
        self.tables.update_segment(segment)?;
        self.write_count += 1;
        Ok(())
    }

    /// Adds a relation edge.
    pub fn add_relation(&mut self, relation: RelationRecord) {
        self.tables.add_relation(relation);
        self.write_count += 1;
    }

    /// Removes a relation edge. Returns whether it existed.
    pub fn remove_relation(&mut self, relation: &RelationRecord) -> bool {
        self.write_count += 1;
        self.tables.remove_relation(relation)
    }

    /// Removes every edge whose source is `source_event_id`.
    pub fn remove_relations_from_source(&mut self, room_id: &str, source_event_id: &str) -> usize {
        self.write_count += 1;
        self.tables
            .remove_relations_from_source(room_id, source_event_id)
    }

    /// Removes every edge pointing at `target_event_id`.
    pub fn remove_relations_to_target(&mut self, room_id: &str, target_event_id: &str) -> usize {
        self.write_count += 1;
        self.tables.remove_relations_to_target(room_id, target_event_id)
    }

    /// Sets a room state event.
    pub fn set_room_state(&mut self, room_id: &str, event: Event) {
        self.tables.set_room_state(room_id, event);
        self.write_count += 1;
    }

    /// Queues a pending event.
    pub fn add_pending(&mut self, pending: PendingEventRecord) -> StoreResult<()> {
        self.tables.add_pending(pending)?;
        self.write_count += 1;
        Ok(())
    }

    /// Removes a pending event from the queue.
    pub fn remove_pending(
        &mut self,
        room_id: &str,
        queue_index: u32,
    ) -> Option<PendingEventRecord> {
        self.write_count += 1;
        self.tables.remove_pending(room_id, queue_index)
    }

    /// Commits all writes atomically and releases the writer lock.
    pub fn commit(self) -> StoreResult<u64> {
        let sequence = self.store.install(self.tables);
        tracing::trace!(sequence, writes = self.write_count, "committed write transaction");
        Ok(sequence)
    }

    /// Discards all writes and releases the writer lock.
    pub fn abort(self) {
        tracing::debug!(writes = self.write_count, "aborted write transaction");
    }
}

impl Deref for WriteTransaction<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.tables
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("write_count", &self.write_count)
            .finish_non_exhaustive()
    }
}
