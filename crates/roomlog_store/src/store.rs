//! Store handle, transaction entry points and snapshot persistence.

use crate::error::{StoreError, StoreResult};
use crate::tables::Tables;
use crate::transaction::{ReadTransaction, WriteTransaction};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Magic bytes at the start of a snapshot.
pub const SNAPSHOT_MAGIC: &[u8; 4] = b"RLOG";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 2;

/// The room log store.
///
/// ## Single-Writer Guarantee
///
/// Only one write transaction can be active at a time. `begin_write()`
/// blocks until the previous writer has committed or been dropped. Readers
/// never block: each read transaction pins the state that was committed when
/// it started.
pub struct Store {
    tables: RwLock<Arc<Tables>>,
    write_lock: Mutex<()>,
    committed_seq: AtomicU64,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_tables(Tables::default())
    }

    fn with_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(Arc::new(tables)),
            write_lock: Mutex::new(()),
            committed_seq: AtomicU64::new(0),
        }
    }

    /// Begins a read transaction on the latest committed state.
    pub fn begin_read(&self) -> ReadTransaction {
        ReadTransaction::new(Arc::clone(&self.tables.read()))
    }

    /// Begins a read-write transaction, taking the writer lock.
    ///
    /// The copy it writes to shares every room partition with the committed
    /// state until that partition is first written.
    pub fn begin_write(&self) -> WriteTransaction<'_> {
        let guard = self.write_lock.lock();
        let tables = Tables::clone(&self.tables.read());
        WriteTransaction::new(self, tables, guard)
    }

    /// Runs `f` in a write transaction, committing on `Ok` and discarding on `Err`.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut txn = self.begin_write();
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    /// Returns the sequence number of the last commit.
    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.committed_seq.load(Ordering::SeqCst)
    }

    pub(crate) fn install(&self, tables: Tables) -> u64 {
        *self.tables.write() = Arc::new(tables);
        self.committed_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Encodes the committed state as a snapshot.
    pub fn snapshot_bytes(&self) -> StoreResult<Vec<u8>> {
        let tables = self.begin_read();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(SNAPSHOT_MAGIC);
        bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        ciborium::into_writer(&*tables, &mut bytes)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(bytes)
    }

    /// Restores a store from snapshot bytes.
    pub fn from_snapshot_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() < 6 || &bytes[0..4] != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidSnapshot("bad magic".into()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidSnapshot(format!(
                "unsupported version {version}"
            )));
        }
        let mut tables: Tables =
            ciborium::from_reader(&bytes[6..]).map_err(|e| StoreError::Codec(e.to_string()))?;
        tables.rebuild_indexes();
        Ok(Self::with_tables(tables))
    }

    /// Writes a snapshot to `path`, replacing it atomically.
    pub fn save_to_file(&self, path: &Path) -> StoreResult<()> {
        let bytes = self.snapshot_bytes()?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Opens a store from a snapshot file.
    pub fn open_file(path: &Path) -> StoreResult<Self> {
        let bytes = fs::read(path)?;
        Self::from_snapshot_bytes(&bytes)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("committed_seq", &self.committed_seq())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::record::{EventRecord, RelationRecord, SegmentRecord};
    use serde_json::json;

    fn event(id: &str) -> Event {
        Event {
            event_id: id.into(),
            event_type: "m.room.message".into(),
            room_id: None,
            sender: "@alice:hs".into(),
            origin_server_ts: 1,
            content: json!({"body": id}),
            state_key: None,
            unsigned: None,
            redacts: None,
        }
    }

    #[test]
    fn commit_makes_writes_visible() {
        let store = Store::new();
        let mut txn = store.begin_write();
        txn.add_segment(SegmentRecord::new("!r", 0)).unwrap();
        txn.insert_event(EventRecord::new("!r", 0, 10, event("$a")))
            .unwrap();
        assert!(store.begin_read().event_by_id("!r", "$a").is_none());
        txn.commit().unwrap();

        let read = store.begin_read();
        assert_eq!(read.event_by_id("!r", "$a").unwrap().position, 10);
        assert_eq!(store.committed_seq(), 1);
    }

    #[test]
    fn dropped_transaction_discards_writes() {
        let store = Store::new();
        {
            let mut txn = store.begin_write();
            txn.add_segment(SegmentRecord::new("!r", 0)).unwrap();
        }
        assert!(store.begin_read().segment("!r", 0).is_none());
        assert_eq!(store.committed_seq(), 0);
    }

    #[test]
    fn closure_transaction_rolls_back_on_error() {
        let store = Store::new();
        let result: StoreResult<()> = store.transaction(|txn| {
            txn.insert_event(EventRecord::new("!r", 0, 1, event("$a")))?;
            txn.insert_event(EventRecord::new("!r", 0, 2, event("$a")))?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::DuplicateEventId { .. })));
        assert!(store.begin_read().event_by_id("!r", "$a").is_none());
    }

    #[test]
    fn range_scans_stay_within_segment() {
        let store = Store::new();
        let mut txn = store.begin_write();
        let rows = [(0, 5, "$a"), (0, 6, "$b"), (0, 7, "$c"), (1, 1, "$d")];
        for (segment, position, id) in rows {
            txn.insert_event(EventRecord::new("!r", segment, position, event(id)))
                .unwrap();
        }
        txn.commit().unwrap();

        let read = store.begin_read();
        let ids = |v: Vec<EventRecord>| {
            v.into_iter().map(|r| r.event.event_id).collect::<Vec<_>>()
        };
        assert_eq!(ids(read.events_before("!r", 0, 7, 10)), ["$a", "$b"]);
        assert_eq!(ids(read.events_after("!r", 0, 5, 1)), ["$b"]);
        assert_eq!(ids(read.first_events("!r", 0, 1)), ["$a"]);
        assert_eq!(ids(read.last_events("!r", 0, 2)), ["$b", "$c"]);
        assert_eq!(ids(read.last_events("!r", 1, 5)), ["$d"]);
    }

    #[test]
    fn find_first_occurring_respects_list_order() {
        let store = Store::new();
        store
            .transaction(|txn| {
                txn.insert_event(EventRecord::new("!r", 0, 1, event("$b")))?;
                txn.insert_event(EventRecord::new("!r", 0, 2, event("$c")))
            })
            .unwrap();
        let read = store.begin_read();
        assert_eq!(
            read.find_first_occurring_event_id("!r", &["$a", "$c", "$b"]),
            Some("$c")
        );
        assert_eq!(read.find_first_occurring_event_id("!other", &["$c"]), None);
    }

    #[test]
    fn relation_removal_by_source_and_target() {
        let store = Store::new();
        let mut txn = store.begin_write();
        let edge = |target: &str, source: &str| RelationRecord {
            room_id: "!r".into(),
            target_event_id: target.into(),
            rel_type: "m.annotation".into(),
            source_event_id: source.into(),
        };
        txn.add_relation(edge("$t", "$r1"));
        txn.add_relation(edge("$t", "$r2"));
        txn.add_relation(edge("$r1", "$x"));
        assert_eq!(txn.relations_for_target("!r", "$t").len(), 2);
        assert_eq!(txn.remove_relations_from_source("!r", "$r1"), 1);
        assert_eq!(txn.remove_relations_to_target("!r", "$r1"), 1);
        assert_eq!(txn.relations_for_target("!r", "$t").len(), 1);
    }

    #[test]
    fn snapshot_file_restores_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("room.rlog");

        let store = Store::new();
        store
            .transaction(|txn| {
                txn.add_segment(
                    SegmentRecord::new("!r", 0).with_previous_token(Some("t0".into())),
                )?;
                txn.insert_event(EventRecord::new("!r", 0, 3, event("$a")))
            })
            .unwrap();
        store.save_to_file(&path).unwrap();

        let restored = Store::open_file(&path).unwrap();
        let read = restored.begin_read();
        assert_eq!(read.event_by_id("!r", "$a").unwrap().position, 3);
        assert_eq!(
            read.live_segment("!r").unwrap().previous_token.as_deref(),
            Some("t0")
        );
    }

    #[test]
    fn write_copies_only_the_partitions_it_touches() {
        let store = Store::new();
        store
            .transaction(|txn| {
                txn.add_segment(SegmentRecord::new("!a", 0))?;
                txn.add_segment(SegmentRecord::new("!a", 1))?;
                txn.insert_event(EventRecord::new("!a", 0, 1, event("$a0")))?;
                txn.insert_event(EventRecord::new("!a", 1, 1, event("$a1")))?;
                txn.add_segment(SegmentRecord::new("!b", 0))?;
                txn.insert_event(EventRecord::new("!b", 0, 1, event("$b0")))
            })
            .unwrap();
        let before = store.begin_read();

        let mut txn = store.begin_write();
        txn.insert_event(EventRecord::new("!a", 1, 2, event("$a2")))
            .unwrap();
        assert!(txn.shares_room_with(&before, "!b"));
        assert!(!txn.shares_room_with(&before, "!a"));
        assert!(txn.shares_segment_events_with(&before, "!a", 0));
        assert!(!txn.shares_segment_events_with(&before, "!a", 1));
        txn.commit().unwrap();

        assert!(before.event_by_id("!a", "$a2").is_none());
        assert_eq!(store.begin_read().event_by_id("!a", "$a2").unwrap().position, 2);
    }

    #[test]
    fn relation_index_follows_targets_and_sources() {
        let store = Store::new();
        let edge = |target: &str, rel_type: &str, source: &str| RelationRecord {
            room_id: "!r".into(),
            target_event_id: target.into(),
            rel_type: rel_type.into(),
            source_event_id: source.into(),
        };
        store
            .transaction(|txn| -> StoreResult<()> {
                txn.add_relation(edge("$t", "m.annotation", "$s"));
                txn.add_relation(edge("$t", "m.reference", "$s"));
                txn.add_relation(edge("$u", "m.annotation", "$s"));
                txn.add_relation(edge("$t", "m.annotation", "$o"));
                txn.add_relation(edge("$t", "m.annotation", "$o"));
                Ok(())
            })
            .unwrap();

        let mut txn = store.begin_write();
        assert_eq!(txn.relations_for_target("!r", "$t").len(), 3);
        assert_eq!(
            txn.relations_for_target_and_type("!r", "$t", "m.reference").len(),
            1
        );
        assert!(txn.remove_relation(&edge("$t", "m.reference", "$s")));
        assert!(!txn.remove_relation(&edge("$t", "m.reference", "$s")));
        assert_eq!(txn.remove_relations_from_source("!r", "$s"), 2);
        assert!(txn.relations_for_target("!r", "$u").is_empty());
        assert_eq!(txn.relations_for_target("!r", "$t"), [edge("$t", "m.annotation", "$o")]);
        assert_eq!(txn.remove_relations_from_source("!r", "$s"), 0);
        assert_eq!(txn.room_relations("!r").count(), 1);
        assert!(txn.relations_for_target("!other", "$t").is_empty());
    }

    #[test]
    fn snapshot_restores_relation_sources() {
        let store = Store::new();
        store
            .transaction(|txn| -> StoreResult<()> {
                txn.add_relation(RelationRecord {
                    room_id: "!r".into(),
                    target_event_id: "$t".into(),
                    rel_type: "m.annotation".into(),
                    source_event_id: "$s".into(),
                });
                Ok(())
            })
            .unwrap();
        let restored = Store::from_snapshot_bytes(&store.snapshot_bytes().unwrap()).unwrap();
        let mut txn = restored.begin_write();
        assert_eq!(txn.remove_relations_from_source("!r", "$s"), 1);
        assert!(txn.relations_for_target("!r", "$t").is_empty());
    }

    #[test]
    fn snapshot_rejects_bad_magic() {
        let result = Store::from_snapshot_bytes(b"NOPE\x01\x00");
        assert!(matches!(result, Err(StoreError::InvalidSnapshot(_))));
    }
}
