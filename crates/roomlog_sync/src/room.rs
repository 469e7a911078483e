//! The room driver.
//!
//! A [`Room`] owns one room's writers and timeline and runs every write in
//! its own store transaction. Live writes and gap writes take the same async
//! writer lock and hold it until their result is applied to the timeline, so
//! the timeline sees commits in commit order. The timeline sits behind a
//! plain mutex that is never held across an await point.

use crate::config::RoomConfig;
use crate::decryption::{
    DecryptionCoordinator, DecryptionOutcome, DecryptionRequest, Decryptor, RoomKey,
};
use crate::error::SyncResult;
use crate::gap_fill::GapFiller;
use crate::paginator::Paginator;
use parking_lot::{Mutex, MutexGuard};
use roomlog_core::{
    GapWriteResult, LiveWriteResult, LiveWriter, MemberChange, SegmentBoundaryEntry, SyncPayload,
    Timeline, TimelineDiff, TimelineEntry,
};
use roomlog_store::{PendingEventRecord, Store};
use serde_json::Value;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Drives one room: live sync, history, local echoes and decryption.
pub struct Room<P, D> {
    room_id: String,
    store: Arc<Store>,
    config: RoomConfig,
    live: tokio::sync::Mutex<LiveWriter>,
    timeline: Mutex<Timeline>,
    gaps: GapFiller<P>,
    decryption: DecryptionCoordinator<D>,
}

impl<P: Paginator, D: Decryptor> Room<P, D> {
    /// Creates a driver for `room_id` over `store`.
    pub fn new(
        room_id: impl Into<String>,
        store: Arc<Store>,
        paginator: Arc<P>,
        decryptor: Arc<D>,
        config: RoomConfig,
    ) -> Self {
        let room_id = room_id.into();
        Self {
            live: tokio::sync::Mutex::new(LiveWriter::new(room_id.clone(), &config.timeline)),
            timeline: Mutex::new(Timeline::new(room_id.clone(), config.timeline.clone())),
            gaps: GapFiller::new(room_id.clone(), paginator, config.clone()),
            decryption: DecryptionCoordinator::new(room_id.clone(), decryptor),
            room_id,
            store,
            config,
        }
    }

    /// Room this driver writes.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Restores writer state and loads the timeline from the store.
    pub async fn load(&self) -> SyncResult<()> {
        let mut live = self.live.lock().await;
        let read = self.store.begin_read();
        live.load(&read);
        self.timeline.lock().load(&read)?;
        Ok(())
    }

    /// Subscribes to timeline diffs.
    pub fn subscribe(&self) -> Receiver<TimelineDiff> {
        self.timeline.lock().subscribe()
    }

    /// Locks the timeline for reading. Don't hold the guard across awaits.
    pub fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock()
    }

    /// Writes one live sync payload and merges it into the timeline.
    ///
    /// Newly written encrypted events are decrypted right after the write.
    /// Returns the membership changes the payload carried.
    pub async fn sync(
        &self,
        payload: &SyncPayload,
        is_rejoin: bool,
    ) -> SyncResult<Vec<MemberChange>> {
        let mut live = self.live.lock().await;
        let mut txn = self.store.begin_write();
        let result = live.write_live(payload, is_rejoin, &mut txn)?;
        let echoes: Vec<String> = result
            .entries
            .iter()
            .filter_map(TimelineEntry::as_event)
            .filter_map(|e| e.transaction_id().map(str::to_owned))
            .collect();
        for echo in echoes {
            let confirmed = txn
                .pending_events(&self.room_id)
                .into_iter()
                .find(|p| p.txn_id == echo);
            if let Some(pending) = confirmed {
                txn.remove_pending(&self.room_id, pending.queue_index);
            }
        }
        txn.commit()?;
        live.after_commit(&result);

        let LiveWriteResult {
            entries,
            updated_entries,
            member_changes,
            changed_segments,
            ..
        } = result;
        let encrypted = encrypted_ids(&entries);
        {
            let mut timeline = self.timeline.lock();
            timeline.apply_segments(&changed_segments)?;
            timeline.append_live(entries)?;
            timeline.replace_entries(updated_entries)?;
        }
        drop(live);

        if !encrypted.is_empty() {
            self.decryption
                .run(&DecryptionRequest::new(), &encrypted, &self.store, &self.timeline)
                .await?;
        }
        Ok(member_changes)
    }

    /// Fills the gap behind `boundary` and merges the result.
    ///
    /// The page is fetched without the writer lock; the write and the merge
    /// run under it. Returns false if nothing was fetched: the boundary has
    /// no gap or a fill for it is already running.
    pub async fn fill_gap(&self, boundary: &SegmentBoundaryEntry) -> SyncResult<bool> {
        let Some(fetched) = self.gaps.fetch(boundary).await? else {
            return Ok(false);
        };
        let writer = self.live.lock().await;
        let GapWriteResult {
            entries,
            updated_entries,
            changed_segments,
        } = self.gaps.write(&self.store, boundary, &fetched)?;
        let encrypted = encrypted_ids(&entries);
        {
            let mut timeline = self.timeline.lock();
            timeline.apply_segments(&changed_segments)?;
            timeline.add_gap_entries(entries)?;
            timeline.replace_entries(updated_entries)?;
        }
        drop(writer);
        drop(fetched);

        if !encrypted.is_empty() {
            self.decryption
                .run(&DecryptionRequest::new(), &encrypted, &self.store, &self.timeline)
                .await?;
        }
        Ok(true)
    }

    /// Loads `amount` more entries at the top of the timeline, filling the
    /// gap there from the server when the store runs out.
    ///
    /// Returns true once the start of the room is reached.
    pub async fn load_more(&self, amount: usize) -> SyncResult<bool> {
        let reached_top = {
            let read = self.store.begin_read();
            self.timeline.lock().load_at_top(&read, amount)?
        };
        if !reached_top {
            return Ok(false);
        }

        let top = self
            .timeline
            .lock()
            .entries()
            .find_map(TimelineEntry::as_boundary)
            .filter(|b| b.is_start())
            .cloned();
        let Some(top) = top else {
            return Ok(true);
        };
        if top.is_edge_of_log() {
            return Ok(true);
        }
        if top.has_gap() {
            self.fill_gap(&top).await?;
            let read = self.store.begin_read();
            self.timeline.lock().load_at_top(&read, amount)?;
        }
        let at_start = self
            .timeline
            .lock()
            .entries()
            .find_map(TimelineEntry::as_boundary)
            .is_some_and(|b| b.is_start() && b.is_edge_of_log());
        Ok(at_start)
    }

    /// Queues a local echo and shows it in the timeline.
    ///
    /// Returns the transaction id assigned to it.
    pub fn enqueue(
        &self,
        event_type: &str,
        content: Value,
        redacts: Option<&str>,
    ) -> SyncResult<String> {
        let txn_id = uuid::Uuid::new_v4().to_string();
        let record = self.store.transaction(|txn| -> SyncResult<PendingEventRecord> {
            let queue_index = txn
                .pending_events(&self.room_id)
                .iter()
                .map(|p| p.queue_index + 1)
                .max()
                .unwrap_or(0);
            let record = PendingEventRecord {
                room_id: self.room_id.clone(),
                queue_index,
                txn_id: txn_id.clone(),
                event_type: event_type.to_owned(),
                content,
                sender: self.config.timeline.own_user_id.clone(),
                redacts: redacts.map(str::to_owned),
            };
            txn.add_pending(record.clone())?;
            Ok(record)
        })?;
        let read = self.store.begin_read();
        self.timeline.lock().add_pending(record, &read);
        tracing::debug!(room_id = %self.room_id, %txn_id, event_type, "queued local echo");
        Ok(txn_id)
    }

    /// Drops a queued local echo. Returns false if it wasn't queued.
    pub fn cancel_pending(&self, txn_id: &str) -> SyncResult<bool> {
        let removed = self.store.transaction(|txn| -> SyncResult<bool> {
            let queue_index = txn
                .pending_events(&self.room_id)
                .into_iter()
                .find(|p| p.txn_id == txn_id)
                .map(|p| p.queue_index);
            Ok(queue_index
                .and_then(|index| txn.remove_pending(&self.room_id, index))
                .is_some())
        })?;
        self.timeline.lock().remove_pending(txn_id);
        Ok(removed)
    }

    /// Retries decryption after `key` became available.
    ///
    /// Covers the named `event_ids` and every loaded entry still waiting for
    /// that key.
    pub async fn notify_room_key(
        &self,
        request: &DecryptionRequest,
        key: &RoomKey,
        event_ids: &[String],
    ) -> SyncResult<DecryptionOutcome> {
        let mut ids = event_ids.to_vec();
        {
            let timeline = self.timeline.lock();
            let waiting = timeline
                .entries()
                .filter_map(TimelineEntry::as_event)
                .filter(|e| key.matches(e))
                .map(|e| e.event_id().to_owned());
            for id in waiting {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        tracing::debug!(
            room_id = %self.room_id,
            session_id = %key.session_id,
            events = ids.len(),
            "retrying decryption"
        );
        self.decryption.run(request, &ids, &self.store, &self.timeline).await
    }
}

impl<P, D> std::fmt::Debug for Room<P, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("room_id", &self.room_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn encrypted_ids(entries: &[TimelineEntry]) -> Vec<String> {
    entries
        .iter()
        .filter_map(TimelineEntry::as_event)
        .filter(|e| e.needs_decryption())
        .map(|e| e.event_id().to_owned())
        .collect()
}
