//! Re-decryption of stored events once keys arrive.
//!
//! A [`DecryptionRequest`] is one cancellable unit of work. Its pipeline runs
//! prepare, decrypt, persist, then apply to the timeline. The cancel flag is
//! checked before every phase that has a side effect, so a disposed request
//! never writes anything after it was disposed.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use roomlog_core::{EventEntry, Timeline};
use roomlog_store::{DecryptionResult, Event, EventRecord, Store};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;

/// A newly available room key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomKey {
    /// Megolm session id.
    pub session_id: String,
    /// Curve25519 key of the sending device, if known.
    pub sender_key: Option<String>,
}

impl RoomKey {
    /// Creates a key for `session_id`.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sender_key: None,
        }
    }

    /// Returns true if `entry` is undecrypted and was encrypted with this key.
    pub fn matches(&self, entry: &EventEntry) -> bool {
        entry.needs_decryption()
            && entry.session_id() == Some(self.session_id.as_str())
            && self
                .sender_key
                .as_deref()
                .map_or(true, |key| entry.sender_key() == Some(key))
    }
}

/// Decrypts room events.
#[async_trait]
pub trait Decryptor: Send + Sync + 'static {
    /// Loads whatever decrypting `events` needs.
    async fn prepare(&self, _room_id: &str, _events: &[Event]) -> SyncResult<()> {
        Ok(())
    }

    /// Decrypts one event.
    ///
    /// An error fails only this event; the rest of the batch continues.
    async fn decrypt(&self, room_id: &str, event: &Event) -> SyncResult<DecryptionResult>;
}

/// Handle to one cancellable decryption run.
///
/// Clones share the cancel flag.
#[derive(Debug, Clone, Default)]
pub struct DecryptionRequest {
    disposed: Arc<AtomicBool>,
}

impl DecryptionRequest {
    /// Creates a live request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the request.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Returns true once disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn check(&self, phase: &str) -> SyncResult<()> {
        if self.is_disposed() {
            tracing::debug!(phase, "decryption request disposed");
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

/// What a decryption run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptionOutcome {
    /// Events that decrypted.
    pub decrypted: Vec<String>,
    /// Events whose decryption failed.
    pub failed: Vec<String>,
}

/// Runs decryption requests for one room.
pub struct DecryptionCoordinator<D> {
    room_id: String,
    decryptor: Arc<D>,
}

impl<D: Decryptor> DecryptionCoordinator<D> {
    /// Creates a coordinator for `room_id`.
    pub fn new(room_id: impl Into<String>, decryptor: Arc<D>) -> Self {
        Self {
            room_id: room_id.into(),
            decryptor,
        }
    }

    /// Decrypts the stored events `event_ids`, persists the results and
    /// applies them to `timeline`.
    ///
    /// Ids that aren't stored, aren't encrypted or are already decrypted are
    /// ignored, and a stored decryption is never overwritten. Fails with
    /// [`SyncError::Cancelled`] if `request` is disposed before persisting
    /// or before applying.
    pub async fn run(
        &self,
        request: &DecryptionRequest,
        event_ids: &[String],
        store: &Store,
        timeline: &Mutex<Timeline>,
    ) -> SyncResult<DecryptionOutcome> {
        request.check("prepare")?;
        let records: Vec<EventRecord> = {
            let read = store.begin_read();
            event_ids
                .iter()
                .filter_map(|id| read.event_by_id(&self.room_id, id))
                .filter(|r| r.event.is_encrypted() && !is_decrypted(r))
                .cloned()
                .collect()
        };
        if records.is_empty() {
            return Ok(DecryptionOutcome::default());
        }
        let events: Vec<Event> = records.iter().map(|r| r.event.clone()).collect();
        self.decryptor.prepare(&self.room_id, &events).await?;

        request.check("decrypt")?;
        let results = self.decrypt_all(events).await?;

        request.check("persist")?;
        let updated = store.transaction(|txn| -> SyncResult<Vec<EventRecord>> {
            let mut updated = Vec::with_capacity(records.len());
            for (record, result) in records.into_iter().zip(results) {
                // re-read: a gap fill or another run may have written it since
                let Some(current) = txn.event_by_id(&self.room_id, record.event_id()) else {
                    continue;
                };
                if is_decrypted(current) {
                    tracing::debug!(
                        room_id = %self.room_id,
                        event_id = %record.event_id(),
                        "already decrypted by another run, keeping it"
                    );
                    continue;
                }
                let mut record = current.clone();
                record.decryption = Some(result);
                txn.update_event(record.clone())?;
                updated.push(record);
            }
            // dropping the transaction discards every update above
            request.check("persist")?;
            Ok(updated)
        })?;

        let mut timeline = timeline.lock();
        request.check("apply")?;
        let mut outcome = DecryptionOutcome::default();
        for record in updated {
            let id = record.event_id().to_owned();
            let Some(result) = record.decryption else {
                continue;
            };
            match &result {
                DecryptionResult::Decrypted { .. } => outcome.decrypted.push(id.clone()),
                DecryptionResult::Failed { reason } => {
                    tracing::debug!(
                        room_id = %self.room_id,
                        event_id = %id,
                        %reason,
                        "decryption failed"
                    );
                    outcome.failed.push(id.clone());
                }
            }
            timeline.apply_decryption(&id, result);
        }
        tracing::debug!(
            room_id = %self.room_id,
            decrypted = outcome.decrypted.len(),
            failed = outcome.failed.len(),
            "decryption run finished"
        );
        Ok(outcome)
    }

    /// Decrypts every event concurrently, keeping input order.
    async fn decrypt_all(&self, events: Vec<Event>) -> SyncResult<Vec<DecryptionResult>> {
        let mut tasks = JoinSet::new();
        let count = events.len();
        for (index, event) in events.into_iter().enumerate() {
            let decryptor = Arc::clone(&self.decryptor);
            let room_id = self.room_id.clone();
            tasks.spawn(async move {
                let result = match decryptor.decrypt(&room_id, &event).await {
                    Ok(result) => result,
                    Err(err) => DecryptionResult::Failed {
                        reason: err.to_string(),
                    },
                };
                (index, result)
            });
        }

        let mut results: Vec<Option<DecryptionResult>> = vec![None; count];
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined?;
            results[index] = Some(result);
        }
        results
            .into_iter()
            .map(|r| r.ok_or_else(|| SyncError::Task("decryption task lost".into())))
            .collect()
    }
}

fn is_decrypted(record: &EventRecord) -> bool {
    matches!(record.decryption, Some(DecryptionResult::Decrypted { .. }))
}

impl<D> std::fmt::Debug for DecryptionCoordinator<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionCoordinator")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

/// A decryptor that knows a fixed set of sessions, for tests.
///
/// The cleartext is read from the `"cleartext"` field of the encrypted
/// content, so tests can build encrypted events inline.
#[derive(Debug, Default)]
pub struct MockDecryptor {
    sessions: Mutex<Vec<String>>,
    prepared: Mutex<usize>,
}

impl MockDecryptor {
    /// Creates a decryptor that knows no session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `session_id` decryptable.
    pub fn add_session(&self, session_id: impl Into<String>) {
        self.sessions.lock().push(session_id.into());
    }

    /// Number of prepare calls so far.
    pub fn prepare_calls(&self) -> usize {
        *self.prepared.lock()
    }
}

#[async_trait]
impl Decryptor for MockDecryptor {
    async fn prepare(&self, _room_id: &str, _events: &[Event]) -> SyncResult<()> {
        *self.prepared.lock() += 1;
        Ok(())
    }

    async fn decrypt(&self, _room_id: &str, event: &Event) -> SyncResult<DecryptionResult> {
        let session = event
            .content
            .get("session_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default();
        if !self.sessions.lock().iter().any(|s| s == session) {
            return Err(SyncError::Decryption(format!("unknown session {session}")));
        }
        let cleartext = event.content.get("cleartext").cloned().unwrap_or_default();
        Ok(DecryptionResult::Decrypted {
            event_type: cleartext
                .get("type")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("m.room.message")
                .to_owned(),
            content: cleartext.get("content").cloned().unwrap_or_default(),
        })
    }
}
