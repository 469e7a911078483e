//! Fetch-and-merge for segment gaps.
//!
//! At most one fill runs per segment edge. A fill requested for an edge that
//! already has one in flight returns immediately without doing anything.

use crate::config::RoomConfig;
use crate::error::SyncResult;
use crate::paginator::{PageRequest, Paginator};
use parking_lot::Mutex;
use roomlog_core::{Direction, FetchedPage, GapWriteResult, GapWriter, SegmentBoundaryEntry};
use roomlog_store::{SegmentId, Store};
use std::collections::HashSet;
use std::sync::Arc;

type EdgeKey = (SegmentId, Direction);

/// Releases an in-flight marker when the fill ends, however it ends.
struct InFlight<'a> {
    edges: &'a Mutex<HashSet<EdgeKey>>,
    key: EdgeKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.edges.lock().remove(&self.key);
    }
}

/// A fetched page waiting to be written.
///
/// The edge stays marked as in flight until this is dropped.
pub struct FetchedGap<'a> {
    page: FetchedPage,
    in_flight: InFlight<'a>,
}

impl FetchedGap<'_> {
    /// The fetched page.
    pub fn page(&self) -> &FetchedPage {
        &self.page
    }
}

impl std::fmt::Debug for FetchedGap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedGap")
            .field("segment_id", &self.in_flight.key.0)
            .field("events", &self.page.chunk.len())
            .finish()
    }
}

/// Fills gaps of one room through a [`Paginator`].
pub struct GapFiller<P> {
    room_id: String,
    paginator: Arc<P>,
    writer: GapWriter,
    config: RoomConfig,
    in_flight: Mutex<HashSet<EdgeKey>>,
}

impl<P: Paginator> GapFiller<P> {
    /// Creates a filler for `room_id`.
    pub fn new(room_id: impl Into<String>, paginator: Arc<P>, config: RoomConfig) -> Self {
        let room_id = room_id.into();
        Self {
            writer: GapWriter::new(room_id.clone(), &config.timeline),
            room_id,
            paginator,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Returns true while a fill for this edge is running.
    pub fn is_filling(&self, boundary: &SegmentBoundaryEntry) -> bool {
        self.in_flight
            .lock()
            .contains(&(boundary.segment_id(), boundary.direction()))
    }

    /// Fetches the page behind `boundary` and merges it into `store`.
    ///
    /// Returns `None` if the boundary has no gap or a fill for it is already
    /// in flight.
    pub async fn fill(
        &self,
        store: &Store,
        boundary: &SegmentBoundaryEntry,
    ) -> SyncResult<Option<GapWriteResult>> {
        let Some(fetched) = self.fetch(boundary).await? else {
            return Ok(None);
        };
        self.write(store, boundary, &fetched).map(Some)
    }

    /// Fetches the page behind `boundary` without writing it.
    ///
    /// Returns `None` if the boundary has no gap or a fill for it is already
    /// in flight.
    pub async fn fetch(
        &self,
        boundary: &SegmentBoundaryEntry,
    ) -> SyncResult<Option<FetchedGap<'_>>> {
        let Some(token) = boundary.token() else {
            return Ok(None);
        };
        let key = (boundary.segment_id(), boundary.direction());
        if !self.in_flight.lock().insert(key) {
            tracing::debug!(
                room_id = %self.room_id,
                segment_id = key.0,
                "gap fill already in flight"
            );
            return Ok(None);
        }
        let in_flight = InFlight {
            edges: &self.in_flight,
            key,
        };

        let request = PageRequest {
            from: token.to_owned(),
            direction: boundary.direction(),
            limit: self.config.page_size,
        };
        let page = self.fetch_with_retry(&request).await?;
        Ok(Some(FetchedGap { page, in_flight }))
    }

    /// Writes a fetched page in one transaction.
    ///
    /// Fails without writing if the edge's token moved on since the fetch.
    pub fn write(
        &self,
        store: &Store,
        boundary: &SegmentBoundaryEntry,
        fetched: &FetchedGap<'_>,
    ) -> SyncResult<GapWriteResult> {
        store.transaction(|txn| -> SyncResult<GapWriteResult> {
            Ok(self.writer.write_segment_fill(boundary, &fetched.page, txn)?)
        })
    }

    async fn fetch_with_retry(&self, request: &PageRequest) -> SyncResult<FetchedPage> {
        let retry = &self.config.retry;
        let mut attempt = 0;
        loop {
            let delay = retry.delay_for_attempt(attempt, &request.from);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
            match self.paginator.fetch(&self.room_id, request).await {
                Ok(page) => return Ok(page),
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    tracing::warn!(
                        room_id = %self.room_id,
                        attempt,
                        error = %err,
                        "gap fetch failed, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl<P> std::fmt::Debug for GapFiller<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GapFiller")
            .field("room_id", &self.room_id)
            .field("in_flight", &self.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}
