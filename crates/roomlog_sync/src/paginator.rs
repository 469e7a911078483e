//! Paginated history fetching.
//!
//! The paginator abstracts the server call, allowing for different
//! implementations (HTTP, mock for testing, etc.).

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use roomlog_core::{Direction, FetchedPage};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// One page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Pagination token to fetch from.
    pub from: String,
    /// Fetch direction.
    pub direction: Direction,
    /// Maximum number of events.
    pub limit: usize,
}

/// Fetches pages of room history.
#[async_trait]
pub trait Paginator: Send + Sync {
    /// Fetches one page for `room_id`.
    async fn fetch(&self, room_id: &str, request: &PageRequest) -> SyncResult<FetchedPage>;
}

#[derive(Debug, Clone)]
enum Reply {
    Page(FetchedPage),
    Fail { retryable: bool },
}

/// A paginator serving queued replies, keyed by the requested token.
#[derive(Debug, Default)]
pub struct MockPaginator {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    requests: Mutex<Vec<PageRequest>>,
    delay: Mutex<Duration>,
}

impl MockPaginator {
    /// Creates a mock with no replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a page served for requests from `page.start`.
    pub fn push_page(&self, page: FetchedPage) {
        self.replies
            .lock()
            .entry(page.start.clone())
            .or_default()
            .push_back(Reply::Page(page));
    }

    /// Queues a failure for requests from `from`.
    pub fn push_failure(&self, from: impl Into<String>, retryable: bool) {
        self.replies
            .lock()
            .entry(from.into())
            .or_default()
            .push_back(Reply::Fail { retryable });
    }

    /// Delays every reply, keeping fetches in flight for a while.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Paginator for MockPaginator {
    async fn fetch(&self, _room_id: &str, request: &PageRequest) -> SyncResult<FetchedPage> {
        self.requests.lock().push(request.clone());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let reply = self
            .replies
            .lock()
            .get_mut(&request.from)
            .and_then(VecDeque::pop_front);
        match reply {
            Some(Reply::Page(page)) => Ok(page),
            Some(Reply::Fail { retryable: true }) => {
                Err(SyncError::fetch_retryable("mock failure"))
            }
            Some(Reply::Fail { retryable: false }) => Err(SyncError::fetch_fatal("mock failure")),
            None => Err(SyncError::fetch_fatal(format!("no mock page for token {}", request.from))),
        }
    }
}
