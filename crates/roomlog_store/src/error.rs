//! Error types for store operations.

use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred while reading or writing a snapshot file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A record with the same key already exists.
    #[error("duplicate key in {store}: {key}")]
    DuplicateKey {
        /// Logical store name.
        store: &'static str,
        /// Rendered key.
        key: String,
    },

    /// An event with the same id is already stored for the room.
    #[error("event {event_id} already stored in room {room_id}")]
    DuplicateEventId {
        /// Room the event belongs to.
        room_id: String,
        /// The duplicated event id.
        event_id: String,
    },

    /// An update targeted a record that does not exist.
    #[error("record not found in {store}: {key}")]
    NotFound {
        /// Logical store name.
        store: &'static str,
        /// Rendered key.
        key: String,
    },

    /// Snapshot encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Snapshot header is not recognised.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl StoreError {
    /// Creates a duplicate key error.
    pub fn duplicate_key(store: &'static str, key: impl Into<String>) -> Self {
        Self::DuplicateKey {
            store,
            key: key.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(store: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            store,
            key: key.into(),
        }
    }
}
