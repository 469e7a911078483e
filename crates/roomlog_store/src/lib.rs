//! # roomlog store
//!
//! Transactional storage for room timelines.
//!
//! This crate provides:
//! - The room event model ([`Event`], [`Relation`])
//! - The logical stores a timeline writer works against: timeline events,
//!   timeline segments, the relation index, room state and pending events
//! - Single-writer read-write transactions spanning every store, committed
//!   atomically or discarded as a whole
//! - CBOR snapshot persistence
//!
//! ## Example
//!
//! ```rust
//! use roomlog_store::{SegmentRecord, Store};
//!
//! let store = Store::new();
//! let mut txn = store.begin_write();
//! txn.add_segment(SegmentRecord::new("!room:hs", 0)).unwrap();
//! txn.commit().unwrap();
//! assert!(store.begin_read().live_segment("!room:hs").is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod event;
mod record;
mod store;
mod tables;
mod transaction;

pub use error::{StoreError, StoreResult};
pub use event::{Event, Relation, ANNOTATION_RELATION, ENCRYPTED_TYPE, MEMBER_TYPE, REDACTION_TYPE};
pub use record::{
    AnnotationAggregate, DecryptionResult, EventRecord, PendingEventRecord, Position,
    RelationRecord, SegmentId, SegmentRecord,
};
pub use store::{Store, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};
pub use tables::Tables;
pub use transaction::{ReadTransaction, WriteTransaction};
