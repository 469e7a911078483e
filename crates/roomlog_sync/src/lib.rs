//! # roomlog sync
//!
//! Async orchestration for roomlog timelines.
//!
//! This crate provides:
//! - The [`Paginator`] collaborator for fetching room history
//! - Per-edge gap filling with retry and exponential backoff
//! - Cancellable decryption retries once room keys arrive
//! - The [`Room`] driver tying live sync, history, local echoes and
//!   decryption to one store and timeline
//!
//! ## Key Invariants
//!
//! - At most one gap fill per segment edge is in flight
//! - Every write runs in its own store transaction and commits as a whole
//! - A disposed decryption request writes nothing after disposal
//! - A failure to decrypt one event never fails the rest of its batch

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod decryption;
mod error;
mod gap_fill;
mod paginator;
mod room;

pub use config::{RetryConfig, RoomConfig};
pub use decryption::{
    DecryptionCoordinator, DecryptionOutcome, DecryptionRequest, Decryptor, MockDecryptor, RoomKey,
};
pub use error::{SyncError, SyncResult};
pub use gap_fill::{FetchedGap, GapFiller};
pub use paginator::{MockPaginator, PageRequest, Paginator};
pub use room::Room;
