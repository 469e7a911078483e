//! CLI command implementations.

pub mod inspect;
pub mod verify;

use roomlog_store::{Store, StoreError};
use std::path::{Path, PathBuf};

/// Errors shared by the commands.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No snapshot at the given path.
    #[error("no snapshot found at {0:?}")]
    NotFound(PathBuf),

    /// The snapshot could not be read.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The requested room isn't in the snapshot.
    #[error("unknown room {0}")]
    UnknownRoom(String),

    /// Output could not be encoded.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Verification found problems.
    #[error("verification failed with {0} problem(s)")]
    VerificationFailed(usize),
}

/// Opens the snapshot at `path`.
pub fn open(path: &Path) -> Result<Store, CommandError> {
    if !path.exists() {
        return Err(CommandError::NotFound(path.to_path_buf()));
    }
    let store = Store::open_file(path)?;
    tracing::debug!(path = %path.display(), "opened snapshot");
    Ok(store)
}

/// Resolves the rooms a command should look at.
pub fn select_rooms(all: Vec<String>, room: Option<&str>) -> Result<Vec<String>, CommandError> {
    match room {
        None => Ok(all),
        Some(room) if all.iter().any(|r| r == room) => Ok(vec![room.to_owned()]),
        Some(room) => Err(CommandError::UnknownRoom(room.to_owned())),
    }
}
