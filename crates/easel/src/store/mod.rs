//! Per-workspace persistence.
//!
//! Every workspace lives in its own directory under `<data_dir>/workspaces/`.
//! Read-modify-write sequences on the UI state go through [`WorkspaceLocks`]
//! and `ui.json` is always replaced atomically, so a reader never observes a
//! half-written canvas.

mod lock;
pub mod models;
mod workspace;

pub use lock::{WorkspaceGuard, WorkspaceLocks};
pub use workspace::{DataDocument, WorkspaceStore};

/// Errors from workspace persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A document could not be encoded or decoded.
    #[error("invalid document: {0}")]
    Json(#[from] serde_json::Error),

    /// The addressed workspace or document does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An identifier contains characters outside `[A-Za-z0-9_-]`.
    #[error("invalid id: {0:?}")]
    InvalidId(String),

    /// A panel or workspace with this ID already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The workspace lock could not be acquired in time.
    #[error("timed out waiting for lock on workspace {0}")]
    LockTimeout(String),
}

/// Longest identifier accepted for workspaces and documents.
pub const MAX_ID_LEN: usize = 128;

/// Check that `id` is safe to use as a path component.
pub fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
