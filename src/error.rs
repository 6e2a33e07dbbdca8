//! Error kinds a worker needs to branch on, per the error handling design:
//! transient I/O is logged and dropped, permission errors get one retry,
//! malformed input is rejected at ingress, and invariant violations are
//! fatal to the whole session.

use thiserror::Error;

/// The outcome of a single update's journey through a worker.
///
/// Workers that can tell these apart (`sync_logic`, `save_local`) match on
/// this instead of inspecting `anyhow::Error` chains; everything else keeps
/// using plain `anyhow::Result` with `.context(...)`.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The file vanished, or a lock is briefly held by someone else.
    /// Log at debug, drop the one event, keep going.
    #[error("transient I/O error: {0}")]
    Transient(#[source] std::io::Error),

    /// Permission denied or read-only; caller should force-writable and
    /// retry once before giving up.
    #[error("permission error on {path}: {source}")]
    Permission {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The `Update` itself is invalid (leading/trailing slash, `..`,
    /// path too long). Reject at ingress; session continues.
    #[error("malformed update for path {path:?}: {reason}")]
    Malformed { path: String, reason: String },

    /// An invariant the protocol depends on was violated — the
    /// `initialSyncMarker` sentinel reached disk, an unknown frame tag,
    /// a corrupt length-prefixed frame. Fatal: terminate all workers,
    /// close the connection.
    #[error("fatal protocol violation: {0}")]
    Fatal(String),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Fatal(_))
    }
}
