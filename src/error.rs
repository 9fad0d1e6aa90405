//! Crate-wide error type shared by the compaction core and its
//! collaborator seams.

use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the compaction core and the collaborators it drives.
///
/// The type is `Clone` because the error-state task republishes the current
/// error to every interested writer; I/O sources are held behind an `Arc`
/// to keep cloning cheap.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Data that cannot be decoded: a malformed internal key, or anything a
    /// collaborator classifies as corruption. Never retried; latches the
    /// persistent error state.
    #[error("corruption detected: {reason}")]
    Corrupted {
        /// Description of the corrupt data.
        reason: String,
    },
    /// A file create, write, read, or remove failed for a non-permanent
    /// reason. Retried with backoff by the transact runner.
    #[error("io error: {0}")]
    Io(#[from] Arc<std::io::Error>),
    /// The session rejected a record commit.
    #[error("session commit failed: {reason}")]
    Commit {
        /// Description of the rejected commit.
        reason: String,
    },
    /// The database has been closed. Pending command acknowledgments are
    /// answered with this error on shutdown.
    #[error("database closed")]
    Closed,
}

impl Error {
    /// Build a corruption error.
    pub fn corrupted(reason: impl Into<String>) -> Self {
        Error::Corrupted {
            reason: reason.into(),
        }
    }

    /// Build an I/O error.
    pub fn io(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }

    /// Build a commit error.
    pub fn commit(reason: impl Into<String>) -> Self {
        Error::Commit {
            reason: reason.into(),
        }
    }

    /// Whether this error terminates the current compaction step instead of
    /// being retried.
    pub fn is_corrupted(&self) -> bool {
        matches!(self, Error::Corrupted { .. })
    }
}
