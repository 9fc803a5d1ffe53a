//! Crate-level errors.
//!
//! All fallible operations in this crate return [`Result`]. The error kinds
//! fall into four groups:
//!
//! - **Lifecycle misuse**: [`Error::PathRequired`],
//!   [`Error::ConnectionAddressRequired`], [`Error::Closed`].
//! - **Replica membership and sink state**: [`Error::ReplicaNotFound`],
//!   [`Error::ReplicaExists`], [`Error::ReplicaUnavailable`].
//! - **Leadership**: [`Error::NotLeader`] for leader-only operations invoked
//!   on a follower.
//! - **Data faults**: [`Error::Io`] for filesystem faults and
//!   [`Error::Corrupt`] for malformed segments, snapshots, or frames.
//!
//! Errors inside the apply path are handled differently: the consensus log
//! is the source of truth, so a malformed committed entry or a disk fault
//! while materializing one is unrecoverable and aborts the process. See
//! [`crate::broker`] for details.

use std::io;
use std::result;

use thiserror::Error as ThisError;

/// Result alias used throughout the crate.
pub type Result<T> = result::Result<T, Error>;

/// Errors reported by the broker and its collaborators.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The broker was opened without a data directory path.
    #[error("path required")]
    PathRequired,

    /// The broker was opened without a connection address.
    #[error("connection address required")]
    ConnectionAddressRequired,

    /// The broker is closed.
    #[error("broker closed")]
    Closed,

    /// No replica with the requested id exists.
    #[error("replica not found")]
    ReplicaNotFound,

    /// A replica with the requested id already exists.
    #[error("replica already exists")]
    ReplicaExists,

    /// The replica has no attached sink, or its sink failed and was detached.
    #[error("replica unavailable")]
    ReplicaUnavailable,

    /// A leader-only operation was invoked on a non-leader node.
    #[error("not leader")]
    NotLeader,

    /// A filesystem fault.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Malformed segment, snapshot, or message frame.
    #[error("corrupt data: {0}")]
    Corrupt(String),

    /// Malformed JSON command payload or metadata header.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A failure surfaced by the underlying replicated log.
    #[error("log: {0}")]
    Log(String),
}

impl Error {
    /// Returns true if this error indicates the replica's sink is gone.
    pub fn is_replica_unavailable(&self) -> bool {
        matches!(self, Error::ReplicaUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::ReplicaNotFound.to_string(), "replica not found");
        assert_eq!(Error::NotLeader.to_string(), "not leader");
        let err = Error::Corrupt("truncated header".to_string());
        assert!(err.to_string().contains("truncated header"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_is_replica_unavailable() {
        assert!(Error::ReplicaUnavailable.is_replica_unavailable());
        assert!(!Error::ReplicaExists.is_replica_unavailable());
    }

    #[test]
    fn test_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(Error::Closed);
        assert_eq!(err.to_string(), "broker closed");
    }
}
