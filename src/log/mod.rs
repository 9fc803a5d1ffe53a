//! The consumed replicated-log interface.
//!
//! The broker's durability and ordering come from a consensus log, but the
//! consensus algorithm itself (leader election, log replication, quorum) is
//! an external collaborator. This module defines the seam:
//!
//! - [`ReplicatedLog`]: what the broker needs from a log implementation:
//!   append-with-index, wait-on-index, leadership queries, and cluster
//!   lifecycle.
//! - [`StateMachine`]: the callbacks a log implementation drives: `apply`
//!   for every committed entry in strict index order, plus `snapshot` /
//!   `restore` for log compaction.
//!
//! A production deployment plugs a raft-backed implementation into this
//! trait. [`local::LocalLog`] is the in-process single-node implementation
//! used by tests and embedded setups.

pub mod local;

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub use local::LocalLog;

/// The kind of a committed log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A user payload submitted through [`ReplicatedLog::apply`].
    Command,
    /// Consensus metadata (e.g. a configuration change). The broker
    /// materializes these as broadcast no-ops so every replica's view of
    /// the log advances.
    Internal,
}

/// A committed log entry handed to [`StateMachine::apply`].
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Entry kind.
    pub kind: EntryKind,
    /// Log index. Strictly increasing, no gaps as observed by the FSM.
    pub index: u64,
    /// Entry payload; empty for internal entries.
    pub data: Bytes,
}

/// Role of the local node within the consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// This node drives replication and accepts writes.
    Leader,
    /// This node applies committed entries only.
    Follower,
    /// This node is campaigning for leadership.
    Candidate,
}

/// State machine driven by the replicated log.
///
/// `apply` is invoked for every committed entry, in strict index order, on
/// every node. Implementations must be deterministic: no wall clock, no
/// dependence on filesystem enumeration order, no ambient state.
///
/// A malformed committed entry or a disk fault while materializing one is
/// unrecoverable (the log is the source of truth), so `apply` aborts the
/// process instead of returning an error; the node must rejoin via
/// snapshot.
#[async_trait]
pub trait StateMachine: Send + Sync {
    /// Apply a committed entry.
    async fn apply(&self, entry: &LogEntry);

    /// Stream the full logical state to `w` for log compaction.
    ///
    /// Returns the index the snapshot covers.
    async fn snapshot(&self, w: &mut (dyn Write + Send)) -> Result<u64>;

    /// Replace the local state with a snapshot read from `r`.
    async fn restore(&self, r: &mut (dyn Read + Send)) -> Result<()>;
}

/// A replicated, totally-ordered log of opaque entries.
#[async_trait]
pub trait ReplicatedLog: Send + Sync {
    /// Open the log rooted at `path` and register the state machine that
    /// will receive committed entries.
    async fn open(&self, path: &Path, fsm: Arc<dyn StateMachine>) -> Result<()>;

    /// Close the log. Further operations fail with `Closed`.
    async fn close(&self) -> Result<()>;

    /// Submit an entry. Resolves once the entry is committed, returning the
    /// index it was assigned.
    async fn apply(&self, data: Bytes) -> Result<u64>;

    /// Resolves once the entry at `index` has been applied on this node.
    async fn wait(&self, index: u64) -> Result<()>;

    /// Current leader, if known, as `(node id, connect url)`.
    fn leader(&self) -> Option<(u64, String)>;

    /// Role of this node.
    fn role(&self) -> NodeRole;

    /// Bootstrap a new single-member cluster.
    async fn initialize(&self) -> Result<()>;

    /// Join an existing cluster through the member at `url`.
    async fn join(&self, url: &str) -> Result<()>;
}
