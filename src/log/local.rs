//! In-process single-node implementation of [`ReplicatedLog`].
//!
//! `LocalLog` provides the full log seam without consensus: entries commit
//! as soon as they are appended, the FSM is invoked inline and serially, and
//! the node is always the leader. It backs the crate's tests and is useful
//! for embedded single-node deployments; a clustered deployment swaps in a
//! raft-backed implementation of the same trait.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use super::{EntryKind, LogEntry, NodeRole, ReplicatedLog, StateMachine};
use crate::error::{Error, Result};

/// Node id reported by a `LocalLog`.
const LOCAL_NODE_ID: u64 = 1;

struct Inner {
    fsm: Option<Arc<dyn StateMachine>>,
    path: Option<PathBuf>,
    last_index: u64,
}

/// Single-node, in-memory replicated log.
///
/// Appends are serialized behind a mutex, so the FSM observes entries in
/// strict index order exactly as it would under consensus.
pub struct LocalLog {
    inner: Mutex<Inner>,
    applied_tx: watch::Sender<u64>,
    applied_rx: watch::Receiver<u64>,
}

impl LocalLog {
    /// Create a closed log. Call [`ReplicatedLog::open`] before use.
    pub fn new() -> Self {
        let (applied_tx, applied_rx) = watch::channel(0);
        LocalLog {
            inner: Mutex::new(Inner {
                fsm: None,
                path: None,
                last_index: 0,
            }),
            applied_tx,
            applied_rx,
        }
    }

    /// Highest index applied so far.
    pub fn applied_index(&self) -> u64 {
        *self.applied_rx.borrow()
    }

    async fn append(&self, kind: EntryKind, data: Bytes) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let fsm = inner.fsm.clone().ok_or(Error::Closed)?;
        let index = inner.last_index + 1;
        let entry = LogEntry { kind, index, data };
        fsm.apply(&entry).await;
        inner.last_index = index;
        let _ = self.applied_tx.send(index);
        debug!(index, kind = ?entry.kind, "local log entry applied");
        Ok(index)
    }
}

impl Default for LocalLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    async fn open(&self, path: &Path, fsm: Arc<dyn StateMachine>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        std::fs::create_dir_all(path)?;
        inner.path = Some(path.to_path_buf());
        inner.fsm = Some(fsm);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.fsm.take().is_none() {
            return Err(Error::Closed);
        }
        inner.path = None;
        Ok(())
    }

    async fn apply(&self, data: Bytes) -> Result<u64> {
        self.append(EntryKind::Command, data).await
    }

    async fn wait(&self, index: u64) -> Result<()> {
        let mut rx = self.applied_rx.clone();
        rx.wait_for(|applied| *applied >= index)
            .await
            .map_err(|_| Error::Closed)?;
        Ok(())
    }

    fn leader(&self) -> Option<(u64, String)> {
        Some((LOCAL_NODE_ID, "local".to_string()))
    }

    fn role(&self) -> NodeRole {
        NodeRole::Leader
    }

    /// Bootstraps the "cluster" by committing one internal entry, mirroring
    /// the configuration entry a consensus layer writes on initialization.
    async fn initialize(&self) -> Result<()> {
        self.append(EntryKind::Internal, Bytes::new()).await?;
        Ok(())
    }

    async fn join(&self, _url: &str) -> Result<()> {
        Err(Error::Log(
            "single-node log cannot join a cluster".to_string(),
        ))
    }
}
