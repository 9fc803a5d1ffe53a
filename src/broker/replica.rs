//! Replica state: subscriptions, the attached byte sink, and the
//! high-water index used for segment truncation.
//!
//! A replica is the broker-side representation of a subscriber. It records
//! which topics the subscriber wants, the highest index the subscriber has
//! acknowledged (leader-only, fed by heartbeats), and, while the subscriber
//! is connected, the byte sink that live-tail and catch-up writes go to.
//!
//! At most one sink is attached at a time. Detaching fires a completion
//! signal so the attach call, which blocks for the lifetime of the sink, can
//! resolve.

use std::collections::BTreeSet;
use std::io;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ReplicaId, TopicId};

/// Byte sink a subscriber's messages are written to.
///
/// A failing write means the subscriber disconnected; the broker detaches
/// the sink and carries on. Implementations with internal buffering should
/// override [`flush`](ReplicaSink::flush), which runs after every
/// successful write.
#[async_trait]
pub trait ReplicaSink: Send + Sync {
    /// Write one encoded message frame.
    async fn write(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Flush buffered frames. The default is a no-op.
    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Snapshot of a replica's public state, as returned by broker queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    /// Replica id.
    pub id: ReplicaId,
    /// Connect URL recorded at creation. Opaque to the broker.
    pub url: String,
    /// Subscribed topics, ascending.
    pub topic_ids: Vec<TopicId>,
    /// Highest index acknowledged via heartbeat. Leader-only, transient.
    pub high_received_index: u64,
}

/// A collection of topic subscriptions plus the currently attached sink.
pub(crate) struct Replica {
    id: ReplicaId,
    url: String,
    topics: BTreeSet<TopicId>,
    high_received_index: u64,
    sink: Option<Box<dyn ReplicaSink>>,
    done: Option<oneshot::Sender<()>>,
}

impl Replica {
    pub(crate) fn new(id: ReplicaId, url: String) -> Self {
        Replica {
            id,
            url,
            topics: BTreeSet::new(),
            high_received_index: 0,
            sink: None,
            done: None,
        }
    }

    pub(crate) fn url(&self) -> &str {
        &self.url
    }

    /// Subscribed topic ids in ascending order. The broadcast topic (id 0),
    /// when subscribed, is always first, so configuration messages propagate
    /// before user data during catch-up.
    pub(crate) fn topic_ids(&self) -> Vec<TopicId> {
        self.topics.iter().copied().collect()
    }

    pub(crate) fn is_subscribed(&self, topic_id: TopicId) -> bool {
        self.topics.contains(&topic_id)
    }

    pub(crate) fn subscribe(&mut self, topic_id: TopicId) {
        self.topics.insert(topic_id);
    }

    pub(crate) fn unsubscribe(&mut self, topic_id: TopicId) {
        self.topics.remove(&topic_id);
    }

    pub(crate) fn clear_subscriptions(&mut self) {
        self.topics.clear();
    }

    pub(crate) fn high_received_index(&self) -> u64 {
        self.high_received_index
    }

    pub(crate) fn set_high_received_index(&mut self, index: u64) {
        self.high_received_index = index;
    }

    pub(crate) fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn info(&self) -> ReplicaInfo {
        ReplicaInfo {
            id: self.id,
            url: self.url.clone(),
            topic_ids: self.topic_ids(),
            high_received_index: self.high_received_index,
        }
    }

    /// Install `sink`, detaching any previous one (which fires its
    /// completion signal). Returns the new completion signal; it fires when
    /// this sink is detached for any reason.
    pub(crate) fn attach_sink(&mut self, sink: Box<dyn ReplicaSink>) -> oneshot::Receiver<()> {
        self.detach();
        let (tx, rx) = oneshot::channel();
        self.sink = Some(sink);
        self.done = Some(tx);
        rx
    }

    /// Clear the sink and fire the completion signal. Idempotent.
    pub(crate) fn detach(&mut self) {
        if self.sink.take().is_some() {
            debug!(replica = %self.id, "sink detached");
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
    }

    /// Write one frame to the attached sink.
    ///
    /// Returns [`Error::ReplicaUnavailable`] if no sink is attached, or if
    /// the write fails, in which case the sink is detached first.
    pub(crate) async fn write(&mut self, frame: &[u8]) -> Result<()> {
        let sink = self.sink.as_mut().ok_or(Error::ReplicaUnavailable)?;
        match sink.write(frame).await {
            Ok(()) => {
                let _ = sink.flush().await;
                Ok(())
            }
            Err(err) => {
                debug!(replica = %self.id, %err, "sink write failed");
                self.detach();
                Err(Error::ReplicaUnavailable)
            }
        }
    }
}
