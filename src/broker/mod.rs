//! The broker: a topic-segmented message store materialized from a
//! consensus log.
//!
//! Every state-changing operation (topic creation, replica lifecycle,
//! subscription changes, and user publishes) flows through the replicated
//! log before it touches broker state. The log invokes the broker's state
//! machine (`apply`) for every committed entry in strict index order, on
//! every node, which is what makes replay deterministic and node state
//! convergent.
//!
//! # Locking
//!
//! One `tokio::sync::RwLock` guards the whole broker state: the topics map,
//! the replicas map, and the applied index. Writes are already serialized
//! by the log's apply callback; the lock exists to shield concurrent
//! readers (queries, heartbeats, attach flows) from in-flight applies.
//!
//! # Fatal errors
//!
//! Inside `apply`, a malformed committed payload or a disk fault is
//! unrecoverable: the log is the source of truth, and a node that cannot
//! materialize it has diverged. Those paths abort the process; the node
//! rejoins via snapshot.

mod commands;
mod fsm;
mod replica;
mod snapshot;
mod topic;

pub use commands::{
    CreateReplicaCommand, DeleteReplicaCommand, SubscribeCommand, UnsubscribeCommand,
};
pub use replica::{ReplicaInfo, ReplicaSink};
pub use snapshot::{SnapshotHeader, SnapshotReplica, SnapshotSegment, SnapshotTopic};

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::constants::{LOG_DIR_NAME, MAX_SEGMENT_SIZE, META_FILE_NAME};
use crate::error::{Error, Result};
use crate::log::{NodeRole, ReplicatedLog};
use crate::message::Message;
use crate::types::{MessageType, ReplicaId, TopicId};

use fsm::BrokerFsm;
use replica::Replica;
use topic::Topic;

/// Tunables for a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Largest size a segment may grow to before rollover.
    pub max_segment_size: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            max_segment_size: MAX_SEGMENT_SIZE,
        }
    }
}

/// A replicated, append-only message broker segmented into topics.
///
/// Cheap to clone; clones share the same underlying state.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
    log: Arc<dyn ReplicatedLog>,
}

/// State shared between the broker handle and its FSM.
pub(crate) struct BrokerShared {
    pub(crate) state: RwLock<BrokerState>,
}

/// Everything guarded by the broker lock.
pub(crate) struct BrokerState {
    path: Option<PathBuf>,
    url: String,
    /// Highest applied log index; equals `max(topic.high_index)` after any
    /// apply.
    applied_index: u64,
    max_segment_size: u64,
    topics: BTreeMap<TopicId, Topic>,
    replicas: BTreeMap<ReplicaId, Replica>,
}

impl Broker {
    /// Create a closed broker on top of `log` with default configuration.
    pub fn new(log: Arc<dyn ReplicatedLog>) -> Self {
        Self::with_config(log, BrokerConfig::default())
    }

    /// Create a closed broker with explicit configuration.
    pub fn with_config(log: Arc<dyn ReplicatedLog>, config: BrokerConfig) -> Self {
        Broker {
            shared: Arc::new(BrokerShared {
                state: RwLock::new(BrokerState {
                    path: None,
                    url: String::new(),
                    applied_index: 0,
                    max_segment_size: config.max_segment_size,
                    topics: BTreeMap::new(),
                    replicas: BTreeMap::new(),
                }),
            }),
            log,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open the broker rooted at `path`, advertising `url` to peers.
    ///
    /// Loads persisted metadata, reopens topics, and registers the broker's
    /// state machine with the replicated log. The broker must then be
    /// initialized or join a cluster before it can serve publishes.
    pub async fn open(&self, path: impl AsRef<Path>, url: &str) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::PathRequired);
        }
        if url.is_empty() {
            return Err(Error::ConnectionAddressRequired);
        }

        {
            let mut state = self.shared.state.write().await;
            state.path = Some(path.to_path_buf());
            state.url = url.to_string();
            if let Err(err) = state.load() {
                state.close();
                return Err(err);
            }
        }

        let fsm = Arc::new(BrokerFsm::new(self.shared.clone()));
        if let Err(err) = self.log.open(&path.join(LOG_DIR_NAME), fsm).await {
            self.shared.state.write().await.close();
            return Err(err);
        }

        info!(path = %path.display(), url, "broker opened");
        Ok(())
    }

    /// Close the broker and all topics.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write().await;
            state.ensure_open()?;
            state.close();
        }
        let _ = self.log.close().await;
        Ok(())
    }

    /// Bootstrap a new cluster.
    pub async fn initialize(&self) -> Result<()> {
        self.log.initialize().await
    }

    /// Join an existing cluster through the member at `url`.
    pub async fn join(&self, url: &str) -> Result<()> {
        self.log.join(url).await
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Write a message through the log. Resolves once the entry is
    /// committed, returning its index.
    pub async fn publish(&self, message: Message) -> Result<u64> {
        self.log.apply(message.encode()).await
    }

    /// Write a message and wait until it is applied on this node.
    pub async fn publish_sync(&self, message: Message) -> Result<u64> {
        let index = self.publish(message).await?;
        self.sync(index).await?;
        Ok(index)
    }

    /// Pause until the entry at `index` has been applied on this node.
    pub async fn sync(&self, index: u64) -> Result<()> {
        self.log.wait(index).await
    }

    // ========================================================================
    // Replica lifecycle (leader-validated, log-applied)
    // ========================================================================

    /// Create a replica reachable at `url`.
    ///
    /// The existence check runs synchronously before the command enters the
    /// log; the apply-time handler treats a duplicate id as a no-op, so a
    /// racing create is harmless.
    pub async fn create_replica(&self, id: ReplicaId, url: &str) -> Result<()> {
        if url.is_empty() {
            return Err(Error::ConnectionAddressRequired);
        }
        {
            let state = self.shared.state.read().await;
            state.ensure_open()?;
            if state.replicas.contains_key(&id) {
                return Err(Error::ReplicaExists);
            }
        }
        self.publish_command(
            MessageType::CREATE_REPLICA,
            &CreateReplicaCommand {
                id,
                url: url.to_string(),
            },
        )
        .await
    }

    /// Delete a replica by id.
    pub async fn delete_replica(&self, id: ReplicaId) -> Result<()> {
        {
            let state = self.shared.state.read().await;
            state.ensure_open()?;
            if !state.replicas.contains_key(&id) {
                return Err(Error::ReplicaNotFound);
            }
        }
        self.publish_command(MessageType::DELETE_REPLICA, &DeleteReplicaCommand { id })
            .await
    }

    /// Subscribe a replica to a topic, creating the topic if it does not
    /// yet exist.
    pub async fn subscribe(&self, replica_id: ReplicaId, topic_id: TopicId) -> Result<()> {
        {
            let state = self.shared.state.read().await;
            state.ensure_open()?;
            if !state.replicas.contains_key(&replica_id) {
                return Err(Error::ReplicaNotFound);
            }
        }
        self.publish_command(
            MessageType::SUBSCRIBE,
            &SubscribeCommand {
                replica_id,
                topic_id,
            },
        )
        .await
    }

    /// Remove a replica's subscription to a topic.
    pub async fn unsubscribe(&self, replica_id: ReplicaId, topic_id: TopicId) -> Result<()> {
        {
            let state = self.shared.state.read().await;
            state.ensure_open()?;
            if !state.replicas.contains_key(&replica_id) {
                return Err(Error::ReplicaNotFound);
            }
        }
        self.publish_command(
            MessageType::UNSUBSCRIBE,
            &UnsubscribeCommand {
                replica_id,
                topic_id,
            },
        )
        .await
    }

    async fn publish_command<T: Serialize>(&self, kind: MessageType, command: &T) -> Result<()> {
        let data = serde_json::to_vec(command)?;
        self.publish_sync(Message {
            kind,
            topic_id: TopicId::BROADCAST,
            index: 0,
            data: data.into(),
        })
        .await?;
        Ok(())
    }

    // ========================================================================
    // Heartbeats & truncation
    // ========================================================================

    /// Record a heartbeat from a replica.
    ///
    /// Heartbeats are transient and stored only on the leader; they feed
    /// segment truncation. Followers return [`Error::NotLeader`].
    pub async fn heartbeat(&self, id: ReplicaId, index: u64) -> Result<()> {
        if self.log.role() != NodeRole::Leader {
            return Err(Error::NotLeader);
        }
        let mut state = self.shared.state.write().await;
        state.ensure_open()?;
        let replica = state.replicas.get_mut(&id).ok_or(Error::ReplicaNotFound)?;
        replica.set_high_received_index(index);
        Ok(())
    }

    /// Remove segments that every subscribed replica has acknowledged.
    ///
    /// Topics without subscribers are skipped. Only meaningful on the
    /// leader, which holds fresh heartbeat indices; elsewhere the per-replica
    /// floors are zero and nothing is removed.
    pub async fn truncate(&self) -> Result<()> {
        let mut state = self.shared.state.write().await;
        state.ensure_open()?;
        state.truncate()
    }

    // ========================================================================
    // Subscriber attachment
    // ========================================================================

    /// Attach a byte sink to a replica: catch it up from segments (broadcast
    /// topic first), register it for live tail, then block until the sink is
    /// detached: by [`detach_replica`](Broker::detach_replica), a failed
    /// write, replica deletion, or broker close.
    pub async fn attach_replica(
        &self,
        id: ReplicaId,
        sink: Box<dyn ReplicaSink>,
    ) -> Result<()> {
        let done = {
            let mut state = self.shared.state.write().await;
            state.ensure_open()?;
            state.attach(id, sink).await?
        };
        // Block outside the lock for the lifetime of the sink.
        let _ = done.await;
        Ok(())
    }

    /// Detach a replica's sink, if any. Safe to call repeatedly.
    pub async fn detach_replica(&self, id: ReplicaId) -> Result<()> {
        let mut state = self.shared.state.write().await;
        state.ensure_open()?;
        let replica = state.replicas.get_mut(&id).ok_or(Error::ReplicaNotFound)?;
        replica.detach();
        Ok(())
    }

    // ========================================================================
    // Snapshot & restore
    // ========================================================================

    /// Stream the broker's logical state to `w`. Returns the index the
    /// snapshot covers.
    pub async fn snapshot(&self, w: &mut (dyn Write + Send)) -> Result<u64> {
        self.shared.write_snapshot(w).await
    }

    /// Replace the broker's state with a snapshot read from `r`.
    pub async fn restore(&self, r: &mut (dyn Read + Send)) -> Result<()> {
        self.shared.read_snapshot(r).await
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Highest index applied across all topics. 0 when closed or empty.
    pub async fn index(&self) -> u64 {
        self.shared.state.read().await.applied_index
    }

    /// Data directory the broker was opened with.
    pub async fn path(&self) -> Option<PathBuf> {
        self.shared.state.read().await.path.clone()
    }

    /// Connection URL the broker advertises.
    pub async fn url(&self) -> String {
        self.shared.state.read().await.url.clone()
    }

    /// True if this node currently leads the consensus group.
    pub fn is_leader(&self) -> bool {
        self.log.role() == NodeRole::Leader
    }

    /// Connection URL of the current leader, if known.
    pub fn leader_url(&self) -> Option<String> {
        self.log.leader().map(|(_, url)| url)
    }

    /// Ids of all topics, ascending.
    pub async fn topics(&self) -> Vec<TopicId> {
        self.shared.state.read().await.topics.keys().copied().collect()
    }

    /// All replicas, ascending by id.
    pub async fn replicas(&self) -> Vec<ReplicaInfo> {
        let state = self.shared.state.read().await;
        state.replicas.values().map(Replica::info).collect()
    }

    /// A single replica's public state.
    pub async fn replica(&self, id: ReplicaId) -> Result<ReplicaInfo> {
        let state = self.shared.state.read().await;
        state
            .replicas
            .get(&id)
            .map(Replica::info)
            .ok_or(Error::ReplicaNotFound)
    }

    /// Highest index a replica has acknowledged via heartbeat.
    pub async fn replica_index(&self, id: ReplicaId) -> Result<u64> {
        let state = self.shared.state.read().await;
        state
            .replicas
            .get(&id)
            .map(Replica::high_received_index)
            .ok_or(Error::ReplicaNotFound)
    }
}

impl BrokerState {
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.path.is_none() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn topic_path(&self, id: TopicId) -> Result<PathBuf> {
        Ok(self
            .path
            .as_ref()
            .ok_or(Error::Closed)?
            .join(id.to_string()))
    }

    // ------------------------------------------------------------------------
    // Metadata persistence
    // ------------------------------------------------------------------------

    /// Read the persisted metadata header and rebuild topics and replicas.
    /// Missing metadata means a fresh broker.
    fn load(&mut self) -> Result<()> {
        let path = self.path.clone().ok_or(Error::Closed)?;
        fs::create_dir_all(&path)?;

        let data = match fs::read(path.join(META_FILE_NAME)) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let header: SnapshotHeader = serde_json::from_slice(&data)?;

        for snapshot_topic in &header.topics {
            let mut topic = Topic::new(
                snapshot_topic.id,
                path.join(snapshot_topic.id.to_string()),
                self.max_segment_size,
            );
            // Segment lists rebuild from the local files; the sizes in the
            // header are advisory here.
            topic.open()?;
            self.topics.insert(snapshot_topic.id, topic);
        }

        for snapshot_replica in &header.replicas {
            let mut replica = Replica::new(snapshot_replica.id, snapshot_replica.url.clone());
            for topic_id in &snapshot_replica.topic_ids {
                replica.subscribe(*topic_id);
                if let Some(topic) = self.topics.get_mut(topic_id) {
                    topic.subscribers.insert(snapshot_replica.id);
                }
            }
            self.replicas.insert(snapshot_replica.id, replica);
        }

        self.load_index()?;
        Ok(())
    }

    /// Recompute each topic's high index from disk and derive the broker's
    /// applied index from them.
    pub(crate) fn load_index(&mut self) -> Result<()> {
        self.applied_index = 0;
        for topic in self.topics.values_mut() {
            topic.load_index()?;
            if topic.high_index() > self.applied_index {
                self.applied_index = topic.high_index();
            }
        }
        Ok(())
    }

    /// Persist the metadata header. Written to a temp file and renamed into
    /// place so a crash mid-write cannot leave a torn header.
    fn save(&self) -> Result<()> {
        let path = self.path.as_ref().ok_or(Error::Closed)?;
        let header = self.snapshot_header()?;
        let data = serde_json::to_vec(&header)?;
        let tmp = path.join(format!("{META_FILE_NAME}.tmp"));
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, path.join(META_FILE_NAME))?;
        Ok(())
    }

    /// Persist metadata; a disk fault here is fatal (the applied command
    /// would otherwise be lost from the materialized view).
    fn must_save(&self) {
        match self.save() {
            Ok(()) | Err(Error::Closed) => {}
            Err(err) => panic!("save broker metadata: {err}"),
        }
    }

    /// Materialize the snapshot/metadata header, stat-ing each segment file
    /// for its current on-disk size.
    pub(crate) fn snapshot_header(&self) -> Result<SnapshotHeader> {
        let mut header = SnapshotHeader::default();

        for (id, topic) in &self.topics {
            let mut snapshot_topic = SnapshotTopic {
                id: *id,
                segments: Vec::new(),
            };
            for segment in topic.segments() {
                let size = match fs::metadata(&segment.path) {
                    Ok(meta) => meta.len(),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
                    Err(err) => return Err(err.into()),
                };
                if segment.start_index > header.index {
                    header.index = segment.start_index;
                }
                snapshot_topic.segments.push(SnapshotSegment {
                    index: segment.start_index,
                    size,
                    path: segment.path.clone(),
                });
            }
            header.topics.push(snapshot_topic);
        }

        for (id, replica) in &self.replicas {
            header.replicas.push(SnapshotReplica {
                id: *id,
                url: replica.url().to_string(),
                topic_ids: replica.topic_ids(),
            });
        }

        Ok(header)
    }

    // ------------------------------------------------------------------------
    // Topic management
    // ------------------------------------------------------------------------

    fn create_topic_if_absent(&mut self, id: TopicId) -> Result<()> {
        if self.topics.contains_key(&id) {
            return Ok(());
        }
        let path = self.topic_path(id)?;
        let mut topic = Topic::new(id, path, self.max_segment_size);
        topic.open()?;
        self.topics.insert(id, topic);
        self.save()?;
        info!(topic = %id, "topic created");
        Ok(())
    }

    fn must_create_topic(&mut self, id: TopicId) {
        if let Err(err) = self.create_topic_if_absent(id) {
            panic!("create topic {id}: {err}");
        }
    }

    // ------------------------------------------------------------------------
    // Apply-path mutations (invoked by the FSM, serialized by the log)
    // ------------------------------------------------------------------------

    /// Append an applied message to its topic, creating the topic lazily,
    /// and fan the frame out to subscribed replicas. A replica whose sink
    /// write fails is detached; that never fails the append.
    pub(crate) async fn append_message(&mut self, message: &Message) -> Result<()> {
        self.create_topic_if_absent(message.topic_id)?;

        let BrokerState {
            topics, replicas, ..
        } = &mut *self;
        let topic = topics
            .get_mut(&message.topic_id)
            .expect("topic exists after create");
        let frame = topic.append(message)?;

        for id in topic.subscribers.iter() {
            let Some(replica) = replicas.get_mut(id) else {
                continue;
            };
            if !replica.has_sink() {
                continue;
            }
            if let Err(err) = replica.write(&frame).await {
                debug!(replica = %id, %err, "live tail write failed; sink detached");
            }
        }
        Ok(())
    }

    pub(crate) fn apply_create_replica(&mut self, message: &Message) {
        let command: CreateReplicaCommand = serde_json::from_slice(&message.data)
            .expect("create-replica command: malformed payload");

        // The leader-side pre-check already reported ReplicaExists to the
        // client; at apply time a duplicate is a no-op.
        if self.replicas.contains_key(&command.id) {
            warn!(replica = %command.id, "replica already exists; ignoring create");
            return;
        }

        self.must_create_topic(TopicId::BROADCAST);
        let mut replica = Replica::new(command.id, command.url);
        replica.subscribe(TopicId::BROADCAST);
        self.topics
            .get_mut(&TopicId::BROADCAST)
            .expect("broadcast topic exists")
            .subscribers
            .insert(command.id);
        self.replicas.insert(command.id, replica);
        info!(replica = %command.id, "replica created");

        self.must_save();
    }

    pub(crate) fn apply_delete_replica(&mut self, message: &Message) {
        let command: DeleteReplicaCommand = serde_json::from_slice(&message.data)
            .expect("delete-replica command: malformed payload");

        let Some(mut replica) = self.replicas.remove(&command.id) else {
            return;
        };
        for topic_id in replica.topic_ids() {
            if let Some(topic) = self.topics.get_mut(&topic_id) {
                topic.subscribers.remove(&command.id);
            }
        }
        replica.clear_subscriptions();
        replica.detach();
        info!(replica = %command.id, "replica deleted");

        self.must_save();
    }

    pub(crate) async fn apply_subscribe(&mut self, message: &Message) {
        let command: SubscribeCommand =
            serde_json::from_slice(&message.data).expect("subscribe command: malformed payload");

        if !self.replicas.contains_key(&command.replica_id) {
            return;
        }
        self.must_create_topic(command.topic_id);

        let BrokerState {
            topics, replicas, ..
        } = &mut *self;
        let replica = replicas
            .get_mut(&command.replica_id)
            .expect("replica checked above");
        let topic = topics
            .get_mut(&command.topic_id)
            .expect("topic just created");

        if replica.is_subscribed(command.topic_id) {
            warn!(
                replica = %command.replica_id,
                topic = %command.topic_id,
                "already subscribed to topic"
            );
            return;
        }

        replica.subscribe(command.topic_id);
        topic.subscribers.insert(command.replica_id);

        // Catch the replica up immediately when a subscriber is connected.
        // A catch-up failure detaches the sink but does not fail the apply.
        if replica.has_sink() {
            if let Err(err) = topic.write_to(replica).await {
                warn!(
                    replica = %command.replica_id,
                    topic = %command.topic_id,
                    %err,
                    "catch-up on subscribe failed"
                );
                replica.detach();
            }
        }

        self.must_save();
    }

    pub(crate) fn apply_unsubscribe(&mut self, message: &Message) {
        let command: UnsubscribeCommand =
            serde_json::from_slice(&message.data).expect("unsubscribe command: malformed payload");

        if let Some(replica) = self.replicas.get_mut(&command.replica_id) {
            replica.unsubscribe(command.topic_id);
        }
        if let Some(topic) = self.topics.get_mut(&command.topic_id) {
            topic.subscribers.remove(&command.replica_id);
        }

        self.must_save();
    }

    // ------------------------------------------------------------------------
    // Attachment & truncation
    // ------------------------------------------------------------------------

    /// Install a sink on a replica, replay history for each subscribed
    /// topic in ascending id order (broadcast first), and register the
    /// replica for live tail. Returns the completion signal the caller
    /// awaits outside the lock.
    async fn attach(
        &mut self,
        id: ReplicaId,
        sink: Box<dyn ReplicaSink>,
    ) -> Result<oneshot::Receiver<()>> {
        let BrokerState {
            topics, replicas, ..
        } = &mut *self;
        let replica = replicas.get_mut(&id).ok_or(Error::ReplicaNotFound)?;
        let done = replica.attach_sink(sink);

        for topic_id in replica.topic_ids() {
            let topic = topics
                .get_mut(&topic_id)
                .expect("subscribed topic missing");
            if let Err(err) = topic.write_to(replica).await {
                replica.detach();
                return Err(err);
            }
            topic.subscribers.insert(id);
        }

        Ok(done)
    }

    /// Drop every segment (never the last) that all subscribed replicas
    /// have fully acknowledged.
    fn truncate(&mut self) -> Result<()> {
        let BrokerState {
            topics, replicas, ..
        } = &mut *self;

        for topic in topics.values_mut() {
            // Floor: the lowest acknowledged index among subscribers.
            let mut min_index: Option<u64> = None;
            for replica in replicas.values() {
                if !replica.is_subscribed(topic.id()) {
                    continue;
                }
                let index = replica.high_received_index();
                min_index = Some(min_index.map_or(index, |current| current.min(index)));
            }
            // No subscribers: nothing bounds the topic, skip it.
            let Some(min_index) = min_index else {
                continue;
            };
            topic.truncate(min_index)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    pub(crate) fn close(&mut self) {
        self.close_topics();
        self.close_replicas();
        self.path = None;
    }

    pub(crate) fn close_topics(&mut self) {
        for topic in self.topics.values_mut() {
            topic.close();
        }
        self.topics.clear();
    }

    pub(crate) fn close_replicas(&mut self) {
        for replica in self.replicas.values_mut() {
            replica.detach();
        }
        self.replicas.clear();
    }
}
