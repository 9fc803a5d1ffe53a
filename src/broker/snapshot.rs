//! Snapshot wire format: JSON header plus raw segment bodies.
//!
//! A snapshot brings a new or far-behind node up without replaying the full
//! log. The stream is:
//!
//! 1. `u32` big-endian length of the JSON header.
//! 2. The JSON header: covered index, topics with their segments (start
//!    index and size), replicas with their subscriptions.
//! 3. The raw contents of every segment file, concatenated in header order,
//!    each exactly `size` bytes.
//!
//! The JSON/raw split is deliberate: the header is small and
//! schema-evolving, the bodies are bulk bytes streamed for throughput. The
//! same header doubles as the broker's `meta` file (without the bodies).

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::replica::Replica;
use super::topic::Topic;
use super::BrokerShared;
use crate::error::{Error, Result};
use crate::types::{ReplicaId, TopicId};

/// Header of a snapshot stream and of the persisted `meta` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Replicas and their subscriptions.
    pub replicas: Vec<SnapshotReplica>,
    /// Topics and their segment layout.
    pub topics: Vec<SnapshotTopic>,
    /// Highest segment start index across all topics.
    pub index: u64,
}

/// A replica entry in the snapshot header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReplica {
    pub id: ReplicaId,
    #[serde(rename = "topicIDs")]
    pub topic_ids: Vec<TopicId>,
    pub url: String,
}

/// A topic entry in the snapshot header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotTopic {
    pub id: TopicId,
    pub segments: Vec<SnapshotSegment>,
}

/// A segment entry in the snapshot header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSegment {
    /// Segment start index (also its file name).
    pub index: u64,
    /// Body size in bytes as recorded when the header was built.
    pub size: u64,
    /// Local path the body streams from; never serialized.
    #[serde(skip)]
    pub(crate) path: PathBuf,
}

impl BrokerShared {
    /// Stream the broker's state to `w`.
    ///
    /// The header is materialized under the read lock (stat-ing each
    /// segment for its current size); the lock is released before the
    /// bodies stream. Returns the index the snapshot covers: the maximum
    /// segment start index across all topics.
    pub(crate) async fn write_snapshot(&self, w: &mut (dyn Write + Send)) -> Result<u64> {
        let header = {
            let state = self.state.read().await;
            state.ensure_open()?;
            state.snapshot_header()?
        };

        let body = serde_json::to_vec(&header)?;
        w.write_all(&(body.len() as u32).to_be_bytes())?;
        w.write_all(&body)?;

        for topic in &header.topics {
            for segment in &topic.segments {
                copy_file_n(w, &segment.path, segment.size)?;
            }
        }

        Ok(header.index)
    }

    /// Replace the broker's state with the snapshot read from `r`.
    ///
    /// Under the write lock: every open topic and replica is closed, the
    /// segment files are rewritten from the stream, topics are reopened to
    /// rebuild their in-memory segment lists, replicas and subscriptions
    /// are recreated, and the applied index is recomputed from the reopened
    /// topics. Heartbeat state is not part of a snapshot; every restored
    /// replica starts with a high-water index of 0.
    pub(crate) async fn read_snapshot(&self, r: &mut (dyn Read + Send)) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_open()?;

        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf)?;
        let mut body = vec![0u8; u32::from_be_bytes(len_buf) as usize];
        r.read_exact(&mut body)?;
        let header: SnapshotHeader = serde_json::from_slice(&body)?;

        state.close_topics();
        state.close_replicas();

        for snapshot_topic in &header.topics {
            let topic_path = state.topic_path(snapshot_topic.id)?;
            match fs::remove_dir_all(&topic_path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            fs::create_dir_all(&topic_path)?;

            for segment in &snapshot_topic.segments {
                let mut file = File::create(topic_path.join(segment.index.to_string()))?;
                let copied = io::copy(&mut (&mut *r).take(segment.size), &mut file)?;
                if copied != segment.size {
                    return Err(Error::Corrupt(format!(
                        "short snapshot stream for segment {}/{}: {copied} of {} bytes",
                        snapshot_topic.id, segment.index, segment.size
                    )));
                }
            }

            let mut topic = Topic::new(snapshot_topic.id, topic_path, state.max_segment_size);
            topic.open()?;
            state.topics.insert(snapshot_topic.id, topic);
        }

        for snapshot_replica in &header.replicas {
            let mut replica =
                Replica::new(snapshot_replica.id, snapshot_replica.url.clone());
            for topic_id in &snapshot_replica.topic_ids {
                replica.subscribe(*topic_id);
                if let Some(topic) = state.topics.get_mut(topic_id) {
                    topic.subscribers.insert(snapshot_replica.id);
                }
            }
            state.replicas.insert(snapshot_replica.id, replica);
        }

        state.load_index()?;
        info!(
            index = state.applied_index,
            topics = state.topics.len(),
            replicas = state.replicas.len(),
            "broker state restored from snapshot"
        );
        Ok(())
    }
}

/// Copy exactly `n` bytes of `path` into `w`.
///
/// A zero-size entry (a never-written placeholder segment) produces no
/// bytes and opens no file. A file that shrank below `n` since the header
/// was built is corruption from the receiver's point of view.
fn copy_file_n(w: &mut (dyn Write + Send), path: &Path, n: u64) -> Result<u64> {
    if n == 0 {
        return Ok(0);
    }
    let file = File::open(path)?;
    let copied = io::copy(&mut file.take(n), w)?;
    if copied != n {
        return Err(Error::Corrupt(format!(
            "segment {} shrank during snapshot: {copied} of {n} bytes",
            path.display()
        )));
    }
    Ok(copied)
}
