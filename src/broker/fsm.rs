//! The broker's state machine, driven by the replicated log.
//!
//! The FSM closes over the broker's shared state, so the callbacks and the
//! public API see the same maps behind the same lock. It translates
//! committed log entries into topic appends:
//!
//! - Internal consensus entries become broadcast no-ops, advancing every
//!   replica's view of the log.
//! - Command entries decode into messages; broker commands (replica
//!   lifecycle, subscriptions) mutate membership first, and every message,
//!   command or user payload alike, is then appended to its addressed topic.
//!
//! Application is deterministic: no wall clock, no filesystem enumeration
//! order, no ambient state. Replaying the same entries on a fresh broker
//! produces the same topic contents and replica set.

use std::io::{Read, Write};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use super::BrokerShared;
use crate::error::Result;
use crate::log::{EntryKind, LogEntry, StateMachine};
use crate::message::Message;
use crate::types::{MessageType, TopicId};

/// State machine registered with the replicated log at broker open.
pub(crate) struct BrokerFsm {
    shared: Arc<BrokerShared>,
}

impl BrokerFsm {
    pub(crate) fn new(shared: Arc<BrokerShared>) -> Self {
        BrokerFsm { shared }
    }
}

#[async_trait]
impl StateMachine for BrokerFsm {
    /// Apply one committed entry.
    ///
    /// Non-repeatable faults (a malformed committed payload, or a disk
    /// error while appending or saving metadata) abort the process: the
    /// log is the source of truth and local state has diverged from it.
    async fn apply(&self, entry: &LogEntry) {
        let mut state = self.shared.state.write().await;

        let message = match entry.kind {
            // Internal consensus entries are broadcast out as no-ops to
            // move the index forward on every replica.
            EntryKind::Internal => Message {
                kind: MessageType::INTERNAL,
                topic_id: TopicId::BROADCAST,
                index: entry.index,
                data: Bytes::new(),
            },
            EntryKind::Command => {
                let mut message = Message::from_frame(&entry.data)
                    .unwrap_or_else(|err| panic!("committed entry {}: {err}", entry.index));
                // The message index is the log index it committed at.
                message.index = entry.index;

                match message.kind {
                    MessageType::CREATE_REPLICA => state.apply_create_replica(&message),
                    MessageType::DELETE_REPLICA => state.apply_delete_replica(&message),
                    MessageType::SUBSCRIBE => state.apply_subscribe(&message).await,
                    MessageType::UNSUBSCRIBE => state.apply_unsubscribe(&message),
                    _ => {}
                }
                message
            }
        };

        state.append_message(&message).await.unwrap_or_else(|err| {
            panic!(
                "append entry {} to topic {}: {err}",
                entry.index, message.topic_id
            )
        });
        state.applied_index = entry.index;
        trace!(index = entry.index, topic = %message.topic_id, "entry applied");
    }

    async fn snapshot(&self, w: &mut (dyn Write + Send)) -> Result<u64> {
        self.shared.write_snapshot(w).await
    }

    async fn restore(&self, r: &mut (dyn Read + Send)) -> Result<()> {
        self.shared.read_snapshot(r).await
    }
}
