//! # Streambus
//! Replicated, append-only message broker backed by a consensus log.
//!
//! Clients publish messages addressed to *topics*; subscribers (*replicas*)
//! receive them in strictly ascending log order. The replicated log is both
//! the write-ahead log and the source of truth: every state-changing
//! operation (topic creation, replica lifecycle, subscription changes, and
//! user publishes) flows through consensus before being materialized into
//! per-topic on-disk segment files.
//!
//! # Goals
//! - Deterministic replay: the broker state machine applies committed log
//!   entries identically on every node, and supports snapshot/restore for
//!   log compaction.
//! - Simple storage: a topic is a sorted sequence of bounded append-only
//!   segment files, reclaimed once every subscriber has acknowledged them.
//! - Pluggable consensus: the crate consumes a [`log::ReplicatedLog`]
//!   trait; [`log::LocalLog`] is the bundled single-node implementation,
//!   and a raft-backed one can be swapped in without touching broker code.
//!
//! # Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use streambus::{Broker, LocalLog, Message, MessageType, ReplicaId, TopicId};
//!
//! #[tokio::main]
//! async fn main() -> streambus::Result<()> {
//!     let broker = Broker::new(Arc::new(LocalLog::new()));
//!     broker.open("/var/lib/streambus", "tcp://127.0.0.1:7070").await?;
//!     broker.initialize().await?;
//!
//!     // Register a subscriber and route topic 1 to it.
//!     broker.create_replica(ReplicaId::new(10), "tcp://10.0.0.2:7071").await?;
//!     broker.subscribe(ReplicaId::new(10), TopicId::new(1)).await?;
//!
//!     // Publish and wait for local apply.
//!     broker
//!         .publish_sync(Message {
//!             kind: MessageType::new(0x0001),
//!             topic_id: TopicId::new(1),
//!             index: 0, // assigned at apply time
//!             data: Bytes::from_static(b"hello"),
//!         })
//!         .await?;
//!
//!     broker.close().await
//! }
//! ```
//!
//! A subscriber connects by attaching a byte sink
//! ([`broker::ReplicaSink`]) to its replica: it is first caught up from the
//! on-disk segments (broadcast topic first), then registered for live tail;
//! the attach call blocks until the sink detaches.

#![forbid(unsafe_code)]

pub mod broker;
pub mod constants;
pub mod error;
pub mod log;
pub mod message;
pub mod telemetry;
pub mod types;

pub use broker::{Broker, BrokerConfig, ReplicaInfo, ReplicaSink};
pub use error::{Error, Result};
pub use log::{LocalLog, ReplicatedLog};
pub use message::{Message, MessageDecoder};
pub use types::{MessageType, ReplicaId, TopicId};

pub mod prelude {
    //! Convenience re-exports of the broker surface.
    pub use crate::broker::{Broker, BrokerConfig, ReplicaInfo, ReplicaSink};
    pub use crate::constants::{BROKER_MESSAGE_MASK, MAX_SEGMENT_SIZE, MESSAGE_HEADER_SIZE};
    pub use crate::error::{Error, Result};
    pub use crate::log::{EntryKind, LocalLog, LogEntry, NodeRole, ReplicatedLog, StateMachine};
    pub use crate::message::{Message, MessageDecoder};
    pub use crate::types::{MessageType, ReplicaId, TopicId};

    pub use bytes;
}
