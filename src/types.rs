//! Type-safe wrappers for broker primitives.
//!
//! These newtypes prevent mixing up the different 64-bit identifiers that
//! flow through the broker (topic ids, replica ids) and give the 16-bit
//! message type tag a home for its reserved values.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::BROKER_MESSAGE_MASK;

/// Identifier of a topic.
///
/// Topic id `0` is reserved as the *broadcast* topic: every replica is
/// automatically subscribed to it, and consensus-internal entries are
/// materialized there as no-ops so that all replicas advance their view of
/// the log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TopicId(pub u64);

impl TopicId {
    /// The broadcast topic every replica is subscribed to.
    pub const BROADCAST: Self = TopicId(0);

    /// Create a new topic id from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        TopicId(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Check whether this is the broadcast topic.
    #[inline]
    pub const fn is_broadcast(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for TopicId {
    fn from(value: u64) -> Self {
        TopicId(value)
    }
}

impl From<TopicId> for u64 {
    fn from(id: TopicId) -> Self {
        id.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a replica (a subscriber endpoint known to the broker).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Create a new replica id from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        ReplicaId(value)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for ReplicaId {
    fn from(value: u64) -> Self {
        ReplicaId(value)
    }
}

impl From<ReplicaId> for u64 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The 16-bit message type tag.
///
/// The high bit (`0x8000`) is reserved for broker-internal commands; user
/// message types occupy the lower 15 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MessageType(pub u16);

impl MessageType {
    /// Consensus-internal entry broadcast as a no-op.
    pub const INTERNAL: Self = MessageType(BROKER_MESSAGE_MASK);

    /// Create a replica and auto-subscribe it to the broadcast topic.
    pub const CREATE_REPLICA: Self = MessageType(BROKER_MESSAGE_MASK | 0x10);

    /// Remove a replica and all of its subscriptions.
    pub const DELETE_REPLICA: Self = MessageType(BROKER_MESSAGE_MASK | 0x11);

    /// Subscribe a replica to a topic.
    pub const SUBSCRIBE: Self = MessageType(BROKER_MESSAGE_MASK | 0x20);

    /// Remove a replica's subscription to a topic.
    pub const UNSUBSCRIBE: Self = MessageType(BROKER_MESSAGE_MASK | 0x21);

    /// Create a new message type from a raw value.
    #[inline]
    pub const fn new(value: u16) -> Self {
        MessageType(value)
    }

    /// Get the raw u16 value.
    #[inline]
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Check whether the type is a broker-internal command.
    #[inline]
    pub const fn is_broker_command(self) -> bool {
        self.0 & BROKER_MESSAGE_MASK != 0
    }
}

impl From<u16> for MessageType {
    fn from(value: u16) -> Self {
        MessageType(value)
    }
}

impl From<MessageType> for u16 {
    fn from(kind: MessageType) -> Self {
        kind.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
