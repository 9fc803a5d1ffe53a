//! Broker command payloads.
//!
//! Commands are the JSON-encoded bodies of broker-internal messages (the
//! ones whose type tag has the high bit set). They flow through the
//! replicated log like any other publish and are applied deterministically
//! by the FSM on every node.

use serde::{Deserialize, Serialize};

use crate::types::{ReplicaId, TopicId};

/// Create a replica. The replica is auto-subscribed to the broadcast topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateReplicaCommand {
    pub id: ReplicaId,
    pub url: String,
}

/// Remove a replica and all of its subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReplicaCommand {
    pub id: ReplicaId,
}

/// Subscribe a replica to a topic, creating the topic if needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeCommand {
    #[serde(rename = "replicaID")]
    pub replica_id: ReplicaId,
    #[serde(rename = "topicID")]
    pub topic_id: TopicId,
}

/// Remove a replica's subscription to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeCommand {
    #[serde(rename = "replicaID")]
    pub replica_id: ReplicaId,
    #[serde(rename = "topicID")]
    pub topic_id: TopicId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_replica_json_shape() {
        let cmd = CreateReplicaCommand {
            id: ReplicaId::new(10),
            url: "tcp://a".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"id":10,"url":"tcp://a"}"#);
        let back: CreateReplicaCommand = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_subscribe_json_field_names() {
        let cmd = SubscribeCommand {
            replica_id: ReplicaId::new(10),
            topic_id: TopicId::new(1),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"replicaID":10,"topicID":1}"#);
    }

    #[test]
    fn test_unsubscribe_round_trip() {
        let cmd = UnsubscribeCommand {
            replica_id: ReplicaId::new(7),
            topic_id: TopicId::new(3),
        };
        let back: UnsubscribeCommand =
            serde_json::from_slice(&serde_json::to_vec(&cmd).unwrap()).unwrap();
        assert_eq!(back, cmd);
    }
}
