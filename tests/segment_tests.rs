//! Segment rollover and truncation, driven through the broker API.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use streambus::{
    Broker, BrokerConfig, LocalLog, Message, MessageDecoder, MessageType, ReplicaId, TopicId,
};

async fn open_small_segment_broker(dir: &TempDir, max_segment_size: u64) -> Broker {
    let broker = Broker::with_config(
        Arc::new(LocalLog::new()),
        BrokerConfig { max_segment_size },
    );
    broker
        .open(dir.path(), "tcp://127.0.0.1:7070")
        .await
        .expect("open broker");
    broker.initialize().await.expect("initialize");
    broker
}

fn user_message(topic: u64, data: &[u8]) -> Message {
    Message {
        kind: MessageType::new(0x0001),
        topic_id: TopicId::new(topic),
        index: 0,
        data: Bytes::copy_from_slice(data),
    }
}

/// Numeric segment file names under a topic directory, ascending.
fn segment_names(dir: &Path, topic: u64) -> Vec<u64> {
    let mut names: Vec<u64> = std::fs::read_dir(dir.join(topic.to_string()))
        .expect("topic directory")
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .collect();
    names.sort_unstable();
    names
}

#[tokio::test]
async fn test_segment_rollover_under_small_limit() {
    let dir = TempDir::new().unwrap();
    let broker = open_small_segment_broker(&dir, 100).await;

    // 20 publishes of 16-byte payloads; each encodes to 38 bytes, so the
    // 100-byte limit forces multiple rollovers.
    let mut published = Vec::new();
    for _ in 0..20 {
        published.push(
            broker
                .publish_sync(user_message(5, b"0123456789abcdef"))
                .await
                .unwrap(),
        );
    }

    let names = segment_names(dir.path(), 5);
    assert!(names.len() >= 2, "expected at least two segments: {names:?}");

    // Each segment file is named after the index of the first message it
    // contains, and decoding the concatenation yields the 20 publishes in
    // order.
    let mut indices = Vec::new();
    for name in &names {
        let file = File::open(dir.path().join("5").join(name.to_string())).unwrap();
        let mut decoder = MessageDecoder::new(BufReader::new(file));
        let mut first = None;
        while let Some(m) = decoder.decode().unwrap() {
            first.get_or_insert(m.index);
            indices.push(m.index);
        }
        assert_eq!(first, Some(*name), "segment {name} misnamed");
    }
    assert_eq!(indices, published);

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_truncate_respects_slowest_subscriber() {
    let dir = TempDir::new().unwrap();
    // One message per segment.
    let broker = open_small_segment_broker(&dir, 1).await;

    broker
        .create_replica(ReplicaId::new(1), "tcp://a")
        .await
        .unwrap();
    broker
        .create_replica(ReplicaId::new(2), "tcp://b")
        .await
        .unwrap();
    broker
        .subscribe(ReplicaId::new(1), TopicId::new(3))
        .await
        .unwrap();
    broker
        .subscribe(ReplicaId::new(2), TopicId::new(3))
        .await
        .unwrap();

    let mut published = Vec::new();
    for i in 0..4 {
        published.push(
            broker
                .publish_sync(user_message(3, format!("m{i}").as_bytes()))
                .await
                .unwrap(),
        );
    }
    let before = segment_names(dir.path(), 3);
    assert_eq!(before.len(), 4);

    // Replica 1 acknowledged through the second message, replica 2 through
    // the fourth. The floor is replica 1's index.
    broker
        .heartbeat(ReplicaId::new(1), published[1])
        .await
        .unwrap();
    broker
        .heartbeat(ReplicaId::new(2), published[3])
        .await
        .unwrap();

    broker.truncate().await.unwrap();

    let after = segment_names(dir.path(), 3);
    // Segments whose successor starts at or below the floor are gone; the
    // segment containing the floor message and everything after survive.
    assert!(after.contains(&published[3]), "last segment kept");
    assert!(
        after.contains(&published[1]),
        "segment at the floor kept: {after:?}"
    );
    assert!(
        !after.contains(&published[0]),
        "fully acknowledged segment removed: {after:?}"
    );

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_truncate_skips_topics_without_subscribers() {
    let dir = TempDir::new().unwrap();
    let broker = open_small_segment_broker(&dir, 1).await;

    for i in 0..3 {
        broker
            .publish_sync(user_message(8, format!("m{i}").as_bytes()))
            .await
            .unwrap();
    }
    let before = segment_names(dir.path(), 8);

    // No replica subscribes to topic 8; truncation must not touch it.
    broker.truncate().await.unwrap();
    assert_eq!(segment_names(dir.path(), 8), before);

    broker.close().await.unwrap();
}

#[tokio::test]
async fn test_truncate_without_heartbeats_keeps_everything() {
    let dir = TempDir::new().unwrap();
    let broker = open_small_segment_broker(&dir, 1).await;

    broker
        .create_replica(ReplicaId::new(1), "tcp://a")
        .await
        .unwrap();
    broker
        .subscribe(ReplicaId::new(1), TopicId::new(2))
        .await
        .unwrap();
    for i in 0..3 {
        broker
            .publish_sync(user_message(2, format!("m{i}").as_bytes()))
            .await
            .unwrap();
    }
    let before = segment_names(dir.path(), 2);

    // A subscriber that has never heartbeated pins the floor at zero.
    broker.truncate().await.unwrap();
    assert_eq!(segment_names(dir.path(), 2), before);

    broker.close().await.unwrap();
}
