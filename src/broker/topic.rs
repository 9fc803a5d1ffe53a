//! Topics and their on-disk segments.
//!
//! A topic is an ordered sequence of segments. Each segment is a single
//! append-only file named after the log index of the first message it
//! contains (decimal), holding a plain concatenation of encoded messages.
//! Only the last segment ever has an open write handle.
//!
//! Appends come exclusively from the FSM apply path, which is serialized by
//! the consensus layer, so a topic never sees concurrent writers. Catch-up
//! reads may run on the same node while appends continue; they tolerate a
//! segment file vanishing underneath them (truncation) and rely on the
//! subsequent live-tail registration to cover the gap.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::PathBuf;

use bytes::Bytes;
use tracing::{debug, warn};

use super::replica::Replica;
use crate::error::{Error, Result};
use crate::message::{Message, MessageDecoder};
use crate::types::{ReplicaId, TopicId};

/// A contiguous, bounded chunk of a topic's log, stored as one file.
pub(crate) struct Segment {
    /// Lowest message index in this segment; also the file name.
    pub(crate) start_index: u64,
    /// On-disk path.
    pub(crate) path: PathBuf,
    /// Bytes written, tracked in memory.
    pub(crate) size: u64,
    /// Write handle; only the topic's last segment holds one.
    file: Option<File>,
}

impl Segment {
    fn new(path: PathBuf, start_index: u64) -> Self {
        Segment {
            start_index,
            path,
            size: 0,
            file: None,
        }
    }

    /// Open the file handle for append: create-if-absent, read/write,
    /// append mode.
    fn open(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    /// Drop the write handle.
    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

/// An ordered sequence of segments plus the set of tailing subscribers.
pub(crate) struct Topic {
    id: TopicId,
    path: PathBuf,
    /// Highest index written to this topic.
    high_index: u64,
    max_segment_size: u64,
    segments: Vec<Segment>,
    /// Replicas subscribed to this topic, fan-out targets for live tail.
    pub(crate) subscribers: BTreeSet<ReplicaId>,
}

impl Topic {
    pub(crate) fn new(id: TopicId, path: PathBuf, max_segment_size: u64) -> Self {
        Topic {
            id,
            path,
            high_index: 0,
            max_segment_size,
            segments: Vec::new(),
            subscribers: BTreeSet::new(),
        }
    }

    pub(crate) fn id(&self) -> TopicId {
        self.id
    }

    pub(crate) fn high_index(&self) -> u64 {
        self.high_index
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Path of the segment file starting at `index`.
    fn segment_path(&self, index: u64) -> PathBuf {
        self.path.join(index.to_string())
    }

    /// Create the topic directory and enumerate existing segments.
    ///
    /// Numeric filenames become segments sorted by start index; anything
    /// else is ignored. A topic always has at least one segment once
    /// opened: an in-memory placeholder starting at 0 when the directory
    /// is empty.
    pub(crate) fn open(&mut self) -> Result<()> {
        assert!(
            self.segments.is_empty(),
            "topic already open: {}",
            self.id
        );

        fs::create_dir_all(&self.path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o700))?;
        }

        self.load_segments()?;
        Ok(())
    }

    fn load_segments(&mut self) -> Result<()> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(start_index) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
                continue;
            };
            let size = entry.metadata()?.len();
            segments.push(Segment {
                start_index,
                path: self.segment_path(start_index),
                size,
                file: None,
            });
        }
        segments.sort_by_key(|s| s.start_index);

        if segments.is_empty() {
            segments.push(Segment::new(self.segment_path(0), 0));
        }
        self.segments = segments;
        Ok(())
    }

    /// Read the last segment forward to find the highest written index.
    pub(crate) fn load_index(&mut self) -> Result<()> {
        let last = self.segments.last().expect("open topic has a segment");
        let file = match File::open(&last.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut decoder = MessageDecoder::new(BufReader::new(file));
        while let Some(m) = decoder.decode()? {
            self.high_index = m.index;
        }
        Ok(())
    }

    /// Append a message, rolling the active segment over when it has grown
    /// past the size limit. Returns the encoded frame so the caller can fan
    /// it out to attached replicas.
    ///
    /// The index ordering precondition is an invariant of log-driven apply;
    /// violating it means the node's state diverged from the log, which is
    /// unrecoverable.
    pub(crate) fn append(&mut self, m: &Message) -> Result<Bytes> {
        assert!(
            m.index > self.high_index,
            "topic {} message out of order: {} -> {}",
            self.id,
            self.high_index,
            m.index
        );

        // Close the active segment once it has grown past the limit. The
        // closed segment is left in place; it is never reopened for writes.
        if let Some(last) = self.segments.last_mut() {
            if last.size > self.max_segment_size {
                last.close();
            }
        }

        // Without an open write handle the message starts a fresh segment
        // named after its own index. This covers rollover, the untouched
        // placeholder of a new topic, and the first append after a reopen.
        if self.segments.last().map_or(true, |s| !s.is_open()) {
            let mut segment = Segment::new(self.segment_path(m.index), m.index);
            segment.open()?;
            debug!(topic = %self.id, start_index = m.index, "segment started");
            self.segments.push(segment);
        }

        let frame = m.encode();
        let active = self.segments.last_mut().expect("topic has a segment");
        let file = active.file.as_mut().expect("active segment open");
        file.write_all(&frame)?;
        active.size += frame.len() as u64;
        self.high_index = m.index;

        Ok(frame)
    }

    /// Catch a replica up from the segments: stream every message with an
    /// index above the replica's high-water mark to its sink, in order.
    ///
    /// Segments fully acknowledged by the replica are skipped without being
    /// opened. A missing segment file means truncation won the race and is
    /// treated as empty. Decode errors surface to the caller and abort the
    /// catch-up.
    pub(crate) async fn write_to(&self, replica: &mut Replica) -> Result<()> {
        let high = replica.high_received_index();

        for (i, segment) in self.segments.iter().enumerate() {
            if let Some(next) = self.segments.get(i + 1) {
                if high >= next.start_index {
                    continue;
                }
            }
            self.write_segment_to(replica, high, segment).await?;
        }
        Ok(())
    }

    async fn write_segment_to(
        &self,
        replica: &mut Replica,
        high: u64,
        segment: &Segment,
    ) -> Result<()> {
        let file = match File::open(&segment.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mut decoder = MessageDecoder::new(BufReader::new(file));
        loop {
            let m = match decoder.decode() {
                Ok(Some(m)) => m,
                Ok(None) => return Ok(()),
                Err(err) => {
                    return Err(Error::Corrupt(format!(
                        "topic {} segment {}: {err}",
                        self.id, segment.start_index
                    )));
                }
            };
            if m.index <= high {
                continue;
            }
            replica.write(&m.encode()).await?;
        }
    }

    /// Drop every non-last segment whose successor starts at or below
    /// `min_index`, i.e. whose entire contents every subscriber has
    /// acknowledged. Returns the number of segments removed.
    pub(crate) fn truncate(&mut self, min_index: u64) -> Result<usize> {
        let mut removed = 0;
        while self.segments.len() > 1 && self.segments[1].start_index <= min_index {
            let mut segment = self.segments.remove(0);
            segment.close();
            match fs::remove_file(&segment.path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        topic = %self.id,
                        segment = segment.start_index,
                        %err,
                        "failed to remove segment"
                    );
                    return Err(err.into());
                }
            }
            removed += 1;
        }
        if removed > 0 {
            debug!(topic = %self.id, removed, min_index, "segments truncated");
        }
        Ok(removed)
    }

    /// Drop all write handles.
    pub(crate) fn close(&mut self) {
        for segment in &mut self.segments {
            segment.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;
    use tempfile::TempDir;

    fn message(topic: u64, index: u64, data: &str) -> Message {
        Message {
            kind: MessageType::new(0x0001),
            topic_id: TopicId::new(topic),
            index,
            data: Bytes::copy_from_slice(data.as_bytes()),
        }
    }

    fn open_topic(dir: &TempDir, id: u64, max_segment_size: u64) -> Topic {
        let mut topic = Topic::new(
            TopicId::new(id),
            dir.path().join(id.to_string()),
            max_segment_size,
        );
        topic.open().unwrap();
        topic
    }

    #[test]
    fn test_open_creates_placeholder_segment() {
        let dir = TempDir::new().unwrap();
        let topic = open_topic(&dir, 1, 1024);
        assert_eq!(topic.segments().len(), 1);
        assert_eq!(topic.segments()[0].start_index, 0);
        assert_eq!(topic.segments()[0].size, 0);
        assert_eq!(topic.high_index(), 0);
    }

    #[test]
    fn test_first_append_names_segment_after_message_index() {
        let dir = TempDir::new().unwrap();
        let mut topic = open_topic(&dir, 1, 1024);
        topic.append(&message(1, 5, "hello")).unwrap();

        // The untouched placeholder stays in the list; the first written
        // segment is named after the first message it contains.
        assert!(dir.path().join("1").join("5").exists());
        assert!(!dir.path().join("1").join("0").exists());
        assert_eq!(topic.high_index(), 5);

        // Subsequent appends land in the same segment.
        topic.append(&message(1, 6, "world")).unwrap();
        assert_eq!(topic.segments().last().unwrap().start_index, 5);
    }

    #[test]
    fn test_append_enforces_ordering() {
        let dir = TempDir::new().unwrap();
        let mut topic = open_topic(&dir, 1, 1024);
        topic.append(&message(1, 5, "a")).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = topic.append(&message(1, 5, "b"));
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_rollover_starts_segment_at_message_index() {
        let dir = TempDir::new().unwrap();
        // 100-byte limit; 16-byte payloads encode to 38 bytes each.
        let mut topic = open_topic(&dir, 5, 100);
        for i in 1..=20u64 {
            topic.append(&message(5, i, "0123456789abcdef")).unwrap();
        }

        assert!(topic.segments().len() >= 3, "expected rollovers");
        for pair in topic.segments().windows(2) {
            assert!(pair[0].start_index < pair[1].start_index);
        }

        // Each written segment is named after the index of the first
        // message it contains, and decoding the concatenation yields the
        // 20 messages in order.
        let mut indices = Vec::new();
        for segment in topic.segments() {
            let file = match File::open(&segment.path) {
                Ok(file) => file,
                // The start-0 placeholder was never written.
                Err(_) => continue,
            };
            let mut decoder = MessageDecoder::new(BufReader::new(file));
            let mut first_in_segment = None;
            while let Some(m) = decoder.decode().unwrap() {
                first_in_segment.get_or_insert(m.index);
                indices.push(m.index);
            }
            assert_eq!(first_in_segment, Some(segment.start_index));
        }
        assert_eq!(indices, (1..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_reopen_and_load_index() {
        let dir = TempDir::new().unwrap();
        {
            let mut topic = open_topic(&dir, 3, 1024);
            for i in [2u64, 4, 9] {
                topic.append(&message(3, i, "payload")).unwrap();
            }
        }

        let mut topic = Topic::new(TopicId::new(3), dir.path().join("3"), 1024);
        topic.open().unwrap();
        topic.load_index().unwrap();
        assert_eq!(topic.high_index(), 9);

        // The first append after a reopen starts a fresh segment at the
        // recovered position.
        topic.append(&message(3, 10, "next")).unwrap();
        assert_eq!(topic.high_index(), 10);
        assert_eq!(topic.segments().last().unwrap().start_index, 10);
        assert!(dir.path().join("3").join("10").exists());
    }

    #[test]
    fn test_load_segments_ignores_non_numeric_files() {
        let dir = TempDir::new().unwrap();
        let topic_dir = dir.path().join("2");
        fs::create_dir_all(&topic_dir).unwrap();
        fs::write(topic_dir.join("garbage.tmp"), b"junk").unwrap();
        fs::write(topic_dir.join("7"), b"").unwrap();

        let mut topic = Topic::new(TopicId::new(2), topic_dir, 1024);
        topic.open().unwrap();
        assert_eq!(topic.segments().len(), 1);
        assert_eq!(topic.segments()[0].start_index, 7);
    }

    #[test]
    fn test_truncate_floor() {
        let dir = TempDir::new().unwrap();
        // Tiny limit so every append rolls over into its own segment.
        let mut topic = open_topic(&dir, 3, 1);
        for i in 1..=3u64 {
            topic.append(&message(3, i * 100, "x")).unwrap();
        }
        // Placeholder 0 plus one segment per append.
        let starts: Vec<u64> = topic.segments().iter().map(|s| s.start_index).collect();
        assert_eq!(starts, vec![0, 100, 200, 300]);

        // min acknowledged index 150: only segments whose successor starts
        // at or below 150 go: here only the placeholder (next starts at 100).
        let removed = topic.truncate(150).unwrap();
        assert_eq!(removed, 1);
        let starts: Vec<u64> = topic.segments().iter().map(|s| s.start_index).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        // min 210 additionally drops segments 100 and keeps 200 (its
        // successor 300 is above the floor) and the last segment.
        let removed = topic.truncate(210).unwrap();
        assert_eq!(removed, 1);
        let starts: Vec<u64> = topic.segments().iter().map(|s| s.start_index).collect();
        assert_eq!(starts, vec![200, 300]);
        assert!(!dir.path().join("3").join("100").exists());
        assert!(dir.path().join("3").join("200").exists());
    }

    #[test]
    fn test_truncate_never_removes_last_segment() {
        let dir = TempDir::new().unwrap();
        let mut topic = open_topic(&dir, 3, 1024);
        topic.append(&message(3, 1, "x")).unwrap();

        let removed = topic.truncate(u64::MAX).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(topic.segments().len(), 1);
    }
}
