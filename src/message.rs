//! Message framing: fixed-header binary codec and stream decoder.
//!
//! Every message is encoded as a fixed 22-byte big-endian header followed by
//! the raw payload:
//!
//! ```text
//! type:u16 | topicID:u64 | index:u64 | dataLen:u32 | data[dataLen]
//! ```
//!
//! There is no framing beyond the length prefix. A segment file is a plain
//! concatenation of encoded messages, which means [`MessageDecoder`] can be
//! restarted from the start of any segment.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MESSAGE_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::types::{MessageType, TopicId};

/// A single item in a topic.
///
/// `index` equals the consensus log index at which the message was applied;
/// it is assigned by the broker FSM and is strictly increasing within a
/// topic and across the whole broker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Message type tag. The high bit marks broker-internal commands.
    pub kind: MessageType,
    /// Topic the message is addressed to.
    pub topic_id: TopicId,
    /// Log index assigned at apply time.
    pub index: u64,
    /// Opaque payload.
    pub data: Bytes,
}

impl Message {
    /// Total encoded size of this message, header included.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.data.len()
    }

    /// Encode the message into a contiguous frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode the message header and payload into `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.kind.value());
        buf.put_u64(self.topic_id.value());
        buf.put_u64(self.index);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
    }

    /// Decode a message from a contiguous frame.
    ///
    /// The frame must contain exactly one header and at least `dataLen`
    /// payload bytes; trailing bytes are rejected as corruption so that a
    /// mis-framed command payload cannot be silently half-read.
    pub fn from_frame(frame: &[u8]) -> Result<Message> {
        if frame.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::Corrupt(format!(
                "frame too short: {} of {} header bytes",
                frame.len(),
                MESSAGE_HEADER_SIZE
            )));
        }
        let mut header = &frame[..MESSAGE_HEADER_SIZE];
        let kind = MessageType::new(header.get_u16());
        let topic_id = TopicId::new(header.get_u64());
        let index = header.get_u64();
        let data_len = header.get_u32() as usize;

        let body = &frame[MESSAGE_HEADER_SIZE..];
        if body.len() != data_len {
            return Err(Error::Corrupt(format!(
                "frame payload length mismatch: header says {data_len}, got {}",
                body.len()
            )));
        }

        Ok(Message {
            kind,
            topic_id,
            index,
            data: Bytes::copy_from_slice(body),
        })
    }
}

/// Decodes messages from a byte stream.
///
/// Designed for reading segment files: a clean end of stream at a message
/// boundary yields `Ok(None)`, while a short read inside a header or payload
/// is surfaced as [`Error::Corrupt`].
pub struct MessageDecoder<R> {
    reader: R,
}

impl<R: Read> MessageDecoder<R> {
    /// Create a decoder over `reader`.
    pub fn new(reader: R) -> Self {
        MessageDecoder { reader }
    }

    /// Decode the next message.
    ///
    /// Returns `Ok(None)` at a clean end of stream.
    pub fn decode(&mut self) -> Result<Option<Message>> {
        let header = match self.read_header()? {
            Some(header) => header,
            None => return Ok(None),
        };

        let mut buf = &header[..];
        let kind = MessageType::new(buf.get_u16());
        let topic_id = TopicId::new(buf.get_u64());
        let index = buf.get_u64();
        let data_len = buf.get_u32() as usize;

        let mut data = vec![0u8; data_len];
        if let Err(err) = self.reader.read_exact(&mut data) {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return Err(Error::Corrupt(format!(
                    "short payload for message index {index}: expected {data_len} bytes"
                )));
            }
            return Err(err.into());
        }

        Ok(Some(Message {
            kind,
            topic_id,
            index,
            data: Bytes::from(data),
        }))
    }

    /// Read a full header, distinguishing a clean EOF (nothing read) from a
    /// truncated header (partial read).
    fn read_header(&mut self) -> Result<Option<[u8; MESSAGE_HEADER_SIZE]>> {
        let mut header = [0u8; MESSAGE_HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            match self.reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::Corrupt(format!(
                        "short header: {filled} of {MESSAGE_HEADER_SIZE} bytes"
                    )));
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Some(header))
    }

    /// Consume the decoder, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message {
            kind: MessageType::new(0x0001),
            topic_id: TopicId::new(42),
            index: 1000,
            data: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(sample().encoded_len(), MESSAGE_HEADER_SIZE + 5);
    }

    #[test]
    fn test_encode_layout() {
        let frame = sample().encode();
        assert_eq!(frame.len(), 27);
        // type
        assert_eq!(&frame[0..2], &[0x00, 0x01]);
        // topic id
        assert_eq!(&frame[2..10], &42u64.to_be_bytes());
        // index
        assert_eq!(&frame[10..18], &1000u64.to_be_bytes());
        // payload length
        assert_eq!(&frame[18..22], &5u32.to_be_bytes());
        assert_eq!(&frame[22..], b"hello");
    }

    #[test]
    fn test_frame_round_trip() {
        let m = sample();
        let decoded = Message::from_frame(&m.encode()).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_frame_round_trip_empty_payload() {
        let m = Message {
            kind: MessageType::INTERNAL,
            topic_id: TopicId::BROADCAST,
            index: 7,
            data: Bytes::new(),
        };
        let decoded = Message::from_frame(&m.encode()).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn test_from_frame_short_header() {
        let err = Message::from_frame(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_from_frame_length_mismatch() {
        let mut frame = BytesMut::new();
        sample().encode_into(&mut frame);
        frame.put_u8(0xFF); // trailing garbage
        let err = Message::from_frame(&frame).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_decoder_stream() {
        let mut stream = BytesMut::new();
        for i in 1..=3u64 {
            Message {
                kind: MessageType::new(0x0002),
                topic_id: TopicId::new(9),
                index: i,
                data: Bytes::from(format!("payload-{i}")),
            }
            .encode_into(&mut stream);
        }

        let mut dec = MessageDecoder::new(&stream[..]);
        for i in 1..=3u64 {
            let m = dec.decode().unwrap().expect("message");
            assert_eq!(m.index, i);
            assert_eq!(m.data, format!("payload-{i}"));
        }
        assert!(dec.decode().unwrap().is_none());
        // Repeated decode at EOF stays at EOF.
        assert!(dec.decode().unwrap().is_none());
    }

    #[test]
    fn test_decoder_empty_stream_is_eof() {
        let mut dec = MessageDecoder::new(&[][..]);
        assert!(dec.decode().unwrap().is_none());
    }

    #[test]
    fn test_decoder_truncated_header() {
        let frame = sample().encode();
        let mut dec = MessageDecoder::new(&frame[..MESSAGE_HEADER_SIZE - 4]);
        let err = dec.decode().unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_decoder_truncated_payload() {
        let frame = sample().encode();
        let mut dec = MessageDecoder::new(&frame[..frame.len() - 2]);
        let err = dec.decode().unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
