//! Wire protocol between sites.
//!
//! Every message travels as one frame over the persistent TCP stream of a
//! site pair:
//!
//! ```text
//! ┌──────────────┬──────────┬───────────────────────┐
//! │ len: u32 BE  │ kind: u8 │ body (len - 1 bytes)  │
//! └──────────────┴──────────┴───────────────────────┘
//! ```
//!
//! Integers are big-endian. Strings are a `u16` length followed by UTF-8.
//!
//! | Kind | Tag | Body |
//! |------|-----|------|
//! | Handshake | 1 | port u16, priority u32, host str |
//! | Heartbeat | 2 | term u64 |
//! | MasterQuery | 3 | (empty) |
//! | VoteRequest | 4 | term u64, priority u32 |
//! | VoteReply | 5 | term u64, priority u32 |
//! | NewMaster | 6 | term u64, priority u32 |
//! | Log | 7 | lsn u64, needs_ack u8, payload (rest) |
//! | Ack | 8 | lsn u64 |
//!
//! [`FrameCodec`] buffers partial frames across reads, so a reader never
//! waits on a half-received message while other streams have data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Bytes in the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Counted frame bytes of a `Log` message besides its payload: kind, lsn
/// and the ack flag.
pub const LOG_HEADER_LEN: usize = 1 + 8 + 1;

/// Largest log payload that fits in a frame of `max_frame_len`.
pub fn max_log_payload(max_frame_len: usize) -> usize {
    max_frame_len.saturating_sub(LOG_HEADER_LEN)
}

const KIND_HANDSHAKE: u8 = 1;
const KIND_HEARTBEAT: u8 = 2;
const KIND_MASTER_QUERY: u8 = 3;
const KIND_VOTE_REQUEST: u8 = 4;
const KIND_VOTE_REPLY: u8 = 5;
const KIND_NEW_MASTER: u8 = 6;
const KIND_LOG: u8 = 7;
const KIND_ACK: u8 = 8;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// First frame on every stream: the sender's listening address.
    Handshake { host: String, port: u16, priority: u32 },
    /// Master liveness.
    Heartbeat { term: u64 },
    /// "Who is master?" sent while seeking a master.
    MasterQuery,
    /// Election vote request carrying the candidate's standing.
    VoteRequest { term: u64, priority: u32 },
    /// Reply to a vote request carrying the voter's standing.
    VoteReply { term: u64, priority: u32 },
    /// Master announcement.
    NewMaster { term: u64, priority: u32 },
    /// Log record from the master.
    Log { lsn: u64, needs_ack: bool, payload: Bytes },
    /// Acknowledgement of a log record.
    Ack { lsn: u64 },
}

/// Message kind, used for dispatch labels and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Handshake,
    Heartbeat,
    MasterQuery,
    VoteRequest,
    VoteReply,
    NewMaster,
    Log,
    Ack,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Handshake => "handshake",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::MasterQuery => "master_query",
            MessageKind::VoteRequest => "vote_request",
            MessageKind::VoteReply => "vote_reply",
            MessageKind::NewMaster => "new_master",
            MessageKind::Log => "log",
            MessageKind::Ack => "ack",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Handshake { .. } => MessageKind::Handshake,
            Message::Heartbeat { .. } => MessageKind::Heartbeat,
            Message::MasterQuery => MessageKind::MasterQuery,
            Message::VoteRequest { .. } => MessageKind::VoteRequest,
            Message::VoteReply { .. } => MessageKind::VoteReply,
            Message::NewMaster { .. } => MessageKind::NewMaster,
            Message::Log { .. } => MessageKind::Log,
            Message::Ack { .. } => MessageKind::Ack,
        }
    }

    /// Encode as one complete frame (length prefix included).
    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LEN_PREFIX + 1 + self.body_len());
        write_frame(self, &mut buf);
        buf.freeze()
    }

    fn body_len(&self) -> usize {
        match self {
            Message::Handshake { host, .. } => 2 + 4 + 2 + host.len(),
            Message::Heartbeat { .. } | Message::Ack { .. } => 8,
            Message::MasterQuery => 0,
            Message::VoteRequest { .. } | Message::VoteReply { .. } | Message::NewMaster { .. } => {
                8 + 4
            }
            Message::Log { payload, .. } => 8 + 1 + payload.len(),
        }
    }
}

/// Frame decoding failure. Any of these ends the stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("Unknown message kind {0}")]
    UnknownKind(u8),

    #[error("Truncated {0} frame")]
    Truncated(&'static str),

    #[error("Host name is not valid UTF-8")]
    BadHost,

    #[error("Host name too long ({0} bytes)")]
    HostTooLong(usize),

    #[error("Empty frame")]
    Empty,

    /// End of stream (the peer closed the connection).
    #[error("Connection closed")]
    Closed,
}

/// Length-prefixed codec for [`Message`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 {
            return Err(FrameError::Empty);
        }
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let frame = src.split_to(len).freeze();
        decode_body(frame).map(Some)
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), FrameError> {
        if let Message::Handshake { host, .. } = &msg {
            if host.len() > u16::MAX as usize {
                return Err(FrameError::HostTooLong(host.len()));
            }
        }
        let len = 1 + msg.body_len();
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        dst.reserve(LEN_PREFIX + len);
        write_frame(&msg, dst);
        Ok(())
    }
}

fn write_frame(msg: &Message, dst: &mut BytesMut) {
    dst.put_u32((1 + msg.body_len()) as u32);
    match msg {
        Message::Handshake { host, port, priority } => {
            dst.put_u8(KIND_HANDSHAKE);
            dst.put_u16(*port);
            dst.put_u32(*priority);
            let host = &host.as_bytes()[..host.len().min(u16::MAX as usize)];
            dst.put_u16(host.len() as u16);
            dst.put_slice(host);
        }
        Message::Heartbeat { term } => {
            dst.put_u8(KIND_HEARTBEAT);
            dst.put_u64(*term);
        }
        Message::MasterQuery => dst.put_u8(KIND_MASTER_QUERY),
        Message::VoteRequest { term, priority } => {
            dst.put_u8(KIND_VOTE_REQUEST);
            dst.put_u64(*term);
            dst.put_u32(*priority);
        }
        Message::VoteReply { term, priority } => {
            dst.put_u8(KIND_VOTE_REPLY);
            dst.put_u64(*term);
            dst.put_u32(*priority);
        }
        Message::NewMaster { term, priority } => {
            dst.put_u8(KIND_NEW_MASTER);
            dst.put_u64(*term);
            dst.put_u32(*priority);
        }
        Message::Log { lsn, needs_ack, payload } => {
            dst.put_u8(KIND_LOG);
            dst.put_u64(*lsn);
            dst.put_u8(u8::from(*needs_ack));
            dst.put_slice(payload);
        }
        Message::Ack { lsn } => {
            dst.put_u8(KIND_ACK);
            dst.put_u64(*lsn);
        }
    }
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> Result<(), FrameError> {
    if buf.remaining() < n {
        Err(FrameError::Truncated(what))
    } else {
        Ok(())
    }
}

fn decode_term_priority(mut body: Bytes, what: &'static str) -> Result<(u64, u32), FrameError> {
    need(&body, 12, what)?;
    Ok((body.get_u64(), body.get_u32()))
}

fn decode_body(mut frame: Bytes) -> Result<Message, FrameError> {
    let kind = frame.get_u8();
    match kind {
        KIND_HANDSHAKE => {
            need(&frame, 8, "handshake")?;
            let port = frame.get_u16();
            let priority = frame.get_u32();
            let host_len = frame.get_u16() as usize;
            need(&frame, host_len, "handshake")?;
            let host = String::from_utf8(frame.split_to(host_len).to_vec())
                .map_err(|_| FrameError::BadHost)?;
            Ok(Message::Handshake { host, port, priority })
        }
        KIND_HEARTBEAT => {
            need(&frame, 8, "heartbeat")?;
            Ok(Message::Heartbeat { term: frame.get_u64() })
        }
        KIND_MASTER_QUERY => Ok(Message::MasterQuery),
        KIND_VOTE_REQUEST => {
            let (term, priority) = decode_term_priority(frame, "vote_request")?;
            Ok(Message::VoteRequest { term, priority })
        }
        KIND_VOTE_REPLY => {
            let (term, priority) = decode_term_priority(frame, "vote_reply")?;
            Ok(Message::VoteReply { term, priority })
        }
        KIND_NEW_MASTER => {
            let (term, priority) = decode_term_priority(frame, "new_master")?;
            Ok(Message::NewMaster { term, priority })
        }
        KIND_LOG => {
            need(&frame, 9, "log")?;
            let lsn = frame.get_u64();
            let needs_ack = frame.get_u8() != 0;
            Ok(Message::Log {
                lsn,
                needs_ack,
                payload: frame,
            })
        }
        KIND_ACK => {
            need(&frame, 8, "ack")?;
            Ok(Message::Ack { lsn: frame.get_u64() })
        }
        other => Err(FrameError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut FrameCodec, buf: &mut BytesMut) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_handshake_roundtrip() {
        let msg = Message::Handshake {
            host: "db-1.internal".to_string(),
            port: 5000,
            priority: 100,
        };
        let mut buf = BytesMut::from(&msg.to_frame()[..]);
        let decoded = FrameCodec::default().decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_log_payload_preserved() {
        let msg = Message::Log {
            lsn: 77,
            needs_ack: true,
            payload: Bytes::from_static(b"\x00\x01txn-record"),
        };
        let mut buf = BytesMut::new();
        FrameCodec::default().encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(&buf[..], &msg.to_frame()[..]);

        let decoded = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = Message::VoteRequest { term: 3, priority: 10 }.to_frame();
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[2..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&frame[7..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::VoteRequest { term: 3, priority: 10 })
        );
    }

    #[test]
    fn test_several_frames_in_one_read() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Message::MasterQuery.to_frame());
        buf.extend_from_slice(&Message::Ack { lsn: 9 }.to_frame());
        buf.extend_from_slice(&Message::Heartbeat { term: 2 }.to_frame());

        let msgs = decode_all(&mut FrameCodec::default(), &mut buf);
        assert_eq!(
            msgs,
            vec![
                Message::MasterQuery,
                Message::Ack { lsn: 9 },
                Message::Heartbeat { term: 2 }
            ]
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_u8(KIND_LOG);

        let err = FrameCodec::new(64).decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 1024, max: 64 }));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(200);
        assert!(matches!(
            FrameCodec::default().decode(&mut buf),
            Err(FrameError::UnknownKind(200))
        ));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(KIND_ACK);
        buf.put_u16(0);
        assert!(matches!(
            FrameCodec::default().decode(&mut buf),
            Err(FrameError::Truncated("ack"))
        ));
    }

    #[test]
    fn test_empty_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(matches!(FrameCodec::default().decode(&mut buf), Err(FrameError::Empty)));
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(Message::MasterQuery.kind().as_str(), "master_query");
        assert_eq!(MessageKind::Ack.to_string(), "ack");
    }

    #[test]
    fn test_largest_log_payload_fits_frame() {
        let max_frame_len = 256;
        let payload = Bytes::from(vec![7u8; max_log_payload(max_frame_len)]);
        let msg = Message::Log {
            lsn: 9,
            needs_ack: true,
            payload,
        };
        let frame = msg.to_frame();
        assert_eq!(frame.len(), LEN_PREFIX + max_frame_len);

        let mut codec = FrameCodec::new(max_frame_len);
        let mut buf = BytesMut::from(&frame[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));

        assert_eq!(max_log_payload(4), 0);
    }
}
