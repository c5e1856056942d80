//! # Wire Format
//!
//! Seven message types, each led by a one-byte discriminant. Multi-byte
//! fields are little-endian.
//!
//! ```text
//!  HandshakeSyn     [1][seq:4]
//!  HandshakeSynAck  [2][seq:4][ack:4]
//!  HandshakeAck     [3][seq:4][ack:4]
//!  PayloadSyn       [4][seq:4][end:1][data:N]
//!  PayloadAck       [5][ack:4][window:2][end:1]
//!  KeepAliveSyn     [6]
//!  KeepAliveAck     [7]
//! ```
//!
//! Decoding is total: anything that does not parse yields `None` and the
//! caller drops the datagram.

use bytes::{Buf, BufMut, Bytes, BytesMut};

// ─── Sequence Arithmetic ────────────────────────────────────────────────────

/// Serial-number comparison (RFC 1982 style) on the wrapping 32-bit space.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in serial-number order.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

// ─── Message Type ───────────────────────────────────────────────────────────

/// Wire discriminant, the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    HandshakeSyn = 1,
    HandshakeSynAck = 2,
    HandshakeAck = 3,
    PayloadSyn = 4,
    PayloadAck = 5,
    KeepAliveSyn = 6,
    KeepAliveAck = 7,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(MessageType::HandshakeSyn),
            2 => Some(MessageType::HandshakeSynAck),
            3 => Some(MessageType::HandshakeAck),
            4 => Some(MessageType::PayloadSyn),
            5 => Some(MessageType::PayloadAck),
            6 => Some(MessageType::KeepAliveSyn),
            7 => Some(MessageType::KeepAliveAck),
            _ => None,
        }
    }
}

// ─── Segment ────────────────────────────────────────────────────────────────

/// A slice of application bytes tagged with its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub seq: u32,
    pub data: Bytes,
    /// Final segment of the stream.
    pub end: bool,
}

impl Segment {
    pub fn new(seq: u32, data: Bytes, end: bool) -> Self {
        Segment { seq, data, end }
    }
}

// ─── Message ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeSyn { seq: u32 },
    HandshakeSynAck { seq: u32, ack: u32 },
    HandshakeAck { seq: u32, ack: u32 },
    PayloadSyn(Segment),
    PayloadAck { ack: u32, window: u16, end: bool },
    KeepAliveSyn,
    KeepAliveAck,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::HandshakeSyn { .. } => MessageType::HandshakeSyn,
            Message::HandshakeSynAck { .. } => MessageType::HandshakeSynAck,
            Message::HandshakeAck { .. } => MessageType::HandshakeAck,
            Message::PayloadSyn(_) => MessageType::PayloadSyn,
            Message::PayloadAck { .. } => MessageType::PayloadAck,
            Message::KeepAliveSyn => MessageType::KeepAliveSyn,
            Message::KeepAliveAck => MessageType::KeepAliveAck,
        }
    }

    /// Number of bytes [`Message::encode`] will produce.
    pub fn encoded_len(&self) -> usize {
        match self {
            Message::HandshakeSyn { .. } => 5,
            Message::HandshakeSynAck { .. } | Message::HandshakeAck { .. } => 9,
            Message::PayloadSyn(segment) => 6 + segment.data.len(),
            Message::PayloadAck { .. } => 8,
            Message::KeepAliveSyn | Message::KeepAliveAck => 1,
        }
    }

    /// Serialize into a freshly allocated buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type() as u8);
        match self {
            Message::HandshakeSyn { seq } => buf.put_u32_le(*seq),
            Message::HandshakeSynAck { seq, ack } | Message::HandshakeAck { seq, ack } => {
                buf.put_u32_le(*seq);
                buf.put_u32_le(*ack);
            }
            Message::PayloadSyn(segment) => {
                buf.put_u32_le(segment.seq);
                buf.put_u8(segment.end as u8);
                buf.put_slice(&segment.data);
            }
            Message::PayloadAck { ack, window, end } => {
                buf.put_u32_le(*ack);
                buf.put_u16_le(*window);
                buf.put_u8(*end as u8);
            }
            Message::KeepAliveSyn | Message::KeepAliveAck => {}
        }
    }

    /// Decode one datagram. Returns `None` for anything malformed: unknown
    /// discriminant, short body, trailing bytes on a fixed-size message, or a
    /// flag byte other than 0/1.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let mut buf = datagram;
        if !buf.has_remaining() {
            return None;
        }
        let kind = MessageType::from_byte(buf.get_u8())?;

        let msg = match kind {
            MessageType::HandshakeSyn => {
                if buf.remaining() != 4 {
                    return None;
                }
                Message::HandshakeSyn {
                    seq: buf.get_u32_le(),
                }
            }
            MessageType::HandshakeSynAck | MessageType::HandshakeAck => {
                if buf.remaining() != 8 {
                    return None;
                }
                let seq = buf.get_u32_le();
                let ack = buf.get_u32_le();
                if kind == MessageType::HandshakeSynAck {
                    Message::HandshakeSynAck { seq, ack }
                } else {
                    Message::HandshakeAck { seq, ack }
                }
            }
            MessageType::PayloadSyn => {
                if buf.remaining() < 5 {
                    return None;
                }
                let seq = buf.get_u32_le();
                let end = decode_flag(buf.get_u8())?;
                let data = Bytes::copy_from_slice(buf);
                Message::PayloadSyn(Segment { seq, data, end })
            }
            MessageType::PayloadAck => {
                if buf.remaining() != 7 {
                    return None;
                }
                let ack = buf.get_u32_le();
                let window = buf.get_u16_le();
                let end = decode_flag(buf.get_u8())?;
                Message::PayloadAck { ack, window, end }
            }
            MessageType::KeepAliveSyn | MessageType::KeepAliveAck => {
                if buf.has_remaining() {
                    return None;
                }
                if kind == MessageType::KeepAliveSyn {
                    Message::KeepAliveSyn
                } else {
                    Message::KeepAliveAck
                }
            }
        };
        Some(msg)
    }
}

fn decode_flag(b: u8) -> Option<bool> {
    match b {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}
