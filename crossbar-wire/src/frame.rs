//! Frame header codec.
//!
//! Every frame opens with a 4-byte big-endian header packing four bit
//! fields:
//!
//! ```text
//!   bits 31..29 (3): op code
//!   bit  28     (1): flag (pattern subscription / multicast)
//!   bits 27..20 (8): qid length in bytes
//!   bits 19..0 (20): message length in bytes
//! ```
//!
//! SUBSCRIBE and UNSUBSCRIBE frames must carry a zero message length;
//! that invariant is enforced by the receiving connection, not here.

use std::io;

use thiserror::Error;

use crossbar_core::qid::PatternError;

/// Header size on the wire.
pub const HEADER_LEN: usize = 4;

/// Widest representable qid: 8-bit length field.
pub const MAX_QID_LEN: usize = 0xFF;

/// Widest representable message: 20-bit length field.
pub const MAX_MESSAGE_LEN: usize = 0x000F_FFFF;

/// Protocol errors of the wire layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown op code {0}")]
    UnknownOp(u8),

    #[error("unexpected {0:?} frame")]
    UnexpectedOp(Op),

    #[error("{0:?} frame carries a payload")]
    PayloadOnControl(Op),

    #[error("handshake rejected: expected CONNECTED, received {0:?}")]
    Handshake(Op),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias for wire operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Frame op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Connect,
    Connected,
    Disconnect,
    Subscribe,
    Unsubscribe,
    Message,
    Send,
}

impl Op {
    const fn code(self) -> u32 {
        match self {
            Self::Connect => 0,
            Self::Connected => 1,
            Self::Disconnect => 2,
            Self::Subscribe => 3,
            Self::Unsubscribe => 4,
            Self::Message => 5,
            Self::Send => 6,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Connect),
            1 => Some(Self::Connected),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Subscribe),
            4 => Some(Self::Unsubscribe),
            5 => Some(Self::Message),
            6 => Some(Self::Send),
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub op: Op,
    /// SUBSCRIBE/UNSUBSCRIBE: the qid is a pattern. SEND: multicast.
    pub flag: bool,
    pub qid_len: usize,
    pub message_len: usize,
}

impl Header {
    /// Build a header. Field widths are encoder-side invariants.
    #[must_use]
    pub fn new(op: Op, flag: bool, qid_len: usize, message_len: usize) -> Self {
        assert!(qid_len <= MAX_QID_LEN, "qid too long for the wire");
        assert!(
            message_len <= MAX_MESSAGE_LEN,
            "message too large for the wire"
        );
        Self {
            op,
            flag,
            qid_len,
            message_len,
        }
    }

    /// A payload-less control header (CONNECT / CONNECTED / DISCONNECT).
    #[must_use]
    pub fn control(op: Op) -> Self {
        Self::new(op, false, 0, 0)
    }

    #[must_use]
    pub fn encode(self) -> [u8; HEADER_LEN] {
        let word = (self.op.code() << 29)
            | (u32::from(self.flag) << 28)
            | ((self.qid_len as u32) << 20)
            | self.message_len as u32;
        word.to_be_bytes()
    }

    pub fn decode(raw: [u8; HEADER_LEN]) -> Result<Self> {
        let word = u32::from_be_bytes(raw);
        let code = (word >> 29) as u8;
        let op = Op::from_code(code).ok_or(ProtocolError::UnknownOp(code))?;
        Ok(Self {
            op,
            flag: (word & 0x1000_0000) != 0,
            qid_len: ((word >> 20) & 0xFF) as usize,
            message_len: (word & 0x000F_FFFF) as usize,
        })
    }
}
