//! Frame-level types: message ids, flags, versions, reset codes and the
//! frame head.
//!
//! Every frame on the wire starts with a head:
//!
//! ```text
//! +---------+-------+-------+---------+---------+
//! | len u32 | id u8 | flags | seq u32 | ack u32 |
//! +---------+-------+-------+---------+---------+
//!                            \___ only if Sequenced ___/
//! ```
//!
//! `len` counts the whole frame, head included. The last two fields are
//! present only when the `SEQUENCED` flag is set, so plain frames cost
//! six bytes of overhead and sequenced ones fourteen.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::messages::Msg;
use crate::ProtocolError;

// ---------------------------------------------------------------------------
// MsgId
// ---------------------------------------------------------------------------

/// Identifies a message type on the wire.
///
/// A newtype rather than an enum: the built-in ids are associated
/// constants, and applications may register their own ids with a
/// [`MsgCreator`](crate::MsgCreator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(pub u8);

impl MsgId {
    pub const HELLO: MsgId = MsgId(1);
    pub const KEY_EXCHANGE: MsgId = MsgId(2);
    pub const CHANGE_CIPHER_SPEC: MsgId = MsgId(3);
    pub const AUTH: MsgId = MsgId(4);
    pub const CONTINUE: MsgId = MsgId(5);
    pub const FINISHED: MsgId = MsgId(6);
    pub const RST: MsgId = MsgId(7);
    pub const HEARTBEAT: MsgId = MsgId(8);
    pub const SYNC_TIME: MsgId = MsgId(9);
    pub const PAYLOAD: MsgId = MsgId(10);

    /// Human-readable name for logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::HELLO => "Hello",
            Self::KEY_EXCHANGE => "KeyExchange",
            Self::CHANGE_CIPHER_SPEC => "ChangeCipherSpec",
            Self::AUTH => "Auth",
            Self::CONTINUE => "Continue",
            Self::FINISHED => "Finished",
            Self::RST => "Rst",
            Self::HEARTBEAT => "Heartbeat",
            Self::SYNC_TIME => "SyncTime",
            Self::PAYLOAD => "Payload",
            _ => "Custom",
        }
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// The flag byte of a frame head.
///
/// Bits 0..=3 are reserved for the codec and apply to every message.
/// Bits 4..=7 are a customization region whose meaning depends on the
/// message id, which is why e.g. [`Flags::HELLO_DONE`] and
/// [`Flags::PING`] share a bit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);

    // Codec-reserved bits.
    pub const ENCRYPTED: Flags = Flags(1 << 0);
    pub const MAC: Flags = Flags(1 << 1);
    pub const COMPRESSED: Flags = Flags(1 << 2);
    pub const SEQUENCED: Flags = Flags(1 << 3);
    /// Bits set by the encoder itself, never by callers.
    pub const CODEC: Flags = Flags(0b0111);

    // Hello (server reply).
    pub const HELLO_DONE: Flags = Flags(1 << 4);
    pub const ENCRYPTION: Flags = Flags(1 << 5);
    pub const AUTH: Flags = Flags(1 << 6);
    pub const CONTINUE: Flags = Flags(1 << 7);

    // Finished.
    pub const ENCRYPT_OK: Flags = Flags(1 << 4);
    pub const AUTH_OK: Flags = Flags(1 << 5);
    pub const CONTINUE_OK: Flags = Flags(1 << 6);

    // Heartbeat.
    pub const PING: Flags = Flags(1 << 4);
    pub const PONG: Flags = Flags(1 << 5);

    // SyncTime.
    pub const REQ_TIME: Flags = Flags(1 << 4);
    pub const RESP_TIME: Flags = Flags(1 << 5);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// `true` if every bit of `other` is set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Flags) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Flags) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn set(&mut self, other: Flags, on: bool) {
        *self = if on { self.with(other) } else { self.without(other) };
    }

    pub const fn is_sequenced(self) -> bool {
        self.contains(Self::SEQUENCED)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.with(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        *self = self.with(rhs);
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Flags({:#010b})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Protocol version carried in `Hello`: major in the high byte, minor
/// in the low byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u16);

impl Version {
    pub const V1_0: Version = Version(0x0100);
    pub const CURRENT: Version = Self::V1_0;
}

impl Default for Version {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0 >> 8, self.0 & 0xff)
    }
}

// ---------------------------------------------------------------------------
// Code
// ---------------------------------------------------------------------------

/// Reason code carried by an `Rst` message.
///
/// Values below [`Code::CUSTOMIZATION`] are reserved for the gateway;
/// applications pick theirs from the customization range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Code(pub i32);

impl Code {
    pub const REJECT: Code = Code(1);
    pub const SHUTDOWN: Code = Code(2);
    pub const SESSION_DEATH: Code = Code(3);
    pub const SESSION_NOT_FOUND: Code = Code(4);
    pub const SESSION_CLOSED: Code = Code(5);
    pub const VERSION_ERROR: Code = Code(6);
    pub const ENCRYPT_FAILED: Code = Code(7);
    pub const AUTH_FAILED: Code = Code(8);
    pub const CONTINUE_FAILED: Code = Code(9);
    pub const PROTOCOL_ERROR: Code = Code(10);

    /// First code available to applications.
    pub const CUSTOMIZATION: Code = Code(32);

    /// An application-defined code, offset into the customization range.
    pub const fn custom(offset: i32) -> Code {
        Code(Self::CUSTOMIZATION.0 + offset)
    }

    pub fn is_custom(self) -> bool {
        self.0 >= Self::CUSTOMIZATION.0
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::REJECT => "Reject",
            Self::SHUTDOWN => "Shutdown",
            Self::SESSION_DEATH => "SessionDeath",
            Self::SESSION_NOT_FOUND => "SessionNotFound",
            Self::SESSION_CLOSED => "SessionClosed",
            Self::VERSION_ERROR => "VersionError",
            Self::ENCRYPT_FAILED => "EncryptFailed",
            Self::AUTH_FAILED => "AuthFailed",
            Self::CONTINUE_FAILED => "ContinueFailed",
            Self::PROTOCOL_ERROR => "ProtocolError",
            _ => return write!(f, "Code({})", self.0),
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// MsgHead
// ---------------------------------------------------------------------------

/// Head size of a frame without sequence fields.
pub const HEAD_SIZE: usize = 6;

/// Head size of a frame with `seq` and `ack`.
pub const SEQUENCED_HEAD_SIZE: usize = HEAD_SIZE + 8;

/// The decoded head of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHead {
    /// Total frame length including the head.
    pub len: u32,
    pub msg_id: MsgId,
    pub flags: Flags,
    /// Sender's sequence number for this frame (sequenced frames only).
    pub seq: u32,
    /// Next sequence the sender expects from us (sequenced frames only).
    pub ack: u32,
}

impl MsgHead {
    pub fn new(msg_id: MsgId, flags: Flags) -> Self {
        Self {
            len: 0,
            msg_id,
            flags,
            seq: 0,
            ack: 0,
        }
    }

    /// Encoded size of this head.
    pub fn size(&self) -> usize {
        Self::size_for(self.flags)
    }

    pub fn size_for(flags: Flags) -> usize {
        if flags.is_sequenced() {
            SEQUENCED_HEAD_SIZE
        } else {
            HEAD_SIZE
        }
    }

    /// Appends the encoded head.
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.len);
        buf.put_u8(self.msg_id.0);
        buf.put_u8(self.flags.bits());
        if self.flags.is_sequenced() {
            buf.put_u32(self.seq);
            buf.put_u32(self.ack);
        }
    }

    /// Parses a head from the front of `data`.
    ///
    /// Returns `Ok(None)` while not enough bytes are buffered yet.
    pub fn peek(data: &[u8]) -> Result<Option<MsgHead>, ProtocolError> {
        if data.len() < HEAD_SIZE {
            return Ok(None);
        }
        let flags = Flags::from_bits(data[5]);
        let size = Self::size_for(flags);
        if data.len() < size {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        if (len as usize) < size {
            return Err(ProtocolError::MalformedHead("length shorter than head"));
        }
        let (seq, ack) = if flags.is_sequenced() {
            (
                u32::from_be_bytes([data[6], data[7], data[8], data[9]]),
                u32::from_be_bytes([data[10], data[11], data[12], data[13]]),
            )
        } else {
            (0, 0)
        };
        Ok(Some(MsgHead {
            len,
            msg_id: MsgId(data[4]),
            flags,
            seq,
            ack,
        }))
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A decoded frame: its head plus the concrete message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub head: MsgHead,
    pub msg: Msg,
}

impl Event {
    pub fn flags(&self) -> Flags {
        self.head.flags
    }
}

// =========================================================================
// Tests
// =========================================================================
