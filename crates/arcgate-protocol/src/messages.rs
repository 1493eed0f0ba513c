//! The message catalogue.
//!
//! Each message is a plain struct implementing [`WireMsg`]; the closed
//! [`Msg`] enum wraps all of them so frames can be passed around without
//! trait objects. Converting back to a concrete type goes through
//! `TryFrom<Msg>`, which hands the original `Msg` back on a mismatch:
//!
//! ```
//! use arcgate_protocol::{Heartbeat, Msg, Payload};
//!
//! let msg = Msg::from(Heartbeat);
//! let not_payload = Payload::try_from(msg).unwrap_err();
//! assert!(matches!(not_payload, Msg::Heartbeat(_)));
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::compression::Compression;
use crate::crypto::exchange::{NamedCurve, SignatureAlgorithm};
use crate::crypto::suite::CipherSuite;
use crate::types::{Code, MsgId, Version};
use crate::wire::{put_bytes, put_string, WireReader, LEN_PREFIX};
use crate::ProtocolError;

/// A message with a fixed id and a binary body.
pub trait WireMsg: Sized {
    const ID: MsgId;

    /// Encoded body size.
    fn size(&self) -> usize;

    /// Appends the encoded body.
    fn write(&self, buf: &mut BytesMut);

    /// Decodes a body. The caller checks for trailing bytes.
    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError>;
}

// ---------------------------------------------------------------------------
// Handshake messages
// ---------------------------------------------------------------------------

/// Opens a handshake (client) or answers it (server).
///
/// An empty `session_id` from the client asks for a new session; a
/// non-empty one asks to continue that session on this connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hello {
    pub version: Version,
    pub session_id: String,
    pub random: Bytes,
    pub cipher_suite: CipherSuite,
    pub compression: Compression,
}

impl WireMsg for Hello {
    const ID: MsgId = MsgId::HELLO;

    fn size(&self) -> usize {
        2 + LEN_PREFIX + self.session_id.len() + LEN_PREFIX + self.random.len()
            + CipherSuite::SIZE
            + 1
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u16(self.version.0);
        put_string(buf, &self.session_id);
        put_bytes(buf, &self.random);
        self.cipher_suite.write(buf);
        buf.put_u8(self.compression.into());
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: Version(reader.u16()?),
            session_id: reader.string()?,
            random: reader.bytes()?,
            cipher_suite: CipherSuite::read(reader)?,
            compression: reader.tag()?,
        })
    }
}

/// ECDHE parameters. The server sends its message first and chooses the
/// curve, IV and nonce material; the client answers with its public key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EcdheKeyExchange {
    pub named_curve: NamedCurve,
    pub public_key: Bytes,
    pub iv: Bytes,
    pub nonce: Bytes,
    pub nonce_step: Bytes,
    pub signature_algorithm: SignatureAlgorithm,
    pub signature: Bytes,
}

impl WireMsg for EcdheKeyExchange {
    const ID: MsgId = MsgId::KEY_EXCHANGE;

    fn size(&self) -> usize {
        2 + 5 * LEN_PREFIX
            + self.public_key.len()
            + self.iv.len()
            + self.nonce.len()
            + self.nonce_step.len()
            + self.signature.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.named_curve.into());
        put_bytes(buf, &self.public_key);
        put_bytes(buf, &self.iv);
        put_bytes(buf, &self.nonce);
        put_bytes(buf, &self.nonce_step);
        buf.put_u8(self.signature_algorithm.into());
        put_bytes(buf, &self.signature);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            named_curve: reader.tag()?,
            public_key: reader.bytes()?,
            iv: reader.bytes()?,
            nonce: reader.bytes()?,
            nonce_step: reader.bytes()?,
            signature_algorithm: reader.tag()?,
            signature: reader.bytes()?,
        })
    }
}

/// Proves the sender's cipher works: the sender's own `Hello` body,
/// encrypted with its freshly installed write key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeCipherSpec {
    pub encrypted_hello: Bytes,
}

impl WireMsg for ChangeCipherSpec {
    const ID: MsgId = MsgId::CHANGE_CIPHER_SPEC;

    fn size(&self) -> usize {
        LEN_PREFIX + self.encrypted_hello.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_bytes(buf, &self.encrypted_hello);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            encrypted_hello: reader.bytes()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Auth {
    pub token: String,
    pub extensions: Bytes,
}

impl WireMsg for Auth {
    const ID: MsgId = MsgId::AUTH;

    fn size(&self) -> usize {
        2 * LEN_PREFIX + self.token.len() + self.extensions.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        put_string(buf, &self.token);
        put_bytes(buf, &self.extensions);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            token: reader.string()?,
            extensions: reader.bytes()?,
        })
    }
}

/// Client's sequence state when resuming a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Continue {
    pub send_seq: u32,
    pub recv_seq: u32,
}

impl WireMsg for Continue {
    const ID: MsgId = MsgId::CONTINUE;

    fn size(&self) -> usize {
        8
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.send_seq);
        buf.put_u32(self.recv_seq);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            send_seq: reader.u32()?,
            recv_seq: reader.u32()?,
        })
    }
}

/// Server's sequence state when the handshake completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Finished {
    pub send_seq: u32,
    pub recv_seq: u32,
}

impl WireMsg for Finished {
    const ID: MsgId = MsgId::FINISHED;

    fn size(&self) -> usize {
        8
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_u32(self.send_seq);
        buf.put_u32(self.recv_seq);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            send_seq: reader.u32()?,
            recv_seq: reader.u32()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Control and transport messages
// ---------------------------------------------------------------------------

/// Terminates the handshake or session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rst {
    pub code: Code,
    pub message: String,
}

impl WireMsg for Rst {
    const ID: MsgId = MsgId::RST;

    fn size(&self) -> usize {
        4 + LEN_PREFIX + self.message.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i32(self.code.0);
        put_string(buf, &self.message);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            code: Code(reader.i32()?),
            message: reader.string()?,
        })
    }
}

/// Liveness probe; `PING`/`PONG` flags say which way it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat;

impl WireMsg for Heartbeat {
    const ID: MsgId = MsgId::HEARTBEAT;

    fn size(&self) -> usize {
        0
    }

    fn write(&self, _buf: &mut BytesMut) {}

    fn read(_reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self)
    }
}

/// Clock synchronization round trip, in milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncTime {
    /// Correlates a response with its request.
    pub corr_id: i64,
    /// The requester's clock when the request left.
    pub local_time: i64,
    /// The responder's clock (zero in requests).
    pub remote_time: i64,
}

impl WireMsg for SyncTime {
    const ID: MsgId = MsgId::SYNC_TIME;

    fn size(&self) -> usize {
        24
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_i64(self.corr_id);
        buf.put_i64(self.local_time);
        buf.put_i64(self.remote_time);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            corr_id: reader.i64()?,
            local_time: reader.i64()?,
            remote_time: reader.i64()?,
        })
    }
}

/// Application data. The body is the data itself, without a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub data: Bytes,
}

impl WireMsg for Payload {
    const ID: MsgId = MsgId::PAYLOAD;

    fn size(&self) -> usize {
        self.data.len()
    }

    fn write(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.data);
    }

    fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self { data: reader.rest() })
    }
}

// ---------------------------------------------------------------------------
// Msg
// ---------------------------------------------------------------------------

/// Decodes a body into `T` and wraps it.
pub(crate) fn create<T>(reader: &mut WireReader<'_>) -> Result<Msg, ProtocolError>
where
    T: WireMsg + Into<Msg>,
{
    T::read(reader).map(Into::into)
}

macro_rules! catalogue {
    ($($variant:ident($ty:ident)),+ $(,)?) => {
        /// Any message of the built-in catalogue.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Msg {
            $($variant($ty),)+
        }

        impl Msg {
            pub fn id(&self) -> MsgId {
                match self {
                    $(Self::$variant(_) => <$ty as WireMsg>::ID,)+
                }
            }

            pub fn size(&self) -> usize {
                match self {
                    $(Self::$variant(m) => m.size(),)+
                }
            }

            pub fn write(&self, buf: &mut BytesMut) {
                match self {
                    $(Self::$variant(m) => m.write(buf),)+
                }
            }
        }

        $(
            impl From<$ty> for Msg {
                fn from(msg: $ty) -> Self {
                    Self::$variant(msg)
                }
            }

            impl TryFrom<Msg> for $ty {
                type Error = Msg;

                fn try_from(msg: Msg) -> Result<Self, Msg> {
                    match msg {
                        Msg::$variant(inner) => Ok(inner),
                        other => Err(other),
                    }
                }
            }
        )+

        pub(crate) fn builtin_factories() -> Vec<(MsgId, crate::registry::MsgFactory)> {
            vec![
                $((<$ty as WireMsg>::ID, create::<$ty> as crate::registry::MsgFactory),)+
            ]
        }
    };
}

catalogue! {
    Hello(Hello),
    KeyExchange(EcdheKeyExchange),
    ChangeCipherSpec(ChangeCipherSpec),
    Auth(Auth),
    Continue(Continue),
    Finished(Finished),
    Rst(Rst),
    Heartbeat(Heartbeat),
    SyncTime(SyncTime),
    Payload(Payload),
}

impl Msg {
    /// Encodes just the body, e.g. to sign or encrypt a whole message.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.write(&mut buf);
        buf.freeze()
    }
}
