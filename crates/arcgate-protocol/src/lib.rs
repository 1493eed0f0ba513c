//! Wire protocol for Arcgate.
//!
//! This crate defines everything that touches bytes on the wire:
//!
//! - **Frames** ([`MsgHead`], [`Flags`], [`MsgId`]): the binary head in
//!   front of every message.
//! - **Messages** ([`Msg`] and the structs it wraps): the handshake,
//!   control and payload messages, plus the [`MsgCreator`] registry the
//!   decoder uses to build them.
//! - **Codec** ([`Encoder`], [`Decoder`]): framing with optional
//!   compression, MAC and encryption.
//! - **Crypto** ([`CipherSuite`], [`EncryptionModule`], [`MacModule`],
//!   [`CompressionModule`], [`EphemeralKey`]): the pluggable modules and
//!   the key agreement that produces them.
//!
//! # Architecture
//!
//! The protocol layer knows nothing about connections or sessions. The
//! transport crate drives an encoder/decoder pair over a connection;
//! the handshake installs crypto modules into them.
//!
//! ```text
//! Transport (bytes) -> Protocol (Event) -> Session (dispatch)
//! ```

#[macro_use]
mod macros;

mod codec;
mod crypto;
mod error;
mod messages;
mod registry;
mod types;
mod wire;

pub use codec::{
    Decoder, Encoder, PlainFrame, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_PACKET_SIZE,
};
pub use crypto::cipher::{Direction, EncryptionModule};
pub use crypto::compression::{Compression, CompressionModule, DEFAULT_MAX_UNCOMPRESSED};
pub use crypto::exchange::{
    derive_session_keys, sign, verify, verifying_key, EphemeralKey, NamedCurve, SessionKeys,
    SignatureAlgorithm, SESSION_KEY_SIZE,
};
pub use crypto::mac::{MacHash, MacModule};
pub use crypto::nonce::{NonceCounter, NonceSupply};
pub use crypto::padding::PaddingMode;
pub use crypto::suite::{BlockCipherMode, CipherSuite, SecretKeyExchange, SymmetricEncryption};
pub use error::ProtocolError;
pub use messages::{
    Auth, ChangeCipherSpec, Continue, EcdheKeyExchange, Finished, Heartbeat, Hello, Msg,
    Payload, Rst, SyncTime, WireMsg,
};
pub use registry::{MsgCreator, MsgFactory};
pub use types::{
    Code, Event, Flags, MsgHead, MsgId, Version, HEAD_SIZE, SEQUENCED_HEAD_SIZE,
};
pub use wire::{put_bytes, put_string, WireReader};
