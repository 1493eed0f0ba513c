//! Error types for the protocol layer.
//!
//! Everything that can go wrong while turning messages into frames (and
//! back) lands here: malformed heads, truncated bodies, codec setup
//! mistakes, and failures of the crypto and compression modules. Higher
//! layers wrap `ProtocolError` instead of inventing their own variants,
//! so a MAC mismatch looks the same whether it surfaced in the
//! handshake or in the middle of a session.

use crate::types::MsgId;

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A read ran past the end of a message body.
    #[error("truncated message: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes the field required.
        needed: usize,
        /// Bytes left in the body.
        remaining: usize,
    },

    /// A body decoded cleanly but left bytes behind.
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    /// A field carried a value outside its domain (unknown enum tag,
    /// invalid UTF-8, wrong key size...).
    #[error("invalid value for {field}: {value}")]
    InvalidValue {
        /// Name of the field or type being decoded.
        field: &'static str,
        /// The offending raw value.
        value: u64,
    },

    /// A frame head is inconsistent with itself.
    #[error("malformed head: {0}")]
    MalformedHead(&'static str),

    /// The decoder has no constructor for this message id.
    #[error("no message registered for id {0}")]
    UnregisteredMsg(MsgId),

    /// A frame announced a length beyond the configured maximum.
    #[error("packet of {len} bytes exceeds maximum {max}")]
    PacketTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A flag referenced a codec module that is not installed.
    #[error("codec module not configured: {0}")]
    ModuleNotConfigured(&'static str),

    /// The cipher suite combination is not supported.
    #[error("invalid cipher suite: {0}")]
    InvalidCipherSuite(&'static str),

    /// Key or IV material has the wrong length for the cipher.
    #[error("invalid key material: {0}")]
    KeyMaterial(&'static str),

    /// Encryption failed.
    #[error("encrypt failed: {0}")]
    Encrypt(String),

    /// Decryption failed (bad padding, AEAD tag rejected, ...).
    #[error("decrypt failed: {0}")]
    Decrypt(String),

    /// The message authentication code did not verify.
    #[error("MAC mismatch")]
    MacMismatch,

    /// Compression failed.
    #[error("compress failed: {0}")]
    Compress(String),

    /// Decompression failed or exceeded the output limit.
    #[error("decompress failed: {0}")]
    Decompress(String),

    /// The ECDHE exchange could not produce a shared secret.
    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    /// Signing or verifying the key exchange failed.
    #[error("signature failed: {0}")]
    Signature(String),
}

impl ProtocolError {
    /// Returns `true` for failures of the crypto modules.
    ///
    /// The handshake and session loop map these to an `EncryptFailed`
    /// reset instead of a generic protocol error.
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            Self::Encrypt(_)
                | Self::Decrypt(_)
                | Self::MacMismatch
                | Self::KeyExchange(_)
                | Self::Signature(_)
                | Self::KeyMaterial(_)
        )
    }
}
