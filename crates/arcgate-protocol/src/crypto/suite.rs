//! Cipher suite negotiation values.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use super::mac::MacHash;
use super::padding::PaddingMode;
use crate::wire::WireReader;
use crate::ProtocolError;

wire_enum! {
    /// How the session secret is agreed.
    pub enum SecretKeyExchange {
        #[default]
        None = 0,
        Ecdhe = 1,
    }
}

wire_enum! {
    /// Symmetric cipher used once the handshake switched to encryption.
    pub enum SymmetricEncryption {
        #[default]
        None = 0,
        /// AES-256, combined with a [`BlockCipherMode`].
        Aes = 1,
        ChaCha20 = 2,
        ChaCha20Poly1305 = 3,
    }
}

wire_enum! {
    /// Block cipher mode for [`SymmetricEncryption::Aes`].
    pub enum BlockCipherMode {
        #[default]
        None = 0,
        Cbc = 1,
        Cfb = 2,
        Ofb = 3,
        Ctr = 4,
        Gcm = 5,
    }
}

/// The full set of crypto choices for one session.
///
/// A suite with `secret_key_exchange = None` is the plain suite: no
/// encryption, no MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherSuite {
    pub secret_key_exchange: SecretKeyExchange,
    pub symmetric_encryption: SymmetricEncryption,
    pub block_cipher_mode: BlockCipherMode,
    pub padding_mode: PaddingMode,
    pub mac_hash: MacHash,
}

impl CipherSuite {
    /// Encoded size on the wire.
    pub const SIZE: usize = 5;

    /// No key exchange, no encryption.
    pub const fn plain() -> Self {
        Self {
            secret_key_exchange: SecretKeyExchange::None,
            symmetric_encryption: SymmetricEncryption::None,
            block_cipher_mode: BlockCipherMode::None,
            padding_mode: PaddingMode::None,
            mac_hash: MacHash::None,
        }
    }

    /// ECDHE + ChaCha20-Poly1305, no separate MAC.
    pub const fn chacha20_poly1305() -> Self {
        Self {
            secret_key_exchange: SecretKeyExchange::Ecdhe,
            symmetric_encryption: SymmetricEncryption::ChaCha20Poly1305,
            block_cipher_mode: BlockCipherMode::None,
            padding_mode: PaddingMode::None,
            mac_hash: MacHash::None,
        }
    }

    /// ECDHE + AES-256 in the given mode, with a MAC.
    pub const fn aes(mode: BlockCipherMode, padding: PaddingMode, mac: MacHash) -> Self {
        Self {
            secret_key_exchange: SecretKeyExchange::Ecdhe,
            symmetric_encryption: SymmetricEncryption::Aes,
            block_cipher_mode: mode,
            padding_mode: padding,
            mac_hash: mac,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.secret_key_exchange != SecretKeyExchange::None
    }

    /// `true` for authenticated ciphers that consume a nonce per frame.
    pub fn is_aead(&self) -> bool {
        matches!(self.symmetric_encryption, SymmetricEncryption::ChaCha20Poly1305)
            || (self.symmetric_encryption == SymmetricEncryption::Aes
                && self.block_cipher_mode == BlockCipherMode::Gcm)
    }

    /// IV length the server generates for this suite.
    pub fn iv_size(&self) -> usize {
        match (self.symmetric_encryption, self.block_cipher_mode) {
            (SymmetricEncryption::Aes, BlockCipherMode::Gcm) => 0,
            (SymmetricEncryption::Aes, _) => 16,
            (SymmetricEncryption::ChaCha20, _) => 12,
            _ => 0,
        }
    }

    /// Nonce length the server generates for this suite.
    pub fn nonce_size(&self) -> usize {
        if self.is_aead() { 12 } else { 0 }
    }

    /// Rejects combinations the crypto modules cannot serve.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        use BlockCipherMode as Mode;
        use SymmetricEncryption as Enc;

        if !self.is_encrypted() {
            if self.symmetric_encryption != Enc::None || self.mac_hash != MacHash::None {
                return Err(ProtocolError::InvalidCipherSuite(
                    "encryption and MAC require a secret key exchange",
                ));
            }
            return Ok(());
        }

        match (self.symmetric_encryption, self.block_cipher_mode) {
            (Enc::None, _) => Err(ProtocolError::InvalidCipherSuite(
                "key exchange without a symmetric cipher",
            )),
            (Enc::Aes, Mode::None) => Err(ProtocolError::InvalidCipherSuite(
                "AES requires a block cipher mode",
            )),
            (Enc::Aes, Mode::Cbc) if self.padding_mode == PaddingMode::None => Err(
                ProtocolError::InvalidCipherSuite("CBC requires a padding mode"),
            ),
            (Enc::ChaCha20 | Enc::ChaCha20Poly1305, mode) if mode != Mode::None => Err(
                ProtocolError::InvalidCipherSuite("stream ciphers take no block mode"),
            ),
            _ => Ok(()),
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.secret_key_exchange.into());
        buf.put_u8(self.symmetric_encryption.into());
        buf.put_u8(self.block_cipher_mode.into());
        buf.put_u8(self.padding_mode.into());
        buf.put_u8(self.mac_hash.into());
    }

    pub fn read(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            secret_key_exchange: reader.tag()?,
            symmetric_encryption: reader.tag()?,
            block_cipher_mode: reader.tag()?,
            padding_mode: reader.tag()?,
            mac_hash: reader.tag()?,
        })
    }
}
