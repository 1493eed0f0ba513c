//! Message authentication codes.
//!
//! The MAC covers the message id, the final flag byte and the plaintext
//! payload. It is appended to the payload before encryption, so a
//! receiver decrypts first and then verifies.

use std::fmt;

use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::{Flags, MsgId};
use crate::ProtocolError;

type HmacSha256 = Hmac<Sha256>;

wire_enum! {
    /// MAC algorithm.
    pub enum MacHash {
        #[default]
        None = 0,
        /// Keyed BLAKE3 truncated to 32 bits.
        Fast32 = 1,
        /// Keyed BLAKE3 truncated to 64 bits.
        Fast64 = 2,
        /// HMAC-SHA256.
        Sha256 = 3,
        /// Keyed BLAKE3, full 256 bits.
        Blake3 = 4,
    }
}

impl MacHash {
    /// Length of the appended code in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::None => 0,
            Self::Fast32 => 4,
            Self::Fast64 => 8,
            Self::Sha256 | Self::Blake3 => 32,
        }
    }
}

/// Computes and verifies codes for one session secret.
#[derive(Clone)]
pub struct MacModule {
    hash: MacHash,
    blake3_key: [u8; 32],
    hmac: Option<HmacSha256>,
}

impl MacModule {
    pub fn new(hash: MacHash, secret: &[u8]) -> Result<Self, ProtocolError> {
        let hmac = match hash {
            MacHash::None => {
                return Err(ProtocolError::InvalidCipherSuite("MAC module without a hash"));
            }
            MacHash::Sha256 => Some(
                <HmacSha256 as Mac>::new_from_slice(secret)
                    .map_err(|_| ProtocolError::KeyMaterial("HMAC key"))?,
            ),
            _ => None,
        };
        let blake3_key = match <[u8; 32]>::try_from(secret) {
            Ok(key) => key,
            Err(_) => *blake3::hash(secret).as_bytes(),
        };
        Ok(Self {
            hash,
            blake3_key,
            hmac,
        })
    }

    pub fn hash(&self) -> MacHash {
        self.hash
    }

    pub fn size(&self) -> usize {
        self.hash.size()
    }

    pub fn compute(&self, msg_id: MsgId, flags: Flags, payload: &[u8]) -> Vec<u8> {
        let prefix = [msg_id.0, flags.bits()];
        if let Some(hmac) = &self.hmac {
            let mut mac = hmac.clone();
            mac.update(&prefix);
            mac.update(payload);
            return mac.finalize().into_bytes().to_vec();
        }
        let mut hasher = blake3::Hasher::new_keyed(&self.blake3_key);
        hasher.update(&prefix);
        hasher.update(payload);
        let mut out = vec![0u8; self.size()];
        hasher.finalize_xof().fill(&mut out);
        out
    }

    /// Appends the code for `payload` to `payload` itself.
    pub fn append(&self, msg_id: MsgId, flags: Flags, payload: &mut Vec<u8>) {
        let code = self.compute(msg_id, flags, payload);
        payload.extend_from_slice(&code);
    }

    /// Checks the trailing code and strips it.
    pub fn verify_and_strip(
        &self,
        msg_id: MsgId,
        flags: Flags,
        data: &mut Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let size = self.size();
        if data.len() < size {
            return Err(ProtocolError::MacMismatch);
        }
        let body = data.len() - size;
        let expected = self.compute(msg_id, flags, &data[..body]);
        if !constant_time_eq(&expected, &data[body..]) {
            return Err(ProtocolError::MacMismatch);
        }
        data.truncate(body);
        Ok(())
    }
}

impl fmt::Debug for MacModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MacModule").field("hash", &self.hash).finish_non_exhaustive()
    }
}
