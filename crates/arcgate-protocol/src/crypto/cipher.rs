//! Symmetric encryption modules.
//!
//! An [`EncryptionModule`] is one direction of one session: the encoder
//! owns an `Encrypt` module, the decoder a `Decrypt` one. Stream modes
//! (CTR, OFB, CFB, ChaCha20) keep their keystream position across
//! frames, so frames must be transformed in exactly the order they hit
//! the wire. CBC chains every frame from the same IV with fresh padding;
//! the AEAD ciphers draw a new nonce per frame from a [`NonceSupply`].

use std::fmt;

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes_gcm::Aes256Gcm;
use aes_gcm::aead::{Aead, KeyInit};
use chacha20::ChaCha20;
use chacha20poly1305::ChaCha20Poly1305;

use super::nonce::NonceSupply;
use super::padding::PaddingMode;
use super::suite::{BlockCipherMode, CipherSuite, SymmetricEncryption};
use crate::ProtocolError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type Aes256Ofb = ofb::Ofb<Aes256>;
type Aes256CfbEnc = cfb_mode::BufEncryptor<Aes256>;
type Aes256CfbDec = cfb_mode::BufDecryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const AES_BLOCK: usize = 16;

/// Which way a module transforms data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

enum CipherCore {
    Ctr(Aes256Ctr),
    Ofb(Aes256Ofb),
    ChaCha20(ChaCha20),
    CfbEnc(Aes256CfbEnc),
    CfbDec(Aes256CfbDec),
    CbcEnc(Aes256CbcEnc),
    CbcDec(Aes256CbcDec),
    Gcm(Box<Aes256Gcm>),
    ChaChaPoly(Box<ChaCha20Poly1305>),
}

/// One direction of a session's symmetric encryption.
pub struct EncryptionModule {
    core: CipherCore,
    direction: Direction,
    padding: PaddingMode,
    nonce: Option<NonceSupply>,
}

fn key_error(_: aes::cipher::InvalidLength) -> ProtocolError {
    ProtocolError::KeyMaterial("key or IV length does not fit the cipher")
}

impl EncryptionModule {
    /// Builds a module for `suite`.
    ///
    /// `key` must be 32 bytes. `iv` is 16 bytes for AES modes and 12 for
    /// ChaCha20 (longer IVs are truncated). AEAD suites need a 12-byte
    /// `nonce` supply and ignore `iv`.
    pub fn new(
        suite: &CipherSuite,
        key: &[u8],
        iv: &[u8],
        nonce: Option<NonceSupply>,
        direction: Direction,
    ) -> Result<Self, ProtocolError> {
        use BlockCipherMode as Mode;
        use SymmetricEncryption as Enc;

        suite.validate()?;
        let iv16 = iv.get(..AES_BLOCK).unwrap_or(iv);
        let iv12 = iv.get(..12).unwrap_or(iv);

        let core = match (suite.symmetric_encryption, suite.block_cipher_mode, direction) {
            (Enc::Aes, Mode::Ctr, _) => {
                CipherCore::Ctr(Aes256Ctr::new_from_slices(key, iv16).map_err(key_error)?)
            }
            (Enc::Aes, Mode::Ofb, _) => {
                CipherCore::Ofb(Aes256Ofb::new_from_slices(key, iv16).map_err(key_error)?)
            }
            (Enc::Aes, Mode::Cfb, Direction::Encrypt) => {
                CipherCore::CfbEnc(Aes256CfbEnc::new_from_slices(key, iv16).map_err(key_error)?)
            }
            (Enc::Aes, Mode::Cfb, Direction::Decrypt) => {
                CipherCore::CfbDec(Aes256CfbDec::new_from_slices(key, iv16).map_err(key_error)?)
            }
            (Enc::Aes, Mode::Cbc, Direction::Encrypt) => {
                CipherCore::CbcEnc(Aes256CbcEnc::new_from_slices(key, iv16).map_err(key_error)?)
            }
            (Enc::Aes, Mode::Cbc, Direction::Decrypt) => {
                CipherCore::CbcDec(Aes256CbcDec::new_from_slices(key, iv16).map_err(key_error)?)
            }
            (Enc::Aes, Mode::Gcm, _) => CipherCore::Gcm(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(|_| ProtocolError::KeyMaterial("AES-GCM key"))?,
            )),
            (Enc::ChaCha20, _, _) => {
                CipherCore::ChaCha20(ChaCha20::new_from_slices(key, iv12).map_err(key_error)?)
            }
            (Enc::ChaCha20Poly1305, _, _) => CipherCore::ChaChaPoly(Box::new(
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| ProtocolError::KeyMaterial("ChaCha20-Poly1305 key"))?,
            )),
            _ => return Err(ProtocolError::InvalidCipherSuite("suite does not encrypt")),
        };

        if suite.is_aead() {
            // The AEAD constructors panic on a wrong-sized nonce, so check up front.
            match &nonce {
                Some(supply) if supply.len() == 12 => {}
                _ => return Err(ProtocolError::KeyMaterial("AEAD requires a 12-byte nonce")),
            }
        }

        Ok(Self {
            core,
            direction,
            padding: suite.padding_mode,
            nonce,
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Encrypts or decrypts `src` depending on the module's direction.
    pub fn transforming(&mut self, src: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let direction = self.direction;
        match &mut self.core {
            CipherCore::Ctr(c) => Ok(apply_keystream(c, src)),
            CipherCore::Ofb(c) => Ok(apply_keystream(c, src)),
            CipherCore::ChaCha20(c) => Ok(apply_keystream(c, src)),
            CipherCore::CfbEnc(c) => {
                let mut out = src.to_vec();
                c.encrypt(&mut out);
                Ok(out)
            }
            CipherCore::CfbDec(c) => {
                let mut out = src.to_vec();
                c.decrypt(&mut out);
                Ok(out)
            }
            CipherCore::CbcEnc(c) => {
                let mut out = src.to_vec();
                self.padding.pad(&mut out, AES_BLOCK)?;
                for block in out.chunks_exact_mut(AES_BLOCK) {
                    c.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                Ok(out)
            }
            CipherCore::CbcDec(c) => {
                if src.len() % AES_BLOCK != 0 {
                    return Err(ProtocolError::Decrypt("ciphertext not block aligned".into()));
                }
                let mut out = src.to_vec();
                for block in out.chunks_exact_mut(AES_BLOCK) {
                    c.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                self.padding.unpad(&mut out, AES_BLOCK)?;
                Ok(out)
            }
            CipherCore::Gcm(c) => {
                let nonce = next_nonce(&mut self.nonce)?;
                seal_or_open(c.as_ref(), direction, &nonce, src)
            }
            CipherCore::ChaChaPoly(c) => {
                let nonce = next_nonce(&mut self.nonce)?;
                seal_or_open(c.as_ref(), direction, &nonce, src)
            }
        }
    }
}

fn apply_keystream(cipher: &mut impl StreamCipher, src: &[u8]) -> Vec<u8> {
    let mut out = src.to_vec();
    cipher.apply_keystream(&mut out);
    out
}

fn next_nonce(supply: &mut Option<NonceSupply>) -> Result<Vec<u8>, ProtocolError> {
    supply
        .as_mut()
        .map(NonceSupply::next)
        .ok_or(ProtocolError::KeyMaterial("AEAD requires a nonce"))
}

fn seal_or_open<A: Aead>(
    cipher: &A,
    direction: Direction,
    nonce: &[u8],
    src: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if nonce.len() != 12 {
        return Err(ProtocolError::KeyMaterial("AEAD requires a 12-byte nonce"));
    }
    let nonce = GenericArray::from_slice(nonce);
    match direction {
        Direction::Encrypt => cipher
            .encrypt(nonce, src)
            .map_err(|_| ProtocolError::Encrypt("AEAD seal failed".into())),
        Direction::Decrypt => cipher
            .decrypt(nonce, src)
            .map_err(|_| ProtocolError::Decrypt("AEAD tag rejected".into())),
    }
}

impl fmt::Debug for EncryptionModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.core {
            CipherCore::Ctr(_) => "aes-256-ctr",
            CipherCore::Ofb(_) => "aes-256-ofb",
            CipherCore::ChaCha20(_) => "chacha20",
            CipherCore::CfbEnc(_) | CipherCore::CfbDec(_) => "aes-256-cfb",
            CipherCore::CbcEnc(_) | CipherCore::CbcDec(_) => "aes-256-cbc",
            CipherCore::Gcm(_) => "aes-256-gcm",
            CipherCore::ChaChaPoly(_) => "chacha20-poly1305",
        };
        f.debug_struct("EncryptionModule")
            .field("cipher", &kind)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::mac::MacHash;
    use crate::crypto::nonce::NonceCounter;

    const KEY: [u8; 32] = [7; 32];
    const IV: [u8; 16] = [3; 16];

    fn supply() -> Option<NonceSupply> {
        Some(NonceSupply::Counter(
            NonceCounter::new(&[0; 12], &[1]).unwrap(),
        ))
    }

    fn pair(suite: CipherSuite) -> (EncryptionModule, EncryptionModule) {
        let nonce = if suite.is_aead() { supply() } else { None };
        let enc = EncryptionModule::new(&suite, &KEY, &IV, nonce.clone(), Direction::Encrypt).unwrap();
        let dec = EncryptionModule::new(&suite, &KEY, &IV, nonce, Direction::Decrypt).unwrap();
        (enc, dec)
    }

    fn all_suites() -> Vec<CipherSuite> {
        use BlockCipherMode as Mode;
        vec![
            CipherSuite::aes(Mode::Ctr, PaddingMode::None, MacHash::None),
            CipherSuite::aes(Mode::Ofb, PaddingMode::None, MacHash::None),
            CipherSuite::aes(Mode::Cfb, PaddingMode::None, MacHash::None),
            CipherSuite::aes(Mode::Cbc, PaddingMode::Pkcs7, MacHash::None),
            CipherSuite::aes(Mode::Cbc, PaddingMode::X923, MacHash::None),
            CipherSuite::aes(Mode::Gcm, PaddingMode::None, MacHash::None),
            CipherSuite {
                symmetric_encryption: SymmetricEncryption::ChaCha20,
                ..CipherSuite::chacha20_poly1305()
            },
            CipherSuite::chacha20_poly1305(),
        ]
    }

    #[test]
    fn test_every_mode_decrypts_a_stream_of_frames() {
        for suite in all_suites() {
            let (mut enc, mut dec) = pair(suite);
            // Several frames in a row: stream state and nonces must stay in step.
            for frame in [&b"hello"[..], b"", &[0xaa; 33], b"sixteen bytes!!!"] {
                let sealed = enc.transforming(frame).unwrap();
                let opened = dec.transforming(&sealed).unwrap();
                assert_eq!(opened, frame, "suite {suite:?}");
            }
        }
    }

    #[test]
    fn test_stream_ciphertext_differs_between_frames() {
        let (mut enc, _) = pair(CipherSuite::aes(
            BlockCipherMode::Ctr,
            PaddingMode::None,
            MacHash::None,
        ));
        let a = enc.transforming(b"same").unwrap();
        let b = enc.transforming(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_aead_rejects_tampered_ciphertext() {
        let (mut enc, mut dec) = pair(CipherSuite::chacha20_poly1305());
        let mut sealed = enc.transforming(b"payload").unwrap();
        sealed[0] ^= 1;
        assert!(matches!(
            dec.transforming(&sealed),
            Err(ProtocolError::Decrypt(_))
        ));
    }

    #[test]
    fn test_aead_without_nonce_is_rejected() {
        let suite = CipherSuite::chacha20_poly1305();
        let err = EncryptionModule::new(&suite, &KEY, &[], None, Direction::Encrypt).unwrap_err();
        assert!(matches!(err, ProtocolError::KeyMaterial(_)));
    }

    #[test]
    fn test_short_key_is_rejected() {
        let suite = CipherSuite::aes(BlockCipherMode::Ctr, PaddingMode::None, MacHash::None);
        assert!(EncryptionModule::new(&suite, &[1; 8], &IV, None, Direction::Encrypt).is_err());
    }

    #[test]
    fn test_plain_suite_has_no_module() {
        assert!(
            EncryptionModule::new(&CipherSuite::plain(), &KEY, &IV, None, Direction::Encrypt)
                .is_err()
        );
    }
}
