//! ECDHE key agreement, key-exchange signatures and the session key
//! schedule.
//!
//! The shared secret never keys a cipher directly. It goes through
//! HKDF-SHA256, salted with both handshake randoms, which yields one
//! write key per direction plus the MAC secret.

use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;

use crate::ProtocolError;

wire_enum! {
    /// Curve used for the ephemeral key exchange.
    pub enum NamedCurve {
        #[default]
        None = 0,
        X25519 = 1,
        P256 = 2,
    }
}

wire_enum! {
    /// Algorithm signing the key-exchange parameters.
    pub enum SignatureAlgorithm {
        #[default]
        None = 0,
        Ed25519 = 1,
    }
}

/// An ephemeral private key, consumed by [`agree`](Self::agree).
pub enum EphemeralKey {
    X25519(x25519_dalek::EphemeralSecret),
    P256(p256::ecdh::EphemeralSecret),
}

impl EphemeralKey {
    pub fn generate(curve: NamedCurve) -> Result<Self, ProtocolError> {
        match curve {
            NamedCurve::X25519 => Ok(Self::X25519(
                x25519_dalek::EphemeralSecret::random_from_rng(OsRng),
            )),
            NamedCurve::P256 => Ok(Self::P256(p256::ecdh::EphemeralSecret::random(&mut OsRng))),
            NamedCurve::None => Err(ProtocolError::KeyExchange("no curve selected".into())),
        }
    }

    pub fn curve(&self) -> NamedCurve {
        match self {
            Self::X25519(_) => NamedCurve::X25519,
            Self::P256(_) => NamedCurve::P256,
        }
    }

    /// Public half to send to the peer.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            Self::X25519(secret) => x25519_dalek::PublicKey::from(secret).as_bytes().to_vec(),
            Self::P256(secret) => p256::EncodedPoint::from(secret.public_key())
                .as_bytes()
                .to_vec(),
        }
    }

    /// Combines our secret with the peer's public key.
    pub fn agree(self, peer_public: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self {
            Self::X25519(secret) => {
                let peer: [u8; 32] = peer_public.try_into().map_err(|_| {
                    ProtocolError::KeyExchange("X25519 public key must be 32 bytes".into())
                })?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Err(ProtocolError::KeyExchange("low-order X25519 point".into()));
                }
                Ok(shared.as_bytes().to_vec())
            }
            Self::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|e| ProtocolError::KeyExchange(e.to_string()))?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Signatures
// ---------------------------------------------------------------------------

fn ed25519_key<const N: usize>(bytes: &[u8]) -> Result<[u8; N], ProtocolError> {
    bytes
        .try_into()
        .map_err(|_| ProtocolError::Signature(format!("expected a {N}-byte key")))
}

/// Signs `data` with a private key of `algorithm`.
pub fn sign(
    algorithm: SignatureAlgorithm,
    private_key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    use ed25519_dalek::Signer;

    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let key = ed25519_dalek::SigningKey::from_bytes(&ed25519_key(private_key)?);
            Ok(key.sign(data).to_bytes().to_vec())
        }
        SignatureAlgorithm::None => Err(ProtocolError::Signature("no algorithm".into())),
    }
}

/// Public key matching a private key, for distributing to peers.
pub fn verifying_key(
    algorithm: SignatureAlgorithm,
    private_key: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let key = ed25519_dalek::SigningKey::from_bytes(&ed25519_key(private_key)?);
            Ok(key.verifying_key().to_bytes().to_vec())
        }
        SignatureAlgorithm::None => Err(ProtocolError::Signature("no algorithm".into())),
    }
}

/// Verifies a signature produced by [`sign`].
pub fn verify(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), ProtocolError> {
    use ed25519_dalek::Verifier;

    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let key = ed25519_dalek::VerifyingKey::from_bytes(&ed25519_key(public_key)?)
                .map_err(|e| ProtocolError::Signature(e.to_string()))?;
            let signature = ed25519_dalek::Signature::from_slice(signature)
                .map_err(|e| ProtocolError::Signature(e.to_string()))?;
            key.verify(data, &signature)
                .map_err(|e| ProtocolError::Signature(e.to_string()))
        }
        SignatureAlgorithm::None => Err(ProtocolError::Signature("no algorithm".into())),
    }
}

// ---------------------------------------------------------------------------
// Key schedule
// ---------------------------------------------------------------------------

/// Length of every derived key.
pub const SESSION_KEY_SIZE: usize = 32;

/// Keys derived from one ECDHE secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    /// Encrypts client-to-server frames.
    pub client_write: [u8; SESSION_KEY_SIZE],
    /// Encrypts server-to-client frames.
    pub server_write: [u8; SESSION_KEY_SIZE],
    pub mac_secret: [u8; SESSION_KEY_SIZE],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Runs HKDF-SHA256 over the shared secret.
pub fn derive_session_keys(
    shared_secret: &[u8],
    client_random: &[u8],
    server_random: &[u8],
) -> Result<SessionKeys, ProtocolError> {
    let salt = [client_random, server_random].concat();
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let expand = |info: &[u8]| -> Result<[u8; SESSION_KEY_SIZE], ProtocolError> {
        let mut out = [0u8; SESSION_KEY_SIZE];
        hkdf.expand(info, &mut out)
            .map_err(|_| ProtocolError::KeyExchange("HKDF output too long".into()))?;
        Ok(out)
    };
    Ok(SessionKeys {
        client_write: expand(b"arcgate client write key")?,
        server_write: expand(b"arcgate server write key")?,
        mac_secret: expand(b"arcgate mac secret")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_curves_agree_on_a_secret() {
        for curve in [NamedCurve::X25519, NamedCurve::P256] {
            let alice = EphemeralKey::generate(curve).unwrap();
            let bob = EphemeralKey::generate(curve).unwrap();
            let (alice_pub, bob_pub) = (alice.public_key(), bob.public_key());
            let a = alice.agree(&bob_pub).unwrap();
            let b = bob.agree(&alice_pub).unwrap();
            assert_eq!(a, b, "{curve:?}");
            assert_eq!(a.len(), 32);
        }
    }

    #[test]
    fn test_malformed_peer_key_is_rejected() {
        let key = EphemeralKey::generate(NamedCurve::X25519).unwrap();
        assert!(key.agree(&[1, 2, 3]).is_err());
        let key = EphemeralKey::generate(NamedCurve::P256).unwrap();
        assert!(key.agree(&[4; 65]).is_err());
    }

    #[test]
    fn test_low_order_x25519_point_is_rejected() {
        let key = EphemeralKey::generate(NamedCurve::X25519).unwrap();
        assert!(matches!(
            key.agree(&[0; 32]),
            Err(ProtocolError::KeyExchange(_))
        ));
    }

    #[test]
    fn test_signature_verifies_and_detects_tampering() {
        let private = [9u8; 32];
        let public = verifying_key(SignatureAlgorithm::Ed25519, &private).unwrap();
        let sig = sign(SignatureAlgorithm::Ed25519, &private, b"params").unwrap();
        assert!(verify(SignatureAlgorithm::Ed25519, &public, b"params", &sig).is_ok());
        assert!(verify(SignatureAlgorithm::Ed25519, &public, b"paramz", &sig).is_err());
    }

    #[test]
    fn test_key_schedule_separates_directions_and_depends_on_randoms() {
        let keys = derive_session_keys(&[1; 32], b"client", b"server").unwrap();
        assert_ne!(keys.client_write, keys.server_write);
        assert_ne!(keys.client_write, keys.mac_secret);
        let again = derive_session_keys(&[1; 32], b"client", b"server").unwrap();
        assert_eq!(keys, again);
        let other = derive_session_keys(&[1; 32], b"client", b"other").unwrap();
        assert_ne!(keys, other);
    }
}
