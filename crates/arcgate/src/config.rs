//! Gateway and client configuration.
//!
//! Every struct deserializes from JSON with all fields optional, so a
//! config file only names what it changes:
//!
//! ```json
//! {
//!   "bind_addr": "0.0.0.0:7000",
//!   "session": { "inactive_timeout_secs": 120 },
//!   "handshake": { "cipher_suite": { "secret_key_exchange": "Ecdhe",
//!                                    "symmetric_encryption": "ChaCha20Poly1305" } }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use arcgate_protocol::{CipherSuite, Compression, NamedCurve, SignatureAlgorithm};
use arcgate_session::SessionConfig;
use serde::{Deserialize, Serialize};

use crate::ArcgateError;

/// How a session is negotiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Bound on the whole handshake, in milliseconds.
    pub timeout_ms: u64,

    /// Cipher suite this side offers (client) or falls back to (server).
    pub cipher_suite: CipherSuite,

    pub compression: Compression,

    /// Server only: take the client's cipher suite whenever it is valid.
    pub agree_client_cipher_suite: bool,

    /// Server only: take the client's compression proposal.
    pub agree_client_compression: bool,

    /// Server only: curve for the ephemeral key exchange. Clients
    /// answer on whatever curve the server picks.
    pub named_curve: NamedCurve,

    /// Server only: amount the AEAD nonce counter advances per frame.
    pub nonce_step: u64,

    /// Server only: algorithm signing the key exchange parameters.
    pub signature_algorithm: SignatureAlgorithm,

    /// Server only: private key for [`signature_algorithm`](Self::signature_algorithm).
    /// Without it the key exchange goes unsigned.
    #[serde(skip_serializing)]
    pub signing_key: Option<Vec<u8>>,

    /// Client only: the server's public signing key. When set, the
    /// server's key exchange must carry a valid signature.
    pub verify_key: Option<Vec<u8>>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            cipher_suite: CipherSuite::plain(),
            compression: Compression::None,
            agree_client_cipher_suite: true,
            agree_client_compression: true,
            named_curve: NamedCurve::X25519,
            nonce_step: 1,
            signature_algorithm: SignatureAlgorithm::None,
            signing_key: None,
            verify_key: None,
        }
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Configuration for a [`Gateway`](crate::Gateway).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the listening transport binds to.
    pub bind_addr: String,
    pub session: SessionConfig,
    pub handshake: HandshakeConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            session: SessionConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ArcgateError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ArcgateError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub session: SessionConfig,
    pub handshake: HandshakeConfig,

    /// Sent in the `Auth` message when the gateway asks for it.
    pub token: String,

    /// Opaque bytes sent next to the token.
    pub extensions: Vec<u8>,
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ArcgateError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcgate_protocol::SymmetricEncryption;

    #[test]
    fn test_empty_json_is_default() {
        let config = GatewayConfig::from_json_str("{}").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.handshake.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_nested_fields_override() {
        let config = GatewayConfig::from_json_str(
            r#"{
                "bind_addr": "0.0.0.0:9000",
                "session": { "inactive_timeout_secs": 5 },
                "handshake": {
                    "cipher_suite": {
                        "secret_key_exchange": "Ecdhe",
                        "symmetric_encryption": "ChaCha20Poly1305"
                    },
                    "compression": "Lz4"
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.session.inactive_timeout_secs, 5);
        assert_eq!(config.session.io_retry_times, 3);
        assert_eq!(
            config.handshake.cipher_suite.symmetric_encryption,
            SymmetricEncryption::ChaCha20Poly1305
        );
        assert_eq!(config.handshake.compression, Compression::Lz4);
        assert!(config.handshake.agree_client_cipher_suite);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = GatewayConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ArcgateError::Config(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = GatewayConfig::from_json_file("/nonexistent/arcgate.json").unwrap_err();
        assert!(matches!(err, ArcgateError::ConfigIo(_)));
    }

    #[test]
    fn test_signing_key_is_never_serialized() {
        let config = HandshakeConfig {
            signing_key: Some(vec![7; 32]),
            ..HandshakeConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("signing_key"));
    }

    #[test]
    fn test_client_config_token() {
        let config = ClientConfig::from_json_str(r#"{ "token": "abc" }"#).unwrap();
        assert_eq!(config.token, "abc");
        assert!(config.extensions.is_empty());
    }
}
