//! Unified error types for the gateway.

use arcgate_protocol::{Code, MsgId, ProtocolError, Version};
use arcgate_session::SessionError;
use arcgate_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `arcgate` crate, you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant auto-generates `From` impls, so the `?`
/// operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum ArcgateError {
    /// A transport-level error (bind, accept, connection I/O).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (framing, codec, crypto).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (queues, state, auth).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Establishing or resuming a session failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// A configuration file could not be read.
    #[error("config i/o: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// A configuration document is malformed.
    #[error("config: {0}")]
    Config(#[from] serde_json::Error),
}

/// Why a handshake did not complete.
///
/// Either side answers a failure with an `Rst` carrying
/// [`rst_code`](Self::rst_code), unless the failure is itself a reset
/// from the peer.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The peer answered with an `Rst`.
    #[error("rejected by peer ({code}): {message}")]
    Rejected { code: Code, message: String },

    /// A message arrived out of order.
    #[error("expected {expected}, received {received}")]
    Unexpected { expected: MsgId, received: MsgId },

    /// The peer speaks another protocol version.
    #[error("unsupported version {theirs} (ours is {ours})")]
    VersionMismatch { ours: Version, theirs: Version },

    /// A continue request names a session that is gone.
    #[error("session {0} not found")]
    SessionNotFound(String),

    /// Negotiating or confirming the cipher failed.
    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The session cannot resume from the peer's sequences.
    #[error("continue failed: {0}")]
    ContinueFailed(String),

    /// A flag the exchange requires is missing.
    #[error("missing {0} flag")]
    MissingFlag(&'static str),

    /// The gateway is shutting down and takes no new sessions.
    #[error("gateway shutting down")]
    ShuttingDown,

    /// The whole exchange did not finish within the handshake timeout.
    #[error("handshake timed out")]
    Timeout,
}

impl HandshakeError {
    /// The code an `Rst` reporting this failure carries.
    pub fn rst_code(&self) -> Code {
        match self {
            Self::Rejected { code, .. } => *code,
            Self::VersionMismatch { .. } => Code::VERSION_ERROR,
            Self::SessionNotFound(_) => Code::SESSION_NOT_FOUND,
            Self::EncryptFailed(_) => Code::ENCRYPT_FAILED,
            Self::Protocol(e) | Self::Transport(TransportError::Protocol(e)) if is_crypto(e) => {
                Code::ENCRYPT_FAILED
            }
            Self::AuthFailed(_) => Code::AUTH_FAILED,
            Self::ContinueFailed(_) => Code::CONTINUE_FAILED,
            Self::ShuttingDown => Code::SHUTDOWN,
            Self::Session(e) => e.rst_code(),
            _ => Code::PROTOCOL_ERROR,
        }
    }

    /// `false` when the peer already reset or the connection is gone, so
    /// answering with an `Rst` is pointless.
    pub fn should_reset(&self) -> bool {
        match self {
            Self::Rejected { .. } => false,
            Self::Transport(e) => !e.is_io(),
            _ => true,
        }
    }
}

fn is_crypto(e: &ProtocolError) -> bool {
    matches!(
        e,
        ProtocolError::Decrypt(_)
            | ProtocolError::Encrypt(_)
            | ProtocolError::MacMismatch
            | ProtocolError::KeyExchange(_)
            | ProtocolError::Signature(_)
            | ProtocolError::KeyMaterial(_)
            | ProtocolError::InvalidCipherSuite(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let arcgate_err: ArcgateError = err.into();
        assert!(matches!(arcgate_err, ArcgateError::Transport(_)));
        assert!(arcgate_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::MacMismatch;
        let arcgate_err: ArcgateError = err.into();
        assert!(matches!(arcgate_err, ArcgateError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::AuthFailed("nope".into());
        let arcgate_err: ArcgateError = err.into();
        assert!(matches!(arcgate_err, ArcgateError::Session(_)));
    }

    #[test]
    fn test_from_handshake_error() {
        let arcgate_err: ArcgateError = HandshakeError::Timeout.into();
        assert!(matches!(arcgate_err, ArcgateError::Handshake(_)));
    }

    #[test]
    fn test_handshake_rst_codes() {
        let version = HandshakeError::VersionMismatch {
            ours: Version::CURRENT,
            theirs: Version(0x0200),
        };
        assert_eq!(version.rst_code(), Code::VERSION_ERROR);
        assert_eq!(
            HandshakeError::Protocol(ProtocolError::MacMismatch).rst_code(),
            Code::ENCRYPT_FAILED
        );
        assert_eq!(
            HandshakeError::Transport(TransportError::Protocol(ProtocolError::MacMismatch))
                .rst_code(),
            Code::ENCRYPT_FAILED
        );
        assert_eq!(
            HandshakeError::AuthFailed("bad token".into()).rst_code(),
            Code::AUTH_FAILED
        );
        assert_eq!(
            HandshakeError::SessionNotFound("abc".into()).rst_code(),
            Code::SESSION_NOT_FOUND
        );
        assert_eq!(
            HandshakeError::Unexpected {
                expected: MsgId::HELLO,
                received: MsgId::PAYLOAD
            }
            .rst_code(),
            Code::PROTOCOL_ERROR
        );
    }

    #[test]
    fn test_peer_reset_is_not_answered() {
        let rejected = HandshakeError::Rejected {
            code: Code::REJECT,
            message: "no".into(),
        };
        assert!(!rejected.should_reset());
        assert!(!HandshakeError::Transport(TransportError::ConnectionClosed("eof".into())).should_reset());
        assert!(HandshakeError::Timeout.should_reset());
    }
}
