//! Error types for the session layer.

use arcgate_protocol::{Code, MsgId};
use arcgate_transport::TransportError;

use crate::SessionState;

/// Boxed error returned by user callbacks such as state watchers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while a session is being established or run.
///
/// The session loop classifies these to decide what happens next: I/O
/// errors make the session `Inactive`, a received reset ends it quietly,
/// recoverable handler errors are logged, and everything else ends the
/// session with an `Rst` carrying [`rst_code`](Self::rst_code).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Reading, writing or framing on the connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The peer sent an `Rst`.
    #[error("reset by peer ({code}): {message}")]
    Reset {
        /// Reason code carried by the `Rst`.
        code: Code,
        /// Free-form text carried by the `Rst`.
        message: String,
    },

    /// No handler accepted an event with this message id.
    #[error("no handler for {0}")]
    NoHandler(MsgId),

    /// An application handler failed; the session keeps running.
    #[error("handler failed: {0}")]
    Handler(String),

    /// An outbound queue is full; the item was dropped.
    #[error("{0} queue is full")]
    QueueFull(&'static str),

    /// The session is closed or dead.
    #[error("session is closed")]
    Closed,

    /// Authentication failed: the token was invalid, expired, or
    /// rejected by the [`Authenticator`](crate::Authenticator).
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A state change that the state machine does not allow.
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the session was in.
        from: SessionState,
        /// State that was requested.
        to: SessionState,
    },

    /// A session with the same id is already registered.
    #[error("session {0} already exists")]
    AlreadyExists(String),
}

impl SessionError {
    /// The receive or flush timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Transport(e) if e.is_timeout())
    }

    /// The connection itself failed (closed, reset, broken pipe).
    pub fn is_io(&self) -> bool {
        matches!(self, SessionError::Transport(e) if e.is_io())
    }

    /// Errors after which the session loop just carries on.
    pub fn recoverable(&self) -> bool {
        matches!(self, SessionError::Handler(_) | SessionError::QueueFull(_))
    }

    /// Code to put in the `Rst` sent when this error ends a session.
    pub fn rst_code(&self) -> Code {
        match self {
            SessionError::Reset { code, .. } => *code,
            SessionError::AuthFailed(_) => Code::AUTH_FAILED,
            SessionError::Closed => Code::SESSION_CLOSED,
            SessionError::Transport(TransportError::SyncFailed { .. }) => Code::CONTINUE_FAILED,
            SessionError::Transport(TransportError::Shutdown) => Code::SHUTDOWN,
            _ => Code::PROTOCOL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_classified() {
        let err = SessionError::from(TransportError::Timeout);
        assert!(err.is_timeout());
        assert!(!err.is_io());
    }

    #[test]
    fn test_closed_connection_is_io() {
        let err = SessionError::from(TransportError::ConnectionClosed("eof".into()));
        assert!(err.is_io());
        assert!(!err.recoverable());
    }

    #[test]
    fn test_rst_code_mapping() {
        assert_eq!(SessionError::NoHandler(MsgId::AUTH).rst_code(), Code::PROTOCOL_ERROR);
        assert_eq!(
            SessionError::AuthFailed("bad".into()).rst_code(),
            Code::AUTH_FAILED
        );
        let reset = SessionError::Reset {
            code: Code::SHUTDOWN,
            message: String::new(),
        };
        assert_eq!(reset.rst_code(), Code::SHUTDOWN);
        assert!(SessionError::Handler("oops".into()).recoverable());
    }
}
