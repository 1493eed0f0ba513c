//! Authentication hook for validating client identity.
//!
//! Arcgate doesn't implement authentication itself. That's your job (or
//! your auth provider's: JWT, an account service, a platform SDK).
//!
//! Instead, Arcgate defines the [`Authenticator`] trait: a single async
//! method that takes the token and extension bytes from the client's
//! `Auth` message and returns a [`UserId`] or an error. The gateway
//! calls it during the handshake, including on every reconnect.

use std::future::Future;

use crate::{SessionError, UserId};

/// Validates a client's auth token and returns their identity.
///
/// `Send + Sync + 'static` because one authenticator is shared by every
/// handshake task for the lifetime of the gateway.
///
/// # Example
///
/// ```rust
/// use arcgate_session::{Authenticator, SessionError, UserId};
///
/// /// Accepts tokens of the form `user:<name>`.
/// struct PrefixAuthenticator;
///
/// impl Authenticator for PrefixAuthenticator {
///     async fn authenticate(
///         &self,
///         token: &str,
///         _extensions: &[u8],
///     ) -> Result<UserId, SessionError> {
///         token
///             .strip_prefix("user:")
///             .map(|name| UserId(name.to_string()))
///             .ok_or_else(|| SessionError::AuthFailed("unknown token".into()))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Validates the token and returns the client's identity.
    ///
    /// Returning `Err` aborts the handshake with `Rst{AuthFailed}`.
    fn authenticate(
        &self,
        token: &str,
        extensions: &[u8],
    ) -> impl Future<Output = Result<UserId, SessionError>> + Send;

    /// Whether clients must send an `Auth` message at all. When false the
    /// gateway leaves the `Auth` flag off its `Hello`.
    fn required(&self) -> bool {
        true
    }
}

/// Skips authentication. Every session's user id is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

impl Authenticator for NoAuth {
    async fn authenticate(&self, token: &str, _extensions: &[u8]) -> Result<UserId, SessionError> {
        Ok(UserId(token.to_string()))
    }

    fn required(&self) -> bool {
        false
    }
}
