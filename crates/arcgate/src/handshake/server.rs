//! The gateway's side of the handshake.

use std::sync::Arc;

use arcgate_protocol::{
    derive_session_keys, sign, Auth, ChangeCipherSpec, CipherSuite, Continue, Decoder,
    EcdheKeyExchange, Encoder, EphemeralKey, Finished, Flags, Hello, Msg, SignatureAlgorithm,
    Version,
};
use arcgate_session::{
    generate_session_id, Authenticator, Session, SessionError, SessionId, SessionState, UserId,
};
use arcgate_transport::{Conn, SequencedBuffer, Transceiver};
use bytes::Bytes;

use super::{
    expect, install_cipher, install_compression, random_bytes, signed_params, transcript, Side,
    RANDOM_SIZE,
};
use crate::config::HandshakeConfig;
use crate::server::Shared;
use crate::HandshakeError;

/// What a successful handshake produced.
pub(crate) enum Accepted<C: Conn> {
    /// A new session, registered and `Confirmed`. Its main loop has not
    /// started yet.
    New(Arc<Session<C>>),
    /// An existing session that moved onto the new connection.
    Resumed(Arc<Session<C>>),
}

enum Target<C: Conn> {
    New(Arc<Session<C>>),
    Resume(Arc<Session<C>>),
}

impl<C: Conn> Target<C> {
    fn session(&self) -> &Arc<Session<C>> {
        match self {
            Target::New(session) | Target::Resume(session) => session,
        }
    }
}

enum Outcome<C: Conn> {
    Created(Arc<Session<C>>),
    Resume {
        session: Arc<Session<C>>,
        remote_recv_seq: u32,
        flags: Flags,
    },
}

struct ServerHandshake<'a, C: Conn, A: Authenticator> {
    shared: &'a Shared<C, A>,
    transceiver: Arc<Transceiver<C>>,
    /// Set as soon as a new session exists, so a failure can kill it.
    created: Option<Arc<Session<C>>>,
}

/// Runs the handshake on a freshly accepted connection.
///
/// On failure the peer gets a best-effort `Rst`, a session created for
/// this connection dies and the connection is closed.
pub(crate) async fn accept<C: Conn, A: Authenticator>(
    conn: C,
    shared: &Shared<C, A>,
) -> Result<Accepted<C>, HandshakeError> {
    let session_config = &shared.config.session;
    let transceiver = Transceiver::new(
        conn,
        Encoder::new(),
        Decoder::new(Arc::clone(&shared.creator)),
        SequencedBuffer::new(session_config.buffer_capacity),
        session_config.io_timeout(),
    );
    let mut handshake = ServerHandshake {
        shared,
        transceiver: Arc::new(transceiver),
        created: None,
    };

    let timeout = shared.config.handshake.timeout();
    let result = tokio::time::timeout(timeout, handshake.run())
        .await
        .unwrap_or(Err(HandshakeError::Timeout));
    match result {
        Ok(Outcome::Created(session)) => Ok(Accepted::New(session)),
        Ok(Outcome::Resume {
            session,
            remote_recv_seq,
            flags,
        }) => handshake
            .resume(session, remote_recv_seq, flags)
            .await
            .map(Accepted::Resumed),
        Err(e) => {
            handshake.fail(&e).await;
            Err(e)
        }
    }
}

impl<'a, C: Conn, A: Authenticator> ServerHandshake<'a, C, A> {
    async fn run(&mut self) -> Result<Outcome<C>, HandshakeError> {
        let shared = self.shared;
        let settings = &shared.config.handshake;

        let (_, client_hello) = expect::<C, Hello>(&self.transceiver).await?;
        if *shared.shutdown.borrow() {
            return Err(HandshakeError::ShuttingDown);
        }
        if client_hello.version != Version::CURRENT {
            return Err(HandshakeError::VersionMismatch {
                ours: Version::CURRENT,
                theirs: client_hello.version,
            });
        }

        let target = if client_hello.session_id.is_empty() {
            let session = Arc::new(Session::new(
                generate_session_id(),
                Arc::clone(&self.transceiver),
                shared.config.session.clone(),
                Arc::clone(&shared.watchers),
            ));
            self.created = Some(Arc::clone(&session));
            session.set_state(SessionState::Handshake)?;
            Target::New(session)
        } else {
            Target::Resume(self.find(&client_hello.session_id)?)
        };

        let server_hello = Hello {
            version: Version::CURRENT,
            session_id: target.session().id().to_string(),
            random: random_bytes(RANDOM_SIZE),
            cipher_suite: negotiate_suite(settings, &client_hello.cipher_suite),
            compression: if settings.agree_client_compression {
                client_hello.compression
            } else {
                settings.compression
            },
        };
        let encrypted = server_hello.cipher_suite.is_encrypted();
        let authenticate = shared.auth.required();

        let mut flags = Flags::HELLO_DONE;
        if encrypted {
            flags = flags.with(Flags::ENCRYPTION);
        }
        if authenticate {
            flags = flags.with(Flags::AUTH);
        }
        if matches!(target, Target::Resume(_)) {
            flags = flags.with(Flags::CONTINUE);
        }
        tracing::debug!(
            session = %target.session().id(),
            suite = ?server_hello.cipher_suite,
            compression = ?server_hello.compression,
            "hello accepted"
        );
        self.transceiver
            .send(flags, &Msg::Hello(server_hello.clone()))
            .await?;
        install_compression(
            &self.transceiver,
            server_hello.compression,
            shared.config.session.compression_threshold,
        )
        .await?;

        let mut finished = Flags::NONE;
        if encrypted {
            self.exchange_keys(&client_hello, &server_hello).await?;
            finished = finished.with(Flags::ENCRYPT_OK);
        }

        let resuming = match &target {
            Target::Resume(session) => Some(session.as_ref()),
            Target::New(_) => None,
        };
        let (token, user_id) = if authenticate {
            finished = finished.with(Flags::AUTH_OK);
            self.authenticate(resuming).await?
        } else {
            (String::new(), UserId::default())
        };

        match target {
            Target::New(session) => {
                session.confirm(token, user_id)?;
                shared.sessions.insert(Arc::clone(&session))?;
                let (send_seq, recv_seq) = self.transceiver.sequences().await;
                self.transceiver
                    .send(finished, &Msg::Finished(Finished { send_seq, recv_seq }))
                    .await?;
                Ok(Outcome::Created(session))
            }
            Target::Resume(session) => {
                // Synchronization is checked by the renewal itself, under
                // the session's send lock.
                let (_, request) = expect::<C, Continue>(&self.transceiver).await?;
                Ok(Outcome::Resume {
                    session,
                    remote_recv_seq: request.recv_seq,
                    flags: finished.with(Flags::CONTINUE_OK),
                })
            }
        }
    }

    fn find(&self, id: &str) -> Result<Arc<Session<C>>, HandshakeError> {
        match self.shared.sessions.get(&SessionId::from(id)) {
            Some(session) if !session.is_closed() => Ok(session),
            _ => Err(HandshakeError::SessionNotFound(id.to_string())),
        }
    }

    async fn exchange_keys(&self, client_hello: &Hello, server_hello: &Hello) -> Result<(), HandshakeError> {
        let settings = &self.shared.config.handshake;
        let suite = &server_hello.cipher_suite;
        let secret = EphemeralKey::generate(settings.named_curve)?;
        let public_key = Bytes::from(secret.public_key());

        let mut params = EcdheKeyExchange {
            named_curve: settings.named_curve,
            public_key: public_key.clone(),
            iv: random_bytes(suite.iv_size()),
            nonce: random_bytes(suite.nonce_size()),
            nonce_step: if suite.is_aead() {
                Bytes::copy_from_slice(&settings.nonce_step.to_be_bytes())
            } else {
                Bytes::new()
            },
            signature_algorithm: SignatureAlgorithm::None,
            signature: Bytes::new(),
        };
        if let Some(private_key) = &settings.signing_key {
            let data = signed_params(client_hello, server_hello, params.named_curve, &public_key);
            params.signature = sign(settings.signature_algorithm, private_key, &data)?.into();
            params.signature_algorithm = settings.signature_algorithm;
        }
        self.transceiver
            .send(Flags::NONE, &Msg::KeyExchange(params.clone()))
            .await?;

        let (_, reply) = expect::<C, EcdheKeyExchange>(&self.transceiver).await?;
        if reply.named_curve != params.named_curve {
            return Err(HandshakeError::EncryptFailed(format!(
                "client answered on {:?}, expected {:?}",
                reply.named_curve, params.named_curve
            )));
        }
        let shared_secret = secret.agree(&reply.public_key)?;
        let keys = derive_session_keys(&shared_secret, &client_hello.random, &server_hello.random)?;
        install_cipher(&self.transceiver, Side::Server, suite, &keys, &params).await?;

        let expected = transcript(client_hello, server_hello);
        self.transceiver
            .send(
                Flags::NONE,
                &Msg::ChangeCipherSpec(ChangeCipherSpec {
                    encrypted_hello: expected.clone(),
                }),
            )
            .await?;
        let (_, confirm) = expect::<C, ChangeCipherSpec>(&self.transceiver).await?;
        if confirm.encrypted_hello != expected {
            return Err(HandshakeError::EncryptFailed(
                "cipher spec does not match the hellos".into(),
            ));
        }
        Ok(())
    }

    /// Reads `Auth` and runs the authenticator. A resuming client must
    /// present the token its session was confirmed with.
    async fn authenticate(&self, resuming: Option<&Session<C>>) -> Result<(String, UserId), HandshakeError> {
        let (_, auth) = expect::<C, Auth>(&self.transceiver).await?;
        if let Some(session) = resuming {
            if session.token() != Some(auth.token.as_str()) {
                return Err(HandshakeError::AuthFailed(
                    "token does not match the session".into(),
                ));
            }
        }
        let user_id = self
            .shared
            .auth
            .authenticate(&auth.token, &auth.extensions)
            .await
            .map_err(|e| match e {
                SessionError::AuthFailed(reason) => HandshakeError::AuthFailed(reason),
                other => HandshakeError::AuthFailed(other.to_string()),
            })?;
        if let Some(session) = resuming {
            if session.user_id().is_some_and(|known| *known != user_id) {
                return Err(HandshakeError::AuthFailed("user changed".into()));
            }
        }
        Ok((auth.token, user_id))
    }

    /// Moves `session` onto this connection, writing `Finished` ahead of
    /// the frames the client missed. A resume that falls through here
    /// still answers the client with `Rst`.
    async fn resume(
        mut self,
        session: Arc<Session<C>>,
        remote_recv_seq: u32,
        flags: Flags,
    ) -> Result<Arc<Session<C>>, HandshakeError> {
        let transceiver = match Arc::try_unwrap(self.transceiver) {
            Ok(transceiver) => transceiver,
            Err(still_shared) => {
                self.transceiver = still_shared;
                let err = HandshakeError::ContinueFailed("handshake connection still in use".into());
                self.fail(&err).await;
                return Err(err);
            }
        };
        let renewed = session
            .transceiver()
            .renew_with_preface(transceiver.into_renewal(), remote_recv_seq, move |send_seq, recv_seq| {
                (flags, Msg::Finished(Finished { send_seq, recv_seq }))
            })
            .await;
        if let Err(refused) = renewed {
            let err = HandshakeError::ContinueFailed(refused.error.to_string());
            let conn = refused.renewal.conn.id();
            tracing::info!(%conn, session = %session.id(), error = %err, "handshake failed");
            let io_timeout = session.transceiver().io_timeout();
            if let Err(e) = refused.renewal.refuse(err.rst_code(), err.to_string(), io_timeout).await {
                tracing::debug!(%conn, error = %e, "handshake reset not delivered");
            }
            return Err(err);
        }
        tracing::info!(session = %session.id(), remote_recv_seq, "session resumed");
        Ok(session)
    }

    async fn fail(self, err: &HandshakeError) {
        let conn = self.transceiver.conn().id();
        tracing::info!(%conn, error = %err, "handshake failed");
        if err.should_reset() {
            if let Err(e) = self.transceiver.send_rst(err.rst_code(), err.to_string()).await {
                tracing::debug!(%conn, error = %e, "handshake reset not delivered");
            }
        }
        match self.created {
            Some(session) => {
                self.shared.sessions.remove(session.id());
                session.death().await;
            }
            None => {
                let _ = self.transceiver.close().await;
            }
        }
    }
}

fn negotiate_suite(settings: &HandshakeConfig, proposed: &CipherSuite) -> CipherSuite {
    if settings.agree_client_cipher_suite && proposed.validate().is_ok() {
        *proposed
    } else {
        settings.cipher_suite
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arcgate_protocol::{BlockCipherMode, MacHash, PaddingMode, SymmetricEncryption};

    #[test]
    fn test_negotiation_prefers_valid_client_suite() {
        let settings = HandshakeConfig::default();
        let proposed = CipherSuite::chacha20_poly1305();
        assert_eq!(negotiate_suite(&settings, &proposed), proposed);
    }

    #[test]
    fn test_negotiation_falls_back_on_invalid_suite() {
        let settings = HandshakeConfig {
            cipher_suite: CipherSuite::aes(BlockCipherMode::Ctr, PaddingMode::None, MacHash::Sha256),
            ..HandshakeConfig::default()
        };
        let broken = CipherSuite {
            symmetric_encryption: SymmetricEncryption::Aes,
            ..CipherSuite::plain()
        };
        assert_eq!(negotiate_suite(&settings, &broken), settings.cipher_suite);
    }

    #[test]
    fn test_negotiation_can_ignore_client() {
        let settings = HandshakeConfig {
            agree_client_cipher_suite: false,
            ..HandshakeConfig::default()
        };
        assert_eq!(
            negotiate_suite(&settings, &CipherSuite::chacha20_poly1305()),
            CipherSuite::plain()
        );
    }
}
