//! The client's side of the handshake.

use arcgate_protocol::{
    derive_session_keys, verify, Auth, ChangeCipherSpec, Continue, EcdheKeyExchange,
    EphemeralKey, Finished, Flags, Hello, Msg, SignatureAlgorithm, Version,
};
use arcgate_session::SessionId;
use arcgate_transport::{Conn, Transceiver};
use bytes::Bytes;

use super::{
    check_finished, expect, install_cipher, install_compression, random_bytes, signed_params,
    transcript, Side, RANDOM_SIZE,
};
use crate::config::{ClientConfig, HandshakeConfig};
use crate::HandshakeError;

/// Where an existing session stands, for continuing it.
#[derive(Debug, Clone)]
pub(crate) struct Resume {
    pub(crate) session_id: SessionId,
    pub(crate) send_seq: u32,
    pub(crate) recv_seq: u32,
}

#[derive(Debug)]
pub(crate) struct Established {
    pub(crate) session_id: SessionId,
    /// The server's sequences, for replaying what it missed.
    pub(crate) finished: Finished,
}

/// Runs the handshake over `transceiver`, which must be fresh.
///
/// On failure the server gets a best-effort `Rst`; closing the
/// connection is left to the caller.
pub(crate) async fn connect<C: Conn>(
    transceiver: &Transceiver<C>,
    config: &ClientConfig,
    resume: Option<&Resume>,
) -> Result<Established, HandshakeError> {
    let result = tokio::time::timeout(config.handshake.timeout(), run(transceiver, config, resume))
        .await
        .unwrap_or(Err(HandshakeError::Timeout));
    if let Err(e) = &result {
        tracing::info!(error = %e, resuming = resume.is_some(), "handshake failed");
        if e.should_reset() {
            if let Err(reset) = transceiver.send_rst(e.rst_code(), e.to_string()).await {
                tracing::debug!(error = %reset, "handshake reset not delivered");
            }
        }
    }
    result
}

async fn run<C: Conn>(
    transceiver: &Transceiver<C>,
    config: &ClientConfig,
    resume: Option<&Resume>,
) -> Result<Established, HandshakeError> {
    let settings = &config.handshake;
    let client_hello = Hello {
        version: Version::CURRENT,
        session_id: resume
            .map(|r| r.session_id.to_string())
            .unwrap_or_default(),
        random: random_bytes(RANDOM_SIZE),
        cipher_suite: settings.cipher_suite,
        compression: settings.compression,
    };
    transceiver
        .send(Flags::NONE, &Msg::Hello(client_hello.clone()))
        .await?;

    let (flags, server_hello) = expect::<C, Hello>(transceiver).await?;
    if !flags.contains(Flags::HELLO_DONE) {
        return Err(HandshakeError::MissingFlag("HELLO_DONE"));
    }
    if server_hello.version != Version::CURRENT {
        return Err(HandshakeError::VersionMismatch {
            ours: Version::CURRENT,
            theirs: server_hello.version,
        });
    }
    server_hello.cipher_suite.validate()?;
    if flags.contains(Flags::ENCRYPTION) != server_hello.cipher_suite.is_encrypted() {
        return Err(HandshakeError::EncryptFailed(
            "ENCRYPTION flag disagrees with the cipher suite".into(),
        ));
    }
    match resume {
        Some(resume) => {
            if !flags.contains(Flags::CONTINUE) {
                return Err(HandshakeError::MissingFlag("CONTINUE"));
            }
            if server_hello.session_id != resume.session_id.as_str() {
                return Err(HandshakeError::ContinueFailed(
                    "server answered for another session".into(),
                ));
            }
        }
        None if flags.contains(Flags::CONTINUE) => {
            return Err(HandshakeError::ContinueFailed("continue not requested".into()));
        }
        None => {}
    }
    install_compression(
        transceiver,
        server_hello.compression,
        config.session.compression_threshold,
    )
    .await?;

    if flags.contains(Flags::ENCRYPTION) {
        exchange_keys(transceiver, settings, &client_hello, &server_hello).await?;
    }
    if flags.contains(Flags::AUTH) {
        let auth = Auth {
            token: config.token.clone(),
            extensions: Bytes::from(config.extensions.clone()),
        };
        transceiver.send(Flags::NONE, &Msg::Auth(auth)).await?;
    }
    if let Some(resume) = resume {
        let request = Continue {
            send_seq: resume.send_seq,
            recv_seq: resume.recv_seq,
        };
        transceiver.send(Flags::NONE, &Msg::Continue(request)).await?;
    }

    let (finished_flags, finished) = expect::<C, Finished>(transceiver).await?;
    check_finished(flags, finished_flags)?;
    tracing::debug!(
        session = %server_hello.session_id,
        send_seq = finished.send_seq,
        recv_seq = finished.recv_seq,
        "handshake finished"
    );
    Ok(Established {
        session_id: SessionId(server_hello.session_id),
        finished,
    })
}

async fn exchange_keys<C: Conn>(
    transceiver: &Transceiver<C>,
    settings: &HandshakeConfig,
    client_hello: &Hello,
    server_hello: &Hello,
) -> Result<(), HandshakeError> {
    let suite = &server_hello.cipher_suite;
    let (_, params) = expect::<C, EcdheKeyExchange>(transceiver).await?;

    if let Some(server_key) = &settings.verify_key {
        if params.signature_algorithm == SignatureAlgorithm::None {
            return Err(HandshakeError::EncryptFailed("key exchange is not signed".into()));
        }
        let data = signed_params(client_hello, server_hello, params.named_curve, &params.public_key);
        verify(params.signature_algorithm, server_key, &data, &params.signature)?;
    }
    if params.iv.len() != suite.iv_size() || params.nonce.len() != suite.nonce_size() {
        return Err(HandshakeError::EncryptFailed(
            "key exchange parameters do not fit the suite".into(),
        ));
    }

    let secret = EphemeralKey::generate(params.named_curve)?;
    let reply = EcdheKeyExchange {
        named_curve: params.named_curve,
        public_key: Bytes::from(secret.public_key()),
        ..EcdheKeyExchange::default()
    };
    transceiver.send(Flags::NONE, &Msg::KeyExchange(reply)).await?;

    let shared_secret = secret.agree(&params.public_key)?;
    let keys = derive_session_keys(&shared_secret, &client_hello.random, &server_hello.random)?;
    install_cipher(transceiver, Side::Client, suite, &keys, &params).await?;

    let expected = transcript(client_hello, server_hello);
    let (_, confirm) = expect::<C, ChangeCipherSpec>(transceiver).await?;
    if confirm.encrypted_hello != expected {
        return Err(HandshakeError::EncryptFailed(
            "cipher spec does not match the hellos".into(),
        ));
    }
    transceiver
        .send(
            Flags::NONE,
            &Msg::ChangeCipherSpec(ChangeCipherSpec {
                encrypted_hello: expected,
            }),
        )
        .await?;
    Ok(())
}
