//! Session establishment.
//!
//! Every connection starts with a handshake. Messages are unsequenced
//! until `Finished`, so none of them is retained for replay.
//!
//! ```text
//!   client                                     server
//!   Hello{session_id?, random, suite} ───────→
//!                                      ←─────── Hello{session_id, random, suite}
//!                                               HELLO_DONE [ENCRYPTION] [AUTH] [CONTINUE]
//!   ┌ ENCRYPTION ─────────────────────────────────────────────────────────┐
//!   │                                  ←─────── KeyExchange{pub, iv, nonce, sig}
//!   │ KeyExchange{pub} ───────────────→                                   │
//!   │              (both sides install ciphers derived with HKDF)         │
//!   │                                  ←─────── ChangeCipherSpec{transcript}
//!   │ ChangeCipherSpec{transcript} ───→                                   │
//!   └─────────────────────────────────────────────────────────────────────┘
//!   [AUTH]     Auth{token, extensions} ───────→
//!   [CONTINUE] Continue{send_seq, recv_seq} ──→
//!                                      ←─────── Finished{send_seq, recv_seq}
//!                                               [ENCRYPT_OK] [AUTH_OK] [CONTINUE_OK]
//! ```
//!
//! A failure on either side is answered with an `Rst` whose code names
//! the failed step.

pub(crate) mod client;
pub(crate) mod server;

use arcgate_protocol::{
    CipherSuite, Compression, CompressionModule, Direction, EcdheKeyExchange, EncryptionModule,
    Flags, Hello, MacHash, MacModule, Msg, NamedCurve, NonceCounter, NonceSupply, SessionKeys,
    WireMsg,
};
use arcgate_transport::{Conn, Transceiver};
use bytes::{Bytes, BytesMut};
use rand::RngCore;

use crate::HandshakeError;

/// Size of the `random` carried by each `Hello`.
pub(crate) const RANDOM_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

pub(crate) fn random_bytes(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// Receives the next message, which must be a `T`.
///
/// Read timeouts are retried; the caller bounds the whole handshake.
pub(crate) async fn expect<C, T>(transceiver: &Transceiver<C>) -> Result<(Flags, T), HandshakeError>
where
    C: Conn,
    T: WireMsg + TryFrom<Msg, Error = Msg>,
{
    let event = loop {
        match transceiver.recv().await {
            Ok(event) => break event,
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e.into()),
        }
    };
    let flags = event.flags();
    match event.msg {
        Msg::Rst(rst) => Err(HandshakeError::Rejected {
            code: rst.code,
            message: rst.message,
        }),
        msg => T::try_from(msg)
            .map(|msg| (flags, msg))
            .map_err(|other| HandshakeError::Unexpected {
                expected: T::ID,
                received: other.id(),
            }),
    }
}

/// Installs the negotiated compression on both halves of the codec.
pub(crate) async fn install_compression<C: Conn>(
    transceiver: &Transceiver<C>,
    compression: Compression,
    threshold: usize,
) -> Result<(), HandshakeError> {
    if compression == Compression::None {
        return Ok(());
    }
    let module = CompressionModule::new(compression)?;
    let inflate = module.clone();
    transceiver
        .configure_encoder(|encoder| encoder.set_compression(Some(module), threshold))
        .await;
    transceiver
        .configure_decoder(|decoder| decoder.set_compression(Some(inflate)))
        .await;
    Ok(())
}

/// Installs ciphers (and the MAC, if the suite has one) keyed for `side`.
///
/// `params` is the server's key exchange: it carries the IV and the
/// nonce counter both directions start from.
pub(crate) async fn install_cipher<C: Conn>(
    transceiver: &Transceiver<C>,
    side: Side,
    suite: &CipherSuite,
    keys: &SessionKeys,
    params: &EcdheKeyExchange,
) -> Result<(), HandshakeError> {
    let (write, read) = match side {
        Side::Client => (&keys.client_write, &keys.server_write),
        Side::Server => (&keys.server_write, &keys.client_write),
    };
    let nonce = || -> Result<Option<NonceSupply>, HandshakeError> {
        if !suite.is_aead() {
            return Ok(None);
        }
        let counter = NonceCounter::new(&params.nonce, &params.nonce_step)?;
        Ok(Some(NonceSupply::Counter(counter)))
    };
    let encrypt = EncryptionModule::new(suite, write, &params.iv, nonce()?, Direction::Encrypt)?;
    let decrypt = EncryptionModule::new(suite, read, &params.iv, nonce()?, Direction::Decrypt)?;
    let mac = match suite.mac_hash {
        MacHash::None => None,
        hash => Some(MacModule::new(hash, &keys.mac_secret)?),
    };
    let verify = mac.clone();

    transceiver
        .configure_encoder(|encoder| {
            encoder.set_encryption(Some(encrypt));
            encoder.set_mac(mac);
        })
        .await;
    transceiver
        .configure_decoder(|decoder| {
            decoder.set_encryption(Some(decrypt));
            decoder.set_mac(verify);
        })
        .await;
    Ok(())
}

/// The bytes the server signs in its key exchange.
///
/// Binds the negotiated suite, both randoms, the session and the
/// ephemeral public key, so none can be swapped in transit.
pub(crate) fn signed_params(
    client_hello: &Hello,
    server_hello: &Hello,
    curve: NamedCurve,
    public_key: &[u8],
) -> Bytes {
    let mut buf = BytesMut::new();
    server_hello.cipher_suite.write(&mut buf);
    buf.extend_from_slice(&[server_hello.compression as u8, curve as u8]);
    buf.extend_from_slice(&client_hello.random);
    buf.extend_from_slice(&server_hello.random);
    buf.extend_from_slice(server_hello.session_id.as_bytes());
    buf.extend_from_slice(public_key);
    buf.freeze()
}

/// Both `Hello` bodies, which each side echoes under the new cipher to
/// prove it derived the same keys.
pub(crate) fn transcript(client_hello: &Hello, server_hello: &Hello) -> Bytes {
    let mut buf = BytesMut::new();
    client_hello.write(&mut buf);
    server_hello.write(&mut buf);
    buf.freeze()
}

/// Checks a `Finished` carries the flag for every negotiated step.
pub(crate) fn check_finished(hello_flags: Flags, finished_flags: Flags) -> Result<(), HandshakeError> {
    let required = [
        (Flags::ENCRYPTION, Flags::ENCRYPT_OK, "ENCRYPT_OK"),
        (Flags::AUTH, Flags::AUTH_OK, "AUTH_OK"),
        (Flags::CONTINUE, Flags::CONTINUE_OK, "CONTINUE_OK"),
    ];
    for (asked, confirmed, name) in required {
        if hello_flags.contains(asked) && !finished_flags.contains(confirmed) {
            return Err(HandshakeError::MissingFlag(name));
        }
    }
    Ok(())
}
