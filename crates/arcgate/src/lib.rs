//! # Arcgate
//!
//! A session gateway for real-time game clients.
//!
//! Arcgate keeps a logical session alive across connection drops: frames
//! are sequenced and acknowledged, a dropped connection leaves the
//! session `Inactive` for a while, and a client that reconnects picks up
//! where it left off with every unacknowledged frame replayed. Sessions
//! are negotiated with an optional ECDHE key exchange, symmetric
//! encryption, MAC and compression.
//!
//! The layers, bottom up:
//!
//! - `arcgate-protocol`: wire format, messages and crypto modules
//! - `arcgate-transport`: connections, the sequenced replay buffer and
//!   the [`Transceiver`](arcgate_transport::Transceiver)
//! - `arcgate-session`: session state, event dispatch and the main loop
//! - this crate: the handshake, the [`Gateway`] and the [`Client`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use arcgate::prelude::*;
//!
//! # async fn start() -> Result<(), ArcgateError> {
//! let transport = WebSocketTransport::bind("0.0.0.0:8080").await?;
//! let gateway = Gateway::builder()
//!     .on_data(|session, data| {
//!         tracing::info!(session = %session.id(), len = data.len(), "payload");
//!         Ok(())
//!     })
//!     .build(NoAuth);
//! gateway.serve(transport).await
//! # }
//! ```

mod chain;
mod client;
mod config;
mod error;
mod handshake;
mod server;
pub mod telemetry;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, GatewayConfig, HandshakeConfig};
pub use error::{ArcgateError, HandshakeError};
pub use server::{Gateway, GatewayBuilder};

pub use arcgate_protocol as protocol;
pub use arcgate_session as session;
pub use arcgate_transport as transport;

/// Everything most applications need.
pub mod prelude {
    pub use crate::{
        ArcgateError, Client, ClientBuilder, ClientConfig, Gateway, GatewayBuilder, GatewayConfig,
        HandshakeConfig, HandshakeError,
    };
    pub use arcgate_protocol::{
        CipherSuite, Code, Compression, Event, Flags, Msg, MsgId, NamedCurve, SignatureAlgorithm,
    };
    pub use arcgate_session::{
        state_watcher, Authenticator, CloseReason, ControlProtocol, EventDispatcher,
        EventForwarder, EventHandler, Flow, NoAuth, Session, SessionConfig, SessionError,
        SessionId, SessionState, StateWatcher, TransProtocol, UserId,
    };
    pub use arcgate_transport::{
        Conn, MemoryConn, MemoryTransport, TcpConn, TcpTransport, Transport, WebSocketConn,
        WebSocketTransport,
    };
}
