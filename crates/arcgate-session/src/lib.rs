//! Session management for Arcgate.
//!
//! A session is the logical, long-lived link between a client and the
//! gateway. It outlives any single connection: when a connection drops,
//! the session goes `Inactive` and waits for the client to reconnect,
//! after which unacknowledged frames are replayed.
//!
//! This crate handles:
//!
//! 1. **Authentication**: validating who a client is ([`Authenticator`])
//! 2. **Session state**: the [`SessionState`] machine and its watchers
//! 3. **Session tracking**: the concurrent [`SessionManager`] table
//! 4. **Event dispatch**: routing received events through
//!    [`TransProtocol`], [`ControlProtocol`] and application handlers
//! 5. **Lifecycle**: the per-session main loop ([`run`]), including
//!    heartbeats and the inactivity timeout
//!
//! # How it fits in the stack
//!
//! ```text
//! Gateway / Client (above)  ← handshake, accept loop, supervision
//!     ↕
//! Session Layer (this crate)  ← identity, state, dispatch loop
//!     ↕
//! Transport Layer (below)  ← Transceiver, SequencedBuffer, Conn
//! ```

mod auth;
mod config;
mod control;
mod dispatcher;
mod error;
mod lifecycle;
mod manager;
mod session;
mod trans;

pub use auth::{Authenticator, NoAuth};
pub use config::SessionConfig;
pub use control::{ControlProtocol, HeartbeatHandler, SyncTimeHandler};
pub use dispatcher::{EventDispatcher, EventForwarder, EventHandler, Flow};
pub use error::{BoxError, SessionError};
pub use lifecycle::run;
pub use manager::SessionManager;
pub use session::{
    generate_session_id, state_watcher, CloseReason, Session, SessionId, SessionState, StateWatcher,
    UserId,
};
pub use trans::{DataHandler, TransProtocol};
