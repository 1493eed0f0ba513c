//! Transport layer for Arcgate.
//!
//! Provides the [`Conn`] and [`Transport`] traits that abstract over
//! byte-stream connections (TCP, WebSocket, in-memory), and the two
//! pieces that make a session survive reconnects on top of them:
//!
//! - [`SequencedBuffer`]: retains sent sequenced frames until the peer
//!   acknowledges them, and replays the rest on a new connection.
//! - [`Transceiver`]: the single send/receive point of a session, able
//!   to swap its underlying connection without losing frames.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
mod memory;
mod sequenced;
mod tcp;
mod transceiver;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryConn, MemoryConnector, MemoryTransport};
pub use sequenced::{
    seq_before, SequenceCounters, SequencedBuffer, Validation, DEFAULT_BUFFER_CAPACITY,
};
pub use tcp::{TcpConn, TcpTransport};
pub use transceiver::{Refused, Renewal, Transceiver};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConn, WebSocketTransport};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-wide unique id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
pub trait Transport: Send + 'static {
    /// The connection type produced by this transport.
    type Conn: Conn;

    /// Waits for and accepts the next incoming connection.
    fn accept(&mut self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;

    /// Address the transport listens on, if it has one.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A bidirectional byte stream.
///
/// Reads and writes may be partial, like their `std::io` namesakes.
/// Reads and writes are independent: one task may block in `read`
/// while another writes. The futures are `Send` so sessions generic
/// over the connection type can run on the multi-threaded runtime.
pub trait Conn: Send + Sync + 'static {
    /// Reads into `buf`, returning how many bytes arrived. `Ok(0)`
    /// means the peer closed the stream.
    fn read(&self, buf: &mut [u8])
        -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Writes a prefix of `data`, returning its length.
    fn write(&self, data: &[u8]) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Writes all of `data`.
    fn write_all(&self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send {
        async move {
            let mut rest = data;
            while !rest.is_empty() {
                let n = self.write(rest).await?;
                if n == 0 {
                    return Err(TransportError::SendFailed(std::io::ErrorKind::WriteZero.into()));
                }
                rest = &rest[n..];
            }
            Ok(())
        }
    }

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Remote address, when the transport has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}
