//! Raw TCP transport.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;

use crate::{Conn, ConnectionId, Transport, TransportError};

/// A TCP-based [`Transport`] that listens for incoming connections.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener })
    }
}

impl Transport for TcpTransport {
    type Conn = TcpConn;

    async fn accept(&mut self) -> Result<TcpConn, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        let conn = TcpConn::from_stream(stream)?;
        tracing::debug!(id = %conn.id(), %addr, "accepted TCP connection");
        Ok(conn)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// A single TCP connection.
///
/// The stream is split so a pending read never blocks a write.
pub struct TcpConn {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpConn {
    /// Dials `addr`.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(TransportError::SendFailed)?;
        Self::from_stream(stream)
    }

    /// Wraps an established stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self, TransportError> {
        // Frames are small and latency-sensitive.
        stream.set_nodelay(true).map_err(TransportError::AcceptFailed)?;
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            id: ConnectionId::next(),
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

impl Conn for TcpConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.reader
            .lock()
            .await
            .read(buf)
            .await
            .map_err(TransportError::ReceiveFailed)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        self.writer
            .lock()
            .await
            .write(data)
            .await
            .map_err(TransportError::SendFailed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
