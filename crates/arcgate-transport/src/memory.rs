//! In-process connections over `tokio::io::duplex`.
//!
//! Used by tests and by embedders that run client and gateway in one
//! process. [`MemoryConn::limit_writes`] caps how much a single write
//! accepts, which exercises the partial-write paths of the buffer.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use crate::{Conn, ConnectionId, Transport, TransportError};

/// Default in-flight capacity of each direction of a pair.
const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// One end of an in-memory byte pipe.
pub struct MemoryConn {
    id: ConnectionId,
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
    max_write: Option<usize>,
}

impl MemoryConn {
    /// Creates two connected ends.
    pub fn pair() -> (MemoryConn, MemoryConn) {
        Self::pair_with_capacity(DEFAULT_PIPE_CAPACITY)
    }

    pub fn pair_with_capacity(capacity: usize) -> (MemoryConn, MemoryConn) {
        let (a, b) = tokio::io::duplex(capacity);
        (Self::wrap(a), Self::wrap(b))
    }

    fn wrap(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            id: ConnectionId::next(),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            max_write: None,
        }
    }

    /// Accepts at most `max` bytes per write call.
    pub fn limit_writes(mut self, max: usize) -> Self {
        self.max_write = Some(max.max(1));
        self
    }
}

impl Conn for MemoryConn {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.reader
            .lock()
            .await
            .read(buf)
            .await
            .map_err(TransportError::ReceiveFailed)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let data = match self.max_write {
            Some(max) => &data[..data.len().min(max)],
            None => data,
        };
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
}

/// A [`Transport`] whose connections come from a [`MemoryConnector`].
pub struct MemoryTransport {
    incoming: mpsc::Receiver<MemoryConn>,
}

/// Dials a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::Sender<MemoryConn>,
}

impl MemoryTransport {
    pub fn new() -> (MemoryTransport, MemoryConnector) {
        let (outgoing, incoming) = mpsc::channel(16);
        (MemoryTransport { incoming }, MemoryConnector { outgoing })
    }
}

impl MemoryConnector {
    /// Opens a connection; the other end pops out of `accept`.
    pub async fn connect(&self) -> Result<MemoryConn, TransportError> {
        let (client, server) = MemoryConn::pair();
        self.outgoing
            .send(server)
            .await
            .map_err(|_| TransportError::Shutdown)?;
        Ok(client)
    }
}

impl Transport for MemoryTransport {
    type Conn = MemoryConn;

    async fn accept(&mut self) -> Result<MemoryConn, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Shutdown)
    }
}
