//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Frames travel as binary WebSocket messages. A message boundary means
//! nothing to the decoder, so one WebSocket message may carry several
//! frames or part of one; [`WebSocketConn::read`] just hands out bytes.

use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::{Conn, ConnectionId, Transport, TransportError};

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener })
    }
}

impl Transport for WebSocketTransport {
    type Conn = WebSocketConn<tokio::net::TcpStream>;

    async fn accept(&mut self) -> Result<Self::Conn, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        let _ = stream.set_nodelay(true);

        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| {
                TransportError::AcceptFailed(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    e,
                ))
            })?;

        let conn = WebSocketConn::new(ws, Some(addr));
        tracing::debug!(id = %conn.id(), %addr, "accepted WebSocket connection");
        Ok(conn)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

struct ReadState<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: BytesMut,
}

/// A single WebSocket connection.
///
/// Generic over the underlying stream so the same type serves accepted
/// server connections and dialed client connections.
pub struct WebSocketConn<S> {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    read: Mutex<ReadState<S>>,
}

impl<S> WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an upgraded WebSocket stream.
    pub fn new(ws: WebSocketStream<S>, peer: Option<SocketAddr>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id: ConnectionId::next(),
            peer,
            sink: Mutex::new(sink),
            read: Mutex::new(ReadState {
                stream,
                pending: BytesMut::new(),
            }),
        }
    }
}

fn ws_error(kind: std::io::ErrorKind, e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    std::io::Error::new(kind, e)
}

impl<S> Conn for WebSocketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.read.lock().await;
        while state.pending.is_empty() {
            match state.stream.next().await {
                Some(Ok(Message::Binary(data))) => state.pending.extend_from_slice(&data),
                Some(Ok(Message::Text(text))) => {
                    state.pending.extend_from_slice(text.as_bytes())
                }
                Some(Ok(Message::Close(_))) | None => return Ok(0),
                Some(Ok(_)) => continue, // skip ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(ws_error(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
        let n = buf.len().min(state.pending.len());
        buf[..n].copy_from_slice(&state.pending[..n]);
        state.pending.advance(n);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let msg = Message::Binary(data.to_vec().into());
        self.sink
            .lock()
            .await
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(ws_error(std::io::ErrorKind::BrokenPipe, e)))?;
        Ok(data.len())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(ws_error(std::io::ErrorKind::BrokenPipe, e)))
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
