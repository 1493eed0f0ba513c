use arcgate_protocol::ProtocolError;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting connections failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// A read or write did not complete within the I/O timeout.
    #[error("i/o timed out")]
    Timeout,

    /// Encoding or decoding a frame failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer sent a sequenced frame past the one we expect.
    #[error("sequence ahead: expected {expected}, received {received}")]
    SequenceAhead {
        /// Our receive sequence.
        expected: u32,
        /// Sequence carried by the frame.
        received: u32,
    },

    /// A single frame is larger than the whole sequenced buffer.
    #[error("frame of {size} bytes exceeds buffer capacity {capacity}")]
    FrameTooLarge {
        /// Frame size before sealing.
        size: usize,
        /// Configured capacity.
        capacity: usize,
    },

    /// The sequenced buffer cannot make room without dropping a frame
    /// that was already sealed for the wire.
    #[error("sequenced buffer full")]
    BufferFull,

    /// Resuming from the peer's receive sequence is impossible.
    #[error("cannot resynchronize at {remote_recv_seq}: {reason}")]
    SyncFailed {
        /// Sequence the peer expects next.
        remote_recv_seq: u32,
        /// Why the buffer cannot serve it.
        reason: &'static str,
    },

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// `true` when the connection itself failed. The session survives
    /// these and waits for the client to reconnect.
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed(_) | Self::SendFailed(_) | Self::ReceiveFailed(_)
        )
    }
}
