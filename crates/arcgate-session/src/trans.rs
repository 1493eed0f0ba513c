//! The trans protocol: application payload delivery.

use std::sync::Arc;

use arcgate_protocol::{Event, Msg};
use arcgate_transport::Conn;
use bytes::Bytes;

use crate::{BoxError, EventHandler, Flow, Session, SessionError};

/// Called with every received `Payload` body.
pub type DataHandler<C> = Arc<dyn Fn(&Session<C>, Bytes) -> Result<(), BoxError> + Send + Sync>;

/// Delivers `Payload` bodies to the data handler and to the session's
/// data channel (if someone took its receiver). A full channel drops the
/// newest item with a warning.
pub struct TransProtocol<C: Conn> {
    on_data: Option<DataHandler<C>>,
}

impl<C: Conn> TransProtocol<C> {
    pub fn new() -> Self {
        Self { on_data: None }
    }

    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session<C>, Bytes) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_data = Some(Arc::new(f));
        self
    }
}

impl<C: Conn> Default for TransProtocol<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Conn> EventHandler<C> for TransProtocol<C> {
    fn handle(&self, session: &Session<C>, event: Event) -> Result<Flow, SessionError> {
        let Msg::Payload(payload) = event.msg else {
            return Ok(Flow::Pass(event));
        };
        let result = match &self.on_data {
            Some(handler) => handler(session, payload.data.clone()),
            None => Ok(()),
        };
        session.deliver_data(payload.data);
        result.map_err(|e| SessionError::Handler(e.to_string()))?;
        Ok(Flow::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use arcgate_protocol::{Decoder, Encoder, Flags, Heartbeat, MsgHead, Payload};
    use arcgate_transport::{MemoryConn, SequencedBuffer, Transceiver};

    use crate::{generate_session_id, SessionConfig};

    fn session(recv_queue_size: usize) -> Session<MemoryConn> {
        let (conn, _peer) = MemoryConn::pair();
        let transceiver = Transceiver::new(
            conn,
            Encoder::new(),
            Decoder::default(),
            SequencedBuffer::new(1024),
            Duration::from_millis(50),
        );
        Session::new(
            generate_session_id(),
            Arc::new(transceiver),
            SessionConfig {
                recv_queue_size,
                ..SessionConfig::default()
            },
            Arc::from(Vec::new()),
        )
    }

    fn payload(data: &'static [u8]) -> Event {
        let msg = Msg::Payload(Payload {
            data: Bytes::from_static(data),
        });
        Event {
            head: MsgHead::new(msg.id(), Flags::SEQUENCED),
            msg,
        }
    }

    #[tokio::test]
    async fn test_payload_reaches_handler_and_channel() {
        let session = session(4);
        let mut rx = session.take_data_receiver().unwrap();
        let trans = TransProtocol::new().on_data(|session, data| {
            assert_eq!(data, Bytes::from_static(b"hi"));
            session.send_data(data)?;
            Ok(())
        });
        let flow = trans.handle(&session, payload(b"hi")).unwrap();
        assert!(matches!(flow, Flow::Handled));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn test_full_channel_drops_newest() {
        let session = session(1);
        let mut rx = session.take_data_receiver().unwrap();
        let trans = TransProtocol::new();
        trans.handle(&session, payload(b"first")).unwrap();
        trans.handle(&session, payload(b"second")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"first"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_error_is_recoverable() {
        let session = session(4);
        let trans = TransProtocol::new().on_data(|_, _| Err("bad payload".into()));
        let err = trans.handle(&session, payload(b"x")).unwrap_err();
        assert!(err.recoverable());
    }

    #[tokio::test]
    async fn test_other_messages_pass() {
        let session = session(4);
        let event = Event {
            head: MsgHead::new(Msg::Heartbeat(Heartbeat).id(), Flags::PING),
            msg: Msg::Heartbeat(Heartbeat),
        };
        assert!(matches!(
            TransProtocol::new().handle(&session, event).unwrap(),
            Flow::Pass(_)
        ));
    }
}
