//! Event dispatch: receive one event, offer it to each handler in order.
//!
//! Handlers are synchronous and decide with a [`Flow`]: consume the
//! event, consume it and reply, or pass it on. Replies are written by
//! the dispatcher so handlers never touch the connection. The usual
//! order is [`TransProtocol`](crate::TransProtocol) →
//! [`ControlProtocol`](crate::ControlProtocol) → application handlers →
//! [`EventForwarder`]; an event that falls off the end is a routing
//! error.

use std::sync::Arc;

use arcgate_protocol::{Event, Flags, Msg};
use arcgate_transport::Conn;

use crate::{ControlProtocol, Session, SessionError, TransProtocol};

/// What a handler did with an event.
#[derive(Debug)]
pub enum Flow {
    /// Consumed.
    Handled,
    /// Consumed; send this back to the peer.
    Reply(Flags, Msg),
    /// Not mine; offer it to the next handler.
    Pass(Event),
}

/// One step in the dispatch chain.
pub trait EventHandler<C: Conn>: Send + Sync + 'static {
    fn handle(&self, session: &Session<C>, event: Event) -> Result<Flow, SessionError>;
}

/// Ordered handler chain shared by every session of a gateway.
pub struct EventDispatcher<C: Conn> {
    handlers: Vec<Arc<dyn EventHandler<C>>>,
}

impl<C: Conn> EventDispatcher<C> {
    /// An empty chain. Every event is a routing error until handlers are
    /// added.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Appends a handler.
    pub fn with(mut self, handler: impl EventHandler<C>) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Appends an already shared handler.
    pub fn with_shared(mut self, handler: Arc<dyn EventHandler<C>>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Receives one event and routes it.
    ///
    /// Read timeouts are retried up to `io_retry_times`; the next one is
    /// returned to the caller.
    pub async fn dispatch_once(&self, session: &Session<C>) -> Result<(), SessionError> {
        let retries = session.config().io_retry_times;
        let mut attempt = 0;
        let event = loop {
            match session.transceiver().recv().await {
                Ok(event) => break event,
                Err(e) if e.is_timeout() && attempt < retries => {
                    attempt += 1;
                    tracing::trace!(session = %session.id(), attempt, "receive timed out, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.route(session, event).await
    }

    /// Offers `event` to each handler until one takes it.
    pub async fn route(&self, session: &Session<C>, event: Event) -> Result<(), SessionError> {
        let mut event = event;
        for handler in &self.handlers {
            match handler.handle(session, event)? {
                Flow::Handled => return Ok(()),
                Flow::Reply(flags, msg) => {
                    session.transceiver().send(flags, &msg).await?;
                    return Ok(());
                }
                Flow::Pass(unhandled) => event = unhandled,
            }
        }
        Err(SessionError::NoHandler(event.msg.id()))
    }
}

impl<C: Conn> Default for EventDispatcher<C> {
    /// Trans, control and a forwarder, with no callbacks.
    fn default() -> Self {
        Self::new()
            .with(TransProtocol::new())
            .with(ControlProtocol::new())
            .with(EventForwarder::new())
    }
}

type EventCallback<C> = Arc<dyn Fn(&Session<C>, Event) + Send + Sync>;

/// Last link of the chain: hands leftover events to the application,
/// through a callback if set, otherwise through the session's event
/// channel once someone listens.
pub struct EventForwarder<C: Conn> {
    callback: Option<EventCallback<C>>,
}

impl<C: Conn> EventForwarder<C> {
    pub fn new() -> Self {
        Self { callback: None }
    }

    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session<C>, Event) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(f));
        self
    }
}

impl<C: Conn> Default for EventForwarder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Conn> EventHandler<C> for EventForwarder<C> {
    fn handle(&self, session: &Session<C>, event: Event) -> Result<Flow, SessionError> {
        if let Some(callback) = &self.callback {
            callback(session, event);
            return Ok(Flow::Handled);
        }
        if session.listens_for_events() {
            session.deliver_event(event);
            return Ok(Flow::Handled);
        }
        Ok(Flow::Pass(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use arcgate_protocol::{Auth, Decoder, Encoder, MsgHead, MsgId, Payload};
    use arcgate_transport::{MemoryConn, SequencedBuffer, Transceiver};
    use bytes::Bytes;

    use crate::{generate_session_id, SessionConfig};

    fn session() -> (Session<MemoryConn>, Transceiver<MemoryConn>) {
        let (conn, peer) = MemoryConn::pair();
        let make = |conn| {
            Transceiver::new(
                conn,
                Encoder::new(),
                Decoder::default(),
                SequencedBuffer::new(64 * 1024),
                Duration::from_millis(50),
            )
        };
        let session = Session::new(
            generate_session_id(),
            Arc::new(make(conn)),
            SessionConfig {
                io_retry_times: 2,
                ..SessionConfig::default()
            },
            Arc::from(Vec::new()),
        );
        (session, make(peer))
    }

    fn event(msg: Msg) -> Event {
        Event {
            head: MsgHead::new(msg.id(), Flags::NONE),
            msg,
        }
    }

    struct Counting(Arc<AtomicUsize>);

    impl EventHandler<MemoryConn> for Counting {
        fn handle(&self, _: &Session<MemoryConn>, event: Event) -> Result<Flow, SessionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Flow::Pass(event))
        }
    }

    #[tokio::test]
    async fn test_route_unhandled_is_no_handler() {
        let (session, _peer) = session();
        let dispatcher = EventDispatcher::new();
        let err = dispatcher
            .route(&session, event(Msg::Auth(Auth::default())))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NoHandler(MsgId::AUTH)));
    }

    #[tokio::test]
    async fn test_route_passes_in_order() {
        let (session, _peer) = session();
        let seen = Arc::new(AtomicUsize::new(0));
        let dispatcher = EventDispatcher::new()
            .with(Counting(Arc::clone(&seen)))
            .with(Counting(Arc::clone(&seen)))
            .with(EventForwarder::new().on_event(|_, _| {}));
        dispatcher
            .route(&session, event(Msg::Auth(Auth::default())))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_forwarder_uses_event_channel() {
        let (session, _peer) = session();
        let dispatcher = EventDispatcher::default();
        let mut events = session.take_event_receiver().unwrap();
        dispatcher
            .route(&session, event(Msg::Auth(Auth::default())))
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap().msg.id(), MsgId::AUTH);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_once_retries_timeouts() {
        let (session, peer) = session();
        let dispatcher = EventDispatcher::default();
        let mut data = session.take_data_receiver().unwrap();

        let sender = tokio::spawn(async move {
            // Two timeouts of 50ms pass before this arrives.
            tokio::time::sleep(Duration::from_millis(120)).await;
            let msg = Msg::Payload(Payload {
                data: Bytes::from_static(b"late"),
            });
            peer.send(Flags::SEQUENCED, &msg).await.unwrap();
            peer
        });
        dispatcher.dispatch_once(&session).await.unwrap();
        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(b"late"));
        let _peer = sender.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_once_reports_timeout_after_retries() {
        let (session, _peer) = session();
        let dispatcher = EventDispatcher::default();
        let err = dispatcher.dispatch_once(&session).await.unwrap_err();
        assert!(err.is_timeout());
    }
}
