//! Assembles the event handler chain shared by the gateway and client
//! builders.

use std::sync::Arc;

use arcgate_protocol::Event;
use arcgate_session::{
    BoxError, ControlProtocol, EventDispatcher, EventForwarder, EventHandler, Session,
    TransProtocol,
};
use arcgate_transport::Conn;
use bytes::Bytes;

pub(crate) struct ChainBuilder<C: Conn> {
    trans: TransProtocol<C>,
    control: ControlProtocol<C>,
    handlers: Vec<Arc<dyn EventHandler<C>>>,
    forwarder: EventForwarder<C>,
    replacement: Option<EventDispatcher<C>>,
}

impl<C: Conn> ChainBuilder<C> {
    pub(crate) fn new() -> Self {
        Self {
            trans: TransProtocol::new(),
            control: ControlProtocol::new(),
            handlers: Vec::new(),
            forwarder: EventForwarder::new(),
            replacement: None,
        }
    }

    pub(crate) fn on_data<F>(&mut self, f: F)
    where
        F: Fn(&Session<C>, Bytes) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.trans = std::mem::take(&mut self.trans).on_data(f);
    }

    pub(crate) fn on_event<F>(&mut self, f: F)
    where
        F: Fn(&Session<C>, Event) + Send + Sync + 'static,
    {
        self.forwarder = std::mem::take(&mut self.forwarder).on_event(f);
    }

    pub(crate) fn control(&mut self, control: ControlProtocol<C>) {
        self.control = control;
    }

    pub(crate) fn handler(&mut self, handler: impl EventHandler<C>) {
        self.handlers.push(Arc::new(handler));
    }

    pub(crate) fn replace(&mut self, dispatcher: EventDispatcher<C>) {
        self.replacement = Some(dispatcher);
    }

    /// Trans → control → application handlers → forwarder, unless a
    /// whole dispatcher was supplied.
    pub(crate) fn build(self) -> EventDispatcher<C> {
        if let Some(dispatcher) = self.replacement {
            return dispatcher;
        }
        let chain = EventDispatcher::new().with(self.trans).with(self.control);
        self.handlers
            .into_iter()
            .fold(chain, EventDispatcher::with_shared)
            .with(self.forwarder)
    }
}
