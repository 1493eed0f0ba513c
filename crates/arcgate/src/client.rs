//! The client end of a session.
//!
//! A [`Client`] runs the same session machinery as the gateway: its
//! session is sequenced, heartbeats while quiet, goes `Inactive` when the
//! connection drops and resumes on [`reconnect`](Client::reconnect),
//! replaying whatever the gateway missed.

use std::sync::Arc;

use arcgate_protocol::{Decoder, Encoder, Event, Flags, Msg, MsgCreator};
use arcgate_session::{
    run, BoxError, ControlProtocol, EventDispatcher, EventHandler, Session, SessionError,
    SessionId, SessionState, StateWatcher, UserId,
};
use arcgate_transport::{Conn, SequencedBuffer, Transceiver};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chain::ChainBuilder;
use crate::config::ClientConfig;
use crate::handshake::client::{self as handshake, Resume};
use crate::ArcgateError;

/// Builder for a [`Client`].
pub struct ClientBuilder<C: Conn> {
    config: ClientConfig,
    chain: ChainBuilder<C>,
    watchers: Vec<StateWatcher>,
    creator: MsgCreator,
}

impl<C: Conn> ClientBuilder<C> {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            chain: ChainBuilder::new(),
            watchers: Vec::new(),
            creator: MsgCreator::default(),
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the token sent when the gateway asks for authentication.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = token.into();
        self
    }

    /// Called with every payload the gateway sends.
    pub fn on_data<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session<C>, Bytes) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.chain.on_data(f);
        self
    }

    /// Called with events no handler consumed.
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session<C>, Event) + Send + Sync + 'static,
    {
        self.chain.on_event(f);
        self
    }

    pub fn control(mut self, control: ControlProtocol<C>) -> Self {
        self.chain.control(control);
        self
    }

    pub fn handler(mut self, handler: impl EventHandler<C>) -> Self {
        self.chain.handler(handler);
        self
    }

    pub fn dispatcher(mut self, dispatcher: EventDispatcher<C>) -> Self {
        self.chain.replace(dispatcher);
        self
    }

    pub fn watch(mut self, watcher: StateWatcher) -> Self {
        self.watchers.push(watcher);
        self
    }

    pub fn msg_creator(mut self, creator: MsgCreator) -> Self {
        self.creator = creator;
        self
    }

    /// Opens a new session over `conn`.
    ///
    /// The session object is created once the gateway has assigned its
    /// id, so watchers see `Birth`, `Handshake` and `Confirmed` back to
    /// back, then `Active` once the main loop starts.
    pub async fn connect(self, conn: C) -> Result<Client<C>, ArcgateError> {
        let creator = Arc::new(self.creator);
        let transceiver = transceiver(conn, &self.config, &creator);
        let established = match handshake::connect(&transceiver, &self.config, None).await {
            Ok(established) => established,
            Err(e) => {
                let _ = transceiver.close().await;
                return Err(e.into());
            }
        };

        let session = Arc::new(Session::new(
            established.session_id,
            Arc::new(transceiver),
            self.config.session.clone(),
            Arc::from(self.watchers),
        ));
        session.set_state(SessionState::Handshake)?;
        session.confirm(self.config.token.clone(), UserId::default())?;
        tracing::info!(session = %session.id(), "client session established");

        let task = tokio::spawn(run(Arc::clone(&session), Arc::new(self.chain.build())));
        Ok(Client {
            session,
            config: self.config,
            creator,
            task: Some(task),
        })
    }
}

impl<C: Conn> Default for ClientBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn transceiver<C: Conn>(conn: C, config: &ClientConfig, creator: &Arc<MsgCreator>) -> Transceiver<C> {
    Transceiver::new(
        conn,
        Encoder::new(),
        Decoder::new(Arc::clone(creator)),
        SequencedBuffer::new(config.session.buffer_capacity),
        config.session.io_timeout(),
    )
}

/// A connected client session.
///
/// Dropping the client closes its session.
pub struct Client<C: Conn> {
    session: Arc<Session<C>>,
    config: ClientConfig,
    creator: Arc<MsgCreator>,
    task: Option<JoinHandle<()>>,
}

impl<C: Conn> Client<C> {
    pub fn builder() -> ClientBuilder<C> {
        ClientBuilder::new()
    }

    /// Opens a session with the default handler chain.
    pub async fn connect(conn: C, config: ClientConfig) -> Result<Self, ArcgateError> {
        ClientBuilder::new().config(config).connect(conn).await
    }

    pub fn session(&self) -> &Arc<Session<C>> {
        &self.session
    }

    pub fn id(&self) -> &SessionId {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Queues a payload for the gateway.
    pub fn send_data(&self, data: Bytes) -> Result<(), SessionError> {
        self.session.send_data(data)
    }

    /// Queues an arbitrary message.
    pub fn send_event(&self, flags: Flags, msg: Msg) -> Result<(), SessionError> {
        self.session.send_event(flags, msg)
    }

    /// Asks the gateway for its clock. The answer arrives as a
    /// `RESP_TIME` event, or at the control protocol's sync-time handler.
    pub fn sync_time(&self, corr_id: i64) -> Result<(), SessionError> {
        let (flags, msg) = ControlProtocol::<C>::sync_time_request(corr_id);
        self.session.send_event(flags, msg)
    }

    /// Payloads from the gateway. Only the first call gets the receiver.
    pub fn take_data_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.session.take_data_receiver()
    }

    /// Events no handler consumed. Only the first call gets the receiver.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.session.take_event_receiver()
    }

    /// Resumes the session over a new connection.
    ///
    /// Frames the gateway has not acknowledged are replayed once the
    /// handshake finishes. If the gateway refuses, the session stays as
    /// it was; it dies at its inactivity deadline unless a later attempt
    /// succeeds.
    pub async fn reconnect(&self, conn: C) -> Result<(), ArcgateError> {
        if self.session.is_closed() {
            return Err(SessionError::Closed.into());
        }
        let current = self.session.transceiver();
        let (send_seq, recv_seq) = current.sequences().await;
        let resume = Resume {
            session_id: self.session.id().clone(),
            send_seq,
            recv_seq,
        };

        let transceiver = transceiver(conn, &self.config, &self.creator);
        let established = match handshake::connect(&transceiver, &self.config, Some(&resume)).await {
            Ok(established) => established,
            Err(e) => {
                let _ = transceiver.close().await;
                return Err(e.into());
            }
        };
        current
            .renew(transceiver.into_renewal(), established.finished.recv_seq)
            .await?;
        tracing::info!(
            session = %self.session.id(),
            remote_recv_seq = established.finished.recv_seq,
            "client session resumed"
        );
        Ok(())
    }

    /// Asks the session to end with `Rst{SessionClosed}`.
    pub fn close(&self) {
        self.session.close();
    }

    /// Closes the session and waits for its main loop to finish.
    pub async fn shutdown(mut self) {
        self.session.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(session = %self.session.id(), error = %e, "client session task failed");
            }
        }
        self.session.death().await;
    }
}

impl<C: Conn> Drop for Client<C> {
    fn drop(&mut self) {
        self.session.close();
    }
}
