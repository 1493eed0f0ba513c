//! The `Gateway` builder and accept loop.
//!
//! This is the entry point for running an Arcgate server. It ties
//! together all the layers: transport → protocol → session.
//!
//! Each accepted connection gets its own task, which runs the handshake
//! and then either resumes an existing session on the new connection or
//! supervises a new session until it dies:
//!
//! ```text
//! accept ──→ handshake ─┬─ new session ──→ register ──→ run ──→ Death ──→ deregister
//!                       ├─ continue ─────→ renew the existing session, task ends
//!                       └─ failure ──────→ Rst, close
//! ```

use std::sync::Arc;
use std::time::Duration;

use arcgate_protocol::{Code, Event, MsgCreator};
use arcgate_session::{
    run, Authenticator, BoxError, CloseReason, ControlProtocol, EventDispatcher, EventHandler,
    NoAuth, Session, SessionConfig, SessionId, SessionManager, StateWatcher,
};
use arcgate_transport::{Conn, Transport, TransportError};
use bytes::Bytes;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::chain::ChainBuilder;
use crate::config::{GatewayConfig, HandshakeConfig};
use crate::handshake::server::{self as handshake, Accepted};
use crate::ArcgateError;

/// Shared gateway state passed to each connection task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks.
pub(crate) struct Shared<C: Conn, A: Authenticator> {
    pub(crate) config: GatewayConfig,
    pub(crate) auth: A,
    pub(crate) sessions: SessionManager<C>,
    pub(crate) dispatcher: Arc<EventDispatcher<C>>,
    pub(crate) watchers: Arc<[StateWatcher]>,
    pub(crate) creator: Arc<MsgCreator>,
    pub(crate) shutdown: watch::Sender<bool>,
    /// Signalled whenever a session is deregistered.
    pub(crate) removed: Notify,
}

fn shutdown_reason() -> CloseReason {
    CloseReason {
        code: Code::SHUTDOWN,
        message: "gateway shutting down".into(),
    }
}

/// Builder for configuring a [`Gateway`].
///
/// Without an explicit [`dispatcher`](Self::dispatcher), sessions route
/// events through the trans protocol, the control protocol, the
/// [`handler`](Self::handler)s and finally the event forwarder, wired to
/// the callbacks given here.
///
/// # Example
///
/// ```rust,no_run
/// use arcgate::prelude::*;
///
/// # async fn serve() -> Result<(), ArcgateError> {
/// let transport = TcpTransport::bind("0.0.0.0:7000").await?;
/// let gateway = Gateway::builder()
///     .on_data(|session, data| {
///         session.send_data(data)?;
///         Ok(())
///     })
///     .build(NoAuth);
/// gateway.serve(transport).await
/// # }
/// ```
pub struct GatewayBuilder<C: Conn> {
    config: GatewayConfig,
    chain: ChainBuilder<C>,
    watchers: Vec<StateWatcher>,
    creator: MsgCreator,
}

impl<C: Conn> GatewayBuilder<C> {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            chain: ChainBuilder::new(),
            watchers: Vec::new(),
            creator: MsgCreator::default(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the address recorded in the configuration.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config.session = config;
        self
    }

    pub fn handshake_config(mut self, config: HandshakeConfig) -> Self {
        self.config.handshake = config;
        self
    }

    /// Called with every payload a client sends.
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

    /// Replaces the control protocol, e.g. to observe heartbeats.
    pub fn control(mut self, control: ControlProtocol<C>) -> Self {
        self.chain.control(control);
        self
    }

    /// Adds an application handler after the built-in protocols.
    pub fn handler(mut self, handler: impl EventHandler<C>) -> Self {
        self.chain.handler(handler);
        self
    }

    /// Uses `dispatcher` as is, ignoring the callbacks and handlers set
    /// on this builder.
    pub fn dispatcher(mut self, dispatcher: EventDispatcher<C>) -> Self {
        self.chain.replace(dispatcher);
        self
    }

    /// Watches the state of every session.
    pub fn watch(mut self, watcher: StateWatcher) -> Self {
        self.watchers.push(watcher);
        self
    }

    /// Registers application messages on top of the built-in catalogue.
    pub fn msg_creator(mut self, creator: MsgCreator) -> Self {
        self.creator = creator;
        self
    }

    /// Builds the gateway with the given authenticator.
    pub fn build<A: Authenticator>(self, auth: A) -> Gateway<C, A> {
        let (shutdown, _) = watch::channel(false);
        Gateway {
            shared: Arc::new(Shared {
                config: self.config,
                auth,
                sessions: SessionManager::new(),
                dispatcher: Arc::new(self.chain.build()),
                watchers: Arc::from(self.watchers),
                creator: Arc::new(self.creator),
                shutdown,
                removed: Notify::new(),
            }),
        }
    }
}

impl<C: Conn> Default for GatewayBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// A session gateway.
///
/// Feed it connections with [`serve`](Self::serve) or
/// [`accept`](Self::accept). Cloning is cheap and every clone drives the
/// same gateway.
pub struct Gateway<C: Conn, A: Authenticator> {
    shared: Arc<Shared<C, A>>,
}

impl<C: Conn, A: Authenticator> Clone for Gateway<C, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Conn> Gateway<C, NoAuth> {
    /// Creates a new builder. The authenticator is chosen at
    /// [`build`](GatewayBuilder::build).
    pub fn builder() -> GatewayBuilder<C> {
        GatewayBuilder::new()
    }
}

impl<C: Conn, A: Authenticator> Gateway<C, A> {
    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    /// Runs the accept loop until the transport closes or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn serve<T: Transport<Conn = C>>(&self, mut transport: T) -> Result<(), ArcgateError> {
        match transport.local_addr() {
            Some(addr) => tracing::info!(%addr, "Arcgate gateway listening"),
            None => tracing::info!("Arcgate gateway running"),
        }

        loop {
            let accepted = tokio::select! {
                _ = self.stopped() => break,
                accepted = transport.accept() => accepted,
            };
            match accepted {
                Ok(conn) => {
                    self.accept(conn);
                }
                Err(TransportError::Shutdown) => {
                    tracing::info!("transport closed, accept loop ending");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
        Ok(())
    }

    /// Takes one connection: runs its handshake and, for a new session,
    /// supervises the session until it dies.
    pub fn accept(&self, conn: C) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let conn_id = conn.id();
            tracing::debug!(conn = %conn_id, peer = ?conn.peer_addr(), "connection accepted");
            match handshake::accept(conn, &shared).await {
                Ok(Accepted::New(session)) => supervise(shared, session).await,
                Ok(Accepted::Resumed(session)) => {
                    tracing::debug!(conn = %conn_id, session = %session.id(), "connection handed to session");
                }
                Err(e) => {
                    tracing::debug!(conn = %conn_id, error = %e, "connection rejected");
                }
            }
        })
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<Session<C>>> {
        self.shared.sessions.get(id)
    }

    /// A snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session<C>>> {
        self.shared.sessions.sessions()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.count()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shared.shutdown.borrow()
    }

    /// Stops accepting, closes every session with `Rst{Shutdown}` and
    /// waits up to `grace` for them to deregister.
    ///
    /// Returns `false` if sessions were still registered when `grace`
    /// ran out.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shared.shutdown.send_replace(true);
        tracing::info!(sessions = self.session_count(), "gateway shutting down");
        self.shared
            .sessions
            .for_each(|session| session.close_with(shutdown_reason()));

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let removed = self.shared.removed.notified();
            tokio::pin!(removed);
            removed.as_mut().enable();
            if self.shared.sessions.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, removed).await.is_err() {
                tracing::warn!(remaining = self.session_count(), "shutdown grace period expired");
                return false;
            }
        }
    }

    async fn stopped(&self) {
        let mut rx = self.shared.shutdown.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Runs a new session's main loop and cleans up after it, even if the
/// loop panicked.
async fn supervise<C: Conn, A: Authenticator>(shared: Arc<Shared<C, A>>, session: Arc<Session<C>>) {
    if *shared.shutdown.borrow() {
        session.close_with(shutdown_reason());
    }
    let task = tokio::spawn(run(Arc::clone(&session), Arc::clone(&shared.dispatcher)));
    if let Err(e) = task.await {
        if e.is_panic() {
            tracing::error!(session = %session.id(), "session task panicked");
        } else {
            tracing::warn!(session = %session.id(), "session task cancelled");
        }
    }
    session.death().await;
    shared.sessions.remove(session.id());
    shared.removed.notify_waiters();
}
