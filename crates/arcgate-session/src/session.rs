//! Session types: the records that represent one client's logical link.
//!
//! A session tracks:
//! - WHO the client is (`UserId`, set once authentication succeeds)
//! - WHAT state it's in ([`SessionState`])
//! - HOW it can reconnect (the token it authenticated with)
//! - WHERE its frames go (a [`Transceiver`] that survives reconnects)

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use arcgate_protocol::{Code, Event, Flags, Msg};
use arcgate_transport::{Conn, Transceiver};
use bytes::Bytes;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::{BoxError, SessionConfig, SessionError};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identifier the gateway hands out in its `Hello`; the client presents
/// it again to reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        SessionId(id.to_string())
    }
}

/// Identity returned by the [`Authenticator`](crate::Authenticator).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates a random session id: 32 hex characters (128 bits).
pub fn generate_session_id() -> SessionId {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    SessionId(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a session.
///
/// ```text
///   Birth ──→ Handshake ──→ Confirmed ──→ Active ⇄ Inactive
///     │           │             │           │         │
///     └───────────┴─────────────┴───────────┴─────────┴──→ Death
/// ```
///
/// - **Birth**: created for a connection that asked for a new session.
/// - **Handshake**: the handshake is running.
/// - **Confirmed**: handshake done, registered in the session table.
/// - **Active**: the main loop is running over a live connection.
/// - **Inactive**: the connection was lost; waiting for a reconnect.
/// - **Death**: terminal. The connection and buffer are released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Birth,
    Handshake,
    Confirmed,
    Active,
    Inactive,
    Death,
}

impl SessionState {
    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Death, _) => false,
            (_, Death) => true,
            (Birth, Handshake)
            | (Handshake, Confirmed)
            | (Confirmed, Active)
            | (Active, Inactive)
            | (Inactive, Active) => true,
            _ => false,
        }
    }
}

/// Called on every state change with `(session, old, new)`.
///
/// `old` is `None` for the initial `Birth`. Errors and panics are caught
/// and logged; they never affect the session.
pub type StateWatcher =
    Arc<dyn Fn(&SessionId, Option<SessionState>, SessionState) -> Result<(), BoxError> + Send + Sync>;

/// Wraps a closure as a [`StateWatcher`].
pub fn state_watcher<F>(f: F) -> StateWatcher
where
    F: Fn(&SessionId, Option<SessionState>, SessionState) -> Result<(), BoxError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// Code and text for the `Rst` sent when a session is closed locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: Code,
    pub message: String,
}

impl Default for CloseReason {
    fn default() -> Self {
        Self {
            code: Code::SESSION_CLOSED,
            message: "session closed".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Listener channels
// ---------------------------------------------------------------------------

/// Inbound channel that only fills once someone took its receiver.
struct Listener<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    listening: AtomicBool,
}

impl<T> Listener<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            listening: AtomicBool::new(false),
        }
    }

    fn take(&self) -> Option<mpsc::Receiver<T>> {
        let rx = lock(&self.rx).take();
        if rx.is_some() {
            self.listening.store(true, Ordering::Release);
        }
        rx
    }

    fn deliver(&self, item: T, what: &'static str, session: &SessionId) -> bool {
        if !self.listening.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(%session, what, "listener channel full, dropping newest");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.listening.store(false, Ordering::Release);
                false
            }
        }
    }
}

type OutboundReceivers = (mpsc::Receiver<Bytes>, mpsc::Receiver<(Flags, Msg)>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A single client's session.
///
/// Shared as `Arc<Session<C>>` between the session table, the main loop,
/// the outbound pumps and application code. Holds no reference back to
/// the gateway; whoever runs the main loop owns its lifetime.
pub struct Session<C: Conn> {
    id: SessionId,
    config: SessionConfig,
    transceiver: Arc<Transceiver<C>>,
    state: Mutex<SessionState>,
    token: OnceLock<String>,
    user_id: OnceLock<UserId>,
    watchers: Mutex<Vec<StateWatcher>>,
    global_watchers: Arc<[StateWatcher]>,
    /// Transitions applied but not yet handed to watchers, oldest first.
    pending: Mutex<VecDeque<(Option<SessionState>, SessionState)>>,
    delivering: AtomicBool,
    closed: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,
    data_out: mpsc::Sender<Bytes>,
    events_out: mpsc::Sender<(Flags, Msg)>,
    pumps: Mutex<Option<OutboundReceivers>>,
    data_in: Listener<Bytes>,
    events_in: Listener<Event>,
    created_at: Instant,
}

impl<C: Conn> Session<C> {
    /// Creates a session in `Birth` and notifies `global_watchers`.
    pub fn new(
        id: SessionId,
        transceiver: Arc<Transceiver<C>>,
        config: SessionConfig,
        global_watchers: Arc<[StateWatcher]>,
    ) -> Self {
        let (data_out, data_rx) = mpsc::channel(config.send_queue_size.max(1));
        let (events_out, events_rx) = mpsc::channel(config.send_queue_size.max(1));
        let (closed, _) = watch::channel(false);
        let session = Self {
            id,
            transceiver,
            state: Mutex::new(SessionState::Birth),
            token: OnceLock::new(),
            user_id: OnceLock::new(),
            watchers: Mutex::new(Vec::new()),
            global_watchers,
            pending: Mutex::new(VecDeque::from([(None, SessionState::Birth)])),
            delivering: AtomicBool::new(false),
            closed,
            close_reason: Mutex::new(None),
            data_out,
            events_out,
            pumps: Mutex::new(Some((data_rx, events_rx))),
            data_in: Listener::new(config.recv_queue_size),
            events_in: Listener::new(config.recv_queue_size),
            created_at: Instant::now(),
            config,
        };
        tracing::debug!(session = %session.id, "session born");
        session.deliver_pending();
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transceiver(&self) -> &Arc<Transceiver<C>> {
        &self.transceiver
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Set once the handshake authenticated the client.
    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.get()
    }

    /// The token the client authenticated with; a reconnect must
    /// present the same one.
    pub fn token(&self) -> Option<&str> {
        self.token.get().map(String::as_str)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // -----------------------------------------------------------------
    // State machine
    // -----------------------------------------------------------------

    /// Moves to `next` and notifies watchers (session-local first, then
    /// gateway-wide).
    ///
    /// Watchers see transitions in the order they were applied. If
    /// another caller is already delivering, that caller runs the
    /// watchers for this transition too.
    ///
    /// Use [`death`](Self::death) to reach `Death`.
    pub fn set_state(&self, next: SessionState) -> Result<(), SessionError> {
        let old = {
            let mut state = lock(&self.state);
            let old = *state;
            if next == SessionState::Death || !old.can_transition_to(next) {
                return Err(SessionError::InvalidTransition { from: old, to: next });
            }
            *state = next;
            lock(&self.pending).push_back((Some(old), next));
            old
        };
        tracing::debug!(session = %self.id, from = ?old, to = ?next, "session state changed");
        self.deliver_pending();
        Ok(())
    }

    /// Records the handshake outcome and moves to `Confirmed`.
    pub fn confirm(&self, token: String, user_id: UserId) -> Result<(), SessionError> {
        let _ = self.token.set(token);
        let _ = self.user_id.set(user_id);
        self.set_state(SessionState::Confirmed)
    }

    /// Adds a session-local watcher.
    pub fn watch(&self, watcher: StateWatcher) {
        lock(&self.watchers).push(watcher);
    }

    fn deliver_pending(&self) {
        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = lock(&self.pending).pop_front();
                let Some((old, new)) = next else { break };
                self.notify(old, new);
            }
            self.delivering.store(false, Ordering::Release);
            // Something queued between the last pop and the store.
            if lock(&self.pending).is_empty() {
                return;
            }
        }
    }

    fn notify(&self, old: Option<SessionState>, new: SessionState) {
        let local: Vec<StateWatcher> = lock(&self.watchers).clone();
        for watcher in local.iter().chain(self.global_watchers.iter()) {
            match catch_unwind(AssertUnwindSafe(|| watcher(&self.id, old, new))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(session = %self.id, ?new, error = %e, "state watcher failed");
                }
                Err(_) => {
                    tracing::error!(session = %self.id, ?new, "state watcher panicked");
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    /// Queues application data for sending as a sequenced `Payload`.
    ///
    /// Never blocks: a full queue drops `data` and returns
    /// [`SessionError::QueueFull`].
    pub fn send_data(&self, data: Bytes) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.data_out.try_send(data).map_err(|e| self.rejected(e, "data"))
    }

    /// Queues an arbitrary message with the given flags.
    pub fn send_event(&self, flags: Flags, msg: Msg) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.events_out
            .try_send((flags, msg))
            .map_err(|e| self.rejected(e, "event"))
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn rejected<T>(&self, err: mpsc::error::TrySendError<T>, what: &'static str) -> SessionError {
        match err {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!(session = %self.id, what, "outbound queue full, dropping newest");
                SessionError::QueueFull(what)
            }
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        }
    }

    /// Hands the outbound queues to the pumps; `None` after the first call.
    pub(crate) fn take_outbound(&self) -> Option<OutboundReceivers> {
        lock(&self.pumps).take()
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Receiver of every `Payload` body. Until this is taken, data only
    /// reaches the data handler.
    pub fn take_data_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.data_in.take()
    }

    /// Receiver of events no protocol handled.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<Event>> {
        self.events_in.take()
    }

    pub(crate) fn deliver_data(&self, data: Bytes) -> bool {
        self.data_in.deliver(data, "data", &self.id)
    }

    pub(crate) fn deliver_event(&self, event: Event) -> bool {
        self.events_in.deliver(event, "event", &self.id)
    }

    pub(crate) fn listens_for_events(&self) -> bool {
        self.events_in.listening.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Asks the main loop to end the session with `Rst{SessionClosed}`.
    pub fn close(&self) {
        self.close_with(CloseReason::default());
    }

    /// Asks the main loop to end the session with the given `Rst`. The
    /// first reason wins.
    pub fn close_with(&self, reason: CloseReason) {
        lock(&self.close_reason).get_or_insert(reason);
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has been closed or died.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn close_reason(&self) -> CloseReason {
        lock(&self.close_reason).clone().unwrap_or_default()
    }

    /// Moves to `Death`, stops the pumps and releases the connection and
    /// buffer. Returns `false` if the session was already dead.
    pub async fn death(&self) -> bool {
        let old = {
            let mut state = lock(&self.state);
            if *state == SessionState::Death {
                return false;
            }
            let old = std::mem::replace(&mut *state, SessionState::Death);
            lock(&self.pending).push_back((Some(old), SessionState::Death));
            old
        };
        self.closed.send_replace(true);
        self.transceiver.shutdown().await;
        tracing::info!(
            session = %self.id,
            from = ?old,
            age_ms = self.created_at.elapsed().as_millis() as u64,
            "session died"
        );
        self.deliver_pending();
        true
    }
}

impl<C: Conn> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("user_id", &self.user_id.get())
            .finish_non_exhaustive()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use arcgate_protocol::{Decoder, Encoder};
    use arcgate_transport::{MemoryConn, SequencedBuffer};
    use std::time::Duration;

    fn session_with(config: SessionConfig, watchers: Vec<StateWatcher>) -> Session<MemoryConn> {
        let (conn, _peer) = MemoryConn::pair();
        let transceiver = Transceiver::new(
            conn,
            Encoder::new(),
            Decoder::default(),
            SequencedBuffer::new(config.buffer_capacity),
            Duration::from_millis(100),
        );
        Session::new(
            generate_session_id(),
            Arc::new(transceiver),
            config,
            watchers.into(),
        )
    }

    fn recorder() -> (StateWatcher, Arc<Mutex<Vec<SessionState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watcher = state_watcher(move |_, _, new| {
            sink.lock().unwrap().push(new);
            Ok(())
        });
        (watcher, seen)
    }

    // =====================================================================
    // Identity
    // =====================================================================

    #[test]
    fn test_generate_session_id_is_32_hex_chars() {
        let id = generate_session_id();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_session_id());
    }

    // =====================================================================
    // State machine
    // =====================================================================

    #[test]
    fn test_transitions_follow_lifecycle() {
        use SessionState::*;
        assert!(Birth.can_transition_to(Handshake));
        assert!(Active.can_transition_to(Inactive));
        assert!(Inactive.can_transition_to(Active));
        assert!(Handshake.can_transition_to(Death));
        assert!(!Birth.can_transition_to(Active));
        assert!(!Active.can_transition_to(Confirmed));
        assert!(!Death.can_transition_to(Death));
    }

    #[tokio::test]
    async fn test_set_state_rejects_skipping() {
        let session = session_with(SessionConfig::default(), vec![]);
        let err = session.set_state(SessionState::Active).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidTransition {
                from: SessionState::Birth,
                to: SessionState::Active
            }
        ));
        assert_eq!(session.state(), SessionState::Birth);
    }

    #[tokio::test]
    async fn test_watchers_see_every_transition() {
        let (global, seen) = recorder();
        let session = session_with(SessionConfig::default(), vec![global]);
        session.set_state(SessionState::Handshake).unwrap();
        session.confirm("tok".into(), UserId("u1".into())).unwrap();
        session.set_state(SessionState::Active).unwrap();
        assert!(session.death().await);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionState::Birth,
                SessionState::Handshake,
                SessionState::Confirmed,
                SessionState::Active,
                SessionState::Death,
            ]
        );
        assert_eq!(session.token(), Some("tok"));
        assert_eq!(session.user_id(), Some(&UserId("u1".into())));
    }

    #[tokio::test]
    async fn test_local_watchers_run_before_global() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let global_order = Arc::clone(&order);
        let global = state_watcher(move |_, _, _| {
            global_order.lock().unwrap().push("global");
            Ok(())
        });
        let session = session_with(SessionConfig::default(), vec![global]);
        let local_order = Arc::clone(&order);
        session.watch(state_watcher(move |_, _, _| {
            local_order.lock().unwrap().push("local");
            Ok(())
        }));
        order.lock().unwrap().clear();
        session.set_state(SessionState::Handshake).unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["local", "global"]);
    }

    #[tokio::test]
    async fn test_failing_watchers_are_isolated() {
        let (recording, seen) = recorder();
        let failing = state_watcher(|_, _, _| Err("nope".into()));
        let panicking = state_watcher(|_, _, new| {
            if new == SessionState::Handshake {
                panic!("watcher bug");
            }
            Ok(())
        });
        let session = session_with(SessionConfig::default(), vec![failing, panicking, recording]);
        session.set_state(SessionState::Handshake).unwrap();
        assert_eq!(session.state(), SessionState::Handshake);
        assert_eq!(seen.lock().unwrap().last(), Some(&SessionState::Handshake));
    }

    #[test]
    fn test_concurrent_transitions_reach_watchers_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watcher = state_watcher(move |_, old, new| {
            sink.lock().unwrap().push((old, new));
            std::thread::yield_now();
            Ok(())
        });
        let session = session_with(SessionConfig::default(), vec![watcher]);
        session.set_state(SessionState::Handshake).unwrap();
        session.set_state(SessionState::Confirmed).unwrap();
        session.set_state(SessionState::Active).unwrap();

        std::thread::scope(|scope| {
            for target in [SessionState::Inactive, SessionState::Active] {
                let session = &session;
                scope.spawn(move || {
                    for _ in 0..200 {
                        let _ = session.set_state(target);
                    }
                });
            }
        });

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (None, SessionState::Birth));
        for pair in seen.windows(2) {
            assert_eq!(pair[1].0, Some(pair[0].1), "out of order: {pair:?}");
        }
        assert_eq!(seen.last().map(|t| t.1), Some(session.state()));
    }

    #[tokio::test]
    async fn test_death_is_idempotent() {
        let (watcher, seen) = recorder();
        let session = session_with(SessionConfig::default(), vec![watcher]);
        assert!(session.death().await);
        assert!(!session.death().await);
        let deaths = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == SessionState::Death)
            .count();
        assert_eq!(deaths, 1);
        assert!(session.is_closed());
        assert!(session.set_state(SessionState::Handshake).is_err());
    }

    // =====================================================================
    // Queues
    // =====================================================================

    #[tokio::test]
    async fn test_send_data_reports_full_queue() {
        let config = SessionConfig {
            send_queue_size: 1,
            ..SessionConfig::default()
        };
        let session = session_with(config, vec![]);
        session.send_data(Bytes::from_static(b"a")).unwrap();
        assert!(matches!(
            session.send_data(Bytes::from_static(b"b")),
            Err(SessionError::QueueFull("data"))
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let session = session_with(SessionConfig::default(), vec![]);
        session.close();
        assert!(matches!(
            session.send_data(Bytes::from_static(b"a")),
            Err(SessionError::Closed)
        ));
        assert_eq!(session.close_reason(), CloseReason::default());
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let session = session_with(SessionConfig::default(), vec![]);
        session.close_with(CloseReason {
            code: Code::SHUTDOWN,
            message: "maintenance".into(),
        });
        session.close();
        assert_eq!(session.close_reason().code, Code::SHUTDOWN);
        session.closed().await;
    }

    #[tokio::test]
    async fn test_data_listener_only_fills_once_taken() {
        let session = session_with(SessionConfig::default(), vec![]);
        assert!(!session.deliver_data(Bytes::from_static(b"early")));
        let mut rx = session.take_data_receiver().unwrap();
        assert!(session.take_data_receiver().is_none());
        assert!(session.deliver_data(Bytes::from_static(b"late")));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"late"));
    }
}
