//! The per-session main loop.
//!
//! ```text
//!          ┌──────────── dispatch_once ◄───────────┐
//!          │                                        │ ok
//!   Active ┤ timeout #1 ─→ send PING ───────────────┘
//!          │ timeout #2 / I/O error ─→ Inactive ─┬─ renewed ─→ Active
//!          │                                      ├─ closed  ─→ Rst(reason) ─→ Death
//!          │                                      └─ deadline ─→ Rst(SessionDeath) ─→ Death
//!          │ Rst received ─→ Death
//!          └ other error ─→ Rst(code) ─→ Death
//! ```
//!
//! Two pump tasks drain the session's outbound queues into the
//! transceiver for as long as the loop runs.

use std::sync::Arc;

use arcgate_protocol::{Code, Flags, Msg, Payload};
use arcgate_transport::Conn;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{CloseReason, ControlProtocol, EventDispatcher, Session, SessionError, SessionState};

/// How a stretch of inactivity ended.
enum Wake {
    Renewed,
    Closed,
    Expired,
}

/// Runs `session` until it dies.
///
/// Moves the session to `Active`, pumps its outbound queues and
/// dispatches received events until the peer resets, the session is
/// closed, an unrecoverable error occurs or the inactivity deadline
/// passes. Always ends in `Death`.
pub async fn run<C: Conn>(session: Arc<Session<C>>, dispatcher: Arc<EventDispatcher<C>>) {
    match session.set_state(SessionState::Active) {
        Ok(()) => {
            let pumps = spawn_pumps(&session);
            drive(&session, &dispatcher).await;
            for pump in pumps {
                pump.abort();
            }
        }
        Err(e) => {
            tracing::warn!(session = %session.id(), error = %e, "session cannot start");
        }
    }
    session.death().await;
}

async fn drive<C: Conn>(session: &Session<C>, dispatcher: &EventDispatcher<C>) {
    let transceiver = session.transceiver();
    let mut timed_out = false;

    loop {
        let generation = transceiver.generation();
        let result = tokio::select! {
            _ = session.closed() => {
                send_close_reason(session).await;
                return;
            }
            result = dispatcher.dispatch_once(session) => result,
        };

        let err = match result {
            Ok(()) => {
                timed_out = false;
                continue;
            }
            Err(e) => e,
        };

        if err.is_timeout() && !timed_out {
            timed_out = true;
            tracing::debug!(session = %session.id(), "peer quiet, sending ping");
            let (flags, msg) = ControlProtocol::<C>::ping();
            match transceiver.send(flags, &msg).await {
                Ok(()) => continue,
                Err(e) if e.is_io() || e.is_timeout() => {}
                Err(e) => {
                    tracing::warn!(session = %session.id(), error = %e, "ping failed");
                    return;
                }
            }
        }

        if err.is_timeout() || err.is_io() {
            timed_out = false;
            tracing::info!(session = %session.id(), error = %err, "connection lost, session inactive");
            match inactive(session, generation).await {
                Wake::Renewed => continue,
                Wake::Closed => {
                    let _ = transceiver.resume().await;
                    send_close_reason(session).await;
                    return;
                }
                Wake::Expired => {
                    let _ = transceiver.resume().await;
                    let _ = transceiver
                        .send_rst(Code::SESSION_DEATH, "inactive timeout")
                        .await;
                    return;
                }
            }
        }

        match err {
            SessionError::Reset { code, message } => {
                tracing::info!(session = %session.id(), %code, %message, "session reset by peer");
                session.close_with(CloseReason { code, message });
                return;
            }
            e if e.recoverable() => {
                tracing::warn!(session = %session.id(), error = %e, "handler error");
            }
            e => {
                tracing::warn!(session = %session.id(), error = %e, "session failed");
                let _ = transceiver.send_rst(e.rst_code(), e.to_string()).await;
                return;
            }
        }
    }
}

/// Waits while `Inactive` for a renewal, a close or the deadline.
async fn inactive<C: Conn>(session: &Session<C>, generation: u64) -> Wake {
    let transceiver = session.transceiver();
    transceiver.pause();
    if let Err(e) = session.set_state(SessionState::Inactive) {
        tracing::debug!(session = %session.id(), error = %e, "cannot go inactive");
        return Wake::Closed;
    }

    let deadline = Instant::now() + session.config().inactive_timeout();
    let window = session.config().inactive_wait_window();
    loop {
        let now = Instant::now();
        if now >= deadline {
            tracing::info!(session = %session.id(), "inactive timeout expired");
            return Wake::Expired;
        }
        let wait = window.min(deadline - now);
        tokio::select! {
            _ = transceiver.renewed(generation) => {
                if let Err(e) = transceiver.resume().await {
                    tracing::debug!(session = %session.id(), error = %e, "resend after renewal failed");
                }
                return match session.set_state(SessionState::Active) {
                    Ok(()) => {
                        tracing::info!(session = %session.id(), "session active again");
                        Wake::Renewed
                    }
                    Err(_) => Wake::Closed,
                };
            }
            _ = session.closed() => return Wake::Closed,
            _ = tokio::time::sleep(wait) => {
                tracing::debug!(
                    session = %session.id(),
                    remaining_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "still waiting for reconnect"
                );
            }
        }
    }
}

async fn send_close_reason<C: Conn>(session: &Session<C>) {
    let reason = session.close_reason();
    tracing::info!(session = %session.id(), code = %reason.code, "closing session");
    if let Err(e) = session.transceiver().send_rst(reason.code, reason.message).await {
        tracing::debug!(session = %session.id(), error = %e, "close reset not delivered");
    }
}

fn spawn_pumps<C: Conn>(session: &Arc<Session<C>>) -> Vec<JoinHandle<()>> {
    let Some((mut data_rx, mut events_rx)) = session.take_outbound() else {
        return Vec::new();
    };

    let data = {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    _ = session.closed() => break,
                    data = data_rx.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };
                let msg = Msg::Payload(Payload { data });
                if let Err(e) = session.transceiver().send(Flags::SEQUENCED, &msg).await {
                    tracing::debug!(session = %session.id(), error = %e, "data left buffered");
                }
            }
        })
    };

    let events = {
        let session = Arc::clone(session);
        tokio::spawn(async move {
            loop {
                let (flags, msg) = tokio::select! {
                    _ = session.closed() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) = session.transceiver().send(flags, &msg).await {
                    tracing::debug!(session = %session.id(), error = %e, msg = %msg.id(), "event not sent");
                }
            }
        })
    };

    vec![data, events]
}
