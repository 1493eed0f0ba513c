//! The control protocol: resets, heartbeats and time synchronization.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arcgate_protocol::{Event, Flags, Heartbeat, Msg, SyncTime};
use arcgate_transport::Conn;

use crate::{EventHandler, Flow, Session, SessionError};

/// Notified of every heartbeat with its flags (`PING` or `PONG`).
pub type HeartbeatHandler<C> = Arc<dyn Fn(&Session<C>, Flags) + Send + Sync>;

/// Receives `SyncTime` responses.
pub type SyncTimeHandler<C> = Arc<dyn Fn(&Session<C>, &SyncTime) + Send + Sync>;

/// Handles `Rst`, `Heartbeat` and `SyncTime`.
///
/// - `Rst` ends the session: it becomes [`SessionError::Reset`].
/// - A `PING` heartbeat is answered with a sequenced `PONG`.
/// - A `REQ_TIME` request is always answered with `RESP_TIME`, echoing
///   the requester's clock next to ours; responses go to the handler if
///   set.
pub struct ControlProtocol<C: Conn> {
    on_heartbeat: Option<HeartbeatHandler<C>>,
    on_sync_time: Option<SyncTimeHandler<C>>,
}

impl<C: Conn> ControlProtocol<C> {
    pub fn new() -> Self {
        Self {
            on_heartbeat: None,
            on_sync_time: None,
        }
    }

    pub fn on_heartbeat<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session<C>, Flags) + Send + Sync + 'static,
    {
        self.on_heartbeat = Some(Arc::new(f));
        self
    }

    pub fn on_sync_time<F>(mut self, f: F) -> Self
    where
        F: Fn(&Session<C>, &SyncTime) + Send + Sync + 'static,
    {
        self.on_sync_time = Some(Arc::new(f));
        self
    }

    /// The heartbeat the session loop sends after a read timeout.
    pub fn ping() -> (Flags, Msg) {
        (Flags::SEQUENCED | Flags::PING, Msg::Heartbeat(Heartbeat))
    }

    /// A time-sync request stamped with the local clock.
    pub fn sync_time_request(corr_id: i64) -> (Flags, Msg) {
        let msg = SyncTime {
            corr_id,
            local_time: now_millis(),
            remote_time: 0,
        };
        (Flags::REQ_TIME, Msg::SyncTime(msg))
    }
}

impl<C: Conn> Default for ControlProtocol<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl<C: Conn> EventHandler<C> for ControlProtocol<C> {
    fn handle(&self, session: &Session<C>, event: Event) -> Result<Flow, SessionError> {
        let flags = event.flags();
        match event.msg {
            Msg::Rst(rst) => Err(SessionError::Reset {
                code: rst.code,
                message: rst.message,
            }),
            Msg::Heartbeat(_) => {
                if let Some(handler) = &self.on_heartbeat {
                    handler(session, flags);
                }
                if flags.contains(Flags::PING) {
                    Ok(Flow::Reply(
                        Flags::SEQUENCED | Flags::PONG,
                        Msg::Heartbeat(Heartbeat),
                    ))
                } else {
                    Ok(Flow::Handled)
                }
            }
            Msg::SyncTime(sync) if flags.contains(Flags::REQ_TIME) => {
                let reply = SyncTime {
                    corr_id: sync.corr_id,
                    local_time: sync.local_time,
                    remote_time: now_millis(),
                };
                Ok(Flow::Reply(Flags::RESP_TIME, Msg::SyncTime(reply)))
            }
            Msg::SyncTime(ref sync) if flags.contains(Flags::RESP_TIME) => {
                match &self.on_sync_time {
                    Some(handler) => {
                        handler(session, sync);
                        Ok(Flow::Handled)
                    }
                    None => Ok(Flow::Pass(event)),
                }
            }
            _ => Ok(Flow::Pass(event)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use arcgate_protocol::{Code, Decoder, Encoder, MsgHead, Rst};
    use arcgate_transport::{MemoryConn, SequencedBuffer, Transceiver};

    use crate::{generate_session_id, SessionConfig};

    fn session() -> Session<MemoryConn> {
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
            SessionConfig::default(),
            Arc::from(Vec::new()),
        )
    }

    fn event(flags: Flags, msg: Msg) -> Event {
        Event {
            head: MsgHead::new(msg.id(), flags),
            msg,
        }
    }

    #[tokio::test]
    async fn test_rst_becomes_reset_error() {
        let control = ControlProtocol::new();
        let rst = Msg::Rst(Rst {
            code: Code::SHUTDOWN,
            message: "bye".into(),
        });
        let err = control.handle(&session(), event(Flags::NONE, rst)).unwrap_err();
        assert!(matches!(err, SessionError::Reset { code: Code::SHUTDOWN, .. }));
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_sequenced_pong() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let control = ControlProtocol::new().on_heartbeat(move |_, flags| {
            sink.lock().unwrap().push(flags);
        });
        let (flags, msg) = ControlProtocol::<MemoryConn>::ping();
        let flow = control.handle(&session(), event(flags, msg)).unwrap();
        match flow {
            Flow::Reply(flags, Msg::Heartbeat(_)) => {
                assert!(flags.contains(Flags::PONG));
                assert!(flags.is_sequenced());
            }
            other => panic!("unexpected flow: {other:?}"),
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pong_is_consumed() {
        let control = ControlProtocol::new();
        let flow = control
            .handle(&session(), event(Flags::PONG, Msg::Heartbeat(Heartbeat)))
            .unwrap();
        assert!(matches!(flow, Flow::Handled));
    }

    #[tokio::test]
    async fn test_time_request_is_always_answered() {
        let control = ControlProtocol::new();
        let (flags, msg) = ControlProtocol::<MemoryConn>::sync_time_request(7);
        let sent_at = match &msg {
            Msg::SyncTime(sync) => sync.local_time,
            _ => unreachable!(),
        };
        match control.handle(&session(), event(flags, msg)).unwrap() {
            Flow::Reply(flags, Msg::SyncTime(reply)) => {
                assert!(flags.contains(Flags::RESP_TIME));
                assert_eq!(reply.corr_id, 7);
                assert_eq!(reply.local_time, sent_at);
                assert!(reply.remote_time >= sent_at);
            }
            other => panic!("unexpected flow: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_time_response_without_handler_passes() {
        let control = ControlProtocol::new();
        let resp = Msg::SyncTime(SyncTime::default());
        let flow = control
            .handle(&session(), event(Flags::RESP_TIME, resp.clone()))
            .unwrap();
        assert!(matches!(flow, Flow::Pass(_)));

        let got = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&got);
        let control = ControlProtocol::new().on_sync_time(move |_, sync| {
            *sink.lock().unwrap() = Some(sync.corr_id);
        });
        let flow = control.handle(&session(), event(Flags::RESP_TIME, resp)).unwrap();
        assert!(matches!(flow, Flow::Handled));
        assert_eq!(*got.lock().unwrap(), Some(0));
    }
}
