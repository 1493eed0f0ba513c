//! The transceiver: a session's single point for sending and receiving
//! frames over a connection that can be replaced underneath it.
//!
//! # Locking
//!
//! Sending and receiving are independent: one task may sit in
//! [`Transceiver::recv`] while others call [`Transceiver::send`].
//!
//! - The send half (encoder + [`SequencedBuffer`]) lives behind an async
//!   mutex. Every write to the connection happens under it, which keeps
//!   frames (and stream-cipher state) in wire order.
//! - The receive half (decoder + read buffer) lives behind another.
//! - The current connection sits in a small std mutex that is never
//!   held across an await.
//!
//! # Renewal
//!
//! When a client reconnects, the handshake builds a [`Renewal`] (new
//! connection plus its freshly keyed encoder and decoder) and calls
//! [`Transceiver::renew_with_preface`]. Under the send lock, the buffer
//! is synchronized with the peer's receive sequence, the preface
//! (`Finished`) goes out first, the link is swapped, and the missing
//! frames are replayed. A generation counter wakes any pending `recv`
//! so it moves to the new connection and decoder.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use arcgate_protocol::{Code, Decoder, Encoder, Event, Flags, Msg, Rst};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;

use crate::sequenced::{SequenceCounters, SequencedBuffer, Validation};
use crate::{Conn, TransportError};

const READ_CHUNK: usize = 16 * 1024;

/// A new connection with the codec state negotiated for it.
pub struct Renewal<C> {
    pub conn: Arc<C>,
    pub encoder: Encoder,
    pub decoder: Decoder,
}

impl<C: Conn> Renewal<C> {
    /// Answers the new connection with an `Rst`, sealed by its own
    /// encoder, and closes it.
    pub async fn refuse(
        self,
        code: Code,
        message: impl Into<String>,
        io_timeout: Duration,
    ) -> Result<(), TransportError> {
        let Renewal { conn, mut encoder, .. } = self;
        let rst = Msg::Rst(Rst {
            code,
            message: message.into(),
        });
        let sent = write_frame(&*conn, &mut encoder, Flags::NONE, &rst, io_timeout).await;
        let _ = timeout(io_timeout, conn.close()).await;
        sent
    }
}

/// A renewal the transceiver turned down, handed back with the reason.
pub struct Refused<C> {
    pub error: TransportError,
    pub renewal: Renewal<C>,
}

impl<C> fmt::Debug for Refused<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Refused").field("error", &self.error).finish_non_exhaustive()
    }
}

/// Encodes, seals and writes one frame outside any sequenced buffer.
async fn write_frame<C: Conn>(
    conn: &C,
    encoder: &mut Encoder,
    flags: Flags,
    msg: &Msg,
    io_timeout: Duration,
) -> Result<(), TransportError> {
    let frame = encoder.encode(flags, msg)?;
    let wire = encoder.seal(&frame)?;
    timeout(io_timeout, conn.write_all(&wire))
        .await
        .map_err(|_| TransportError::Timeout)?
}

struct Link<C> {
    conn: Arc<C>,
    /// Decoder for `conn`, picked up by the receive half on its next turn.
    staged: Option<Decoder>,
}

struct SendHalf {
    encoder: Encoder,
    buffer: SequencedBuffer,
}

struct RecvHalf {
    decoder: Decoder,
    generation: u64,
    generation_rx: watch::Receiver<u64>,
    scratch: Vec<u8>,
}

/// Sends and receives frames for one session.
pub struct Transceiver<C: Conn> {
    link: StdMutex<Link<C>>,
    generation: watch::Sender<u64>,
    send: Mutex<SendHalf>,
    recv: Mutex<RecvHalf>,
    counters: Arc<SequenceCounters>,
    timeout: Duration,
    paused: AtomicBool,
}

impl<C: Conn> Transceiver<C> {
    /// Wraps a connection. `io_timeout` bounds every read and flush.
    pub fn new(
        conn: C,
        encoder: Encoder,
        decoder: Decoder,
        buffer: SequencedBuffer,
        io_timeout: Duration,
    ) -> Self {
        let (generation, generation_rx) = watch::channel(0);
        let counters = Arc::clone(buffer.counters());
        Self {
            link: StdMutex::new(Link {
                conn: Arc::new(conn),
                staged: None,
            }),
            generation,
            send: Mutex::new(SendHalf { encoder, buffer }),
            recv: Mutex::new(RecvHalf {
                decoder,
                generation: 0,
                generation_rx,
                scratch: vec![0; READ_CHUNK],
            }),
            counters,
            timeout: io_timeout,
            paused: AtomicBool::new(false),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, Link<C>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current connection.
    pub fn conn(&self) -> Arc<C> {
        Arc::clone(&self.lock_link().conn)
    }

    /// Bumped every time the connection is replaced.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn io_timeout(&self) -> Duration {
        self.timeout
    }

    pub fn counters(&self) -> &Arc<SequenceCounters> {
        &self.counters
    }

    // -----------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------

    /// Encodes `msg`, buffers it and flushes the buffer.
    ///
    /// While paused the frame is only buffered. A failed flush leaves
    /// the frame buffered: sequenced frames go out again after a
    /// renewal.
    pub async fn send(&self, flags: Flags, msg: &Msg) -> Result<(), TransportError> {
        let mut guard = self.send.lock().await;
        let half = &mut *guard;
        let frame = half.encoder.encode(flags, msg)?;
        half.buffer.write(frame)?;
        if self.is_paused() {
            return Ok(());
        }
        self.flush(half).await
    }

    async fn flush(&self, half: &mut SendHalf) -> Result<(), TransportError> {
        let conn = self.conn();
        match timeout(self.timeout, half.buffer.write_to(&*conn, &mut half.encoder)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Sends an `Rst`.
    pub async fn send_rst(&self, code: Code, message: impl Into<String>) -> Result<(), TransportError> {
        let rst = Msg::Rst(Rst {
            code,
            message: message.into(),
        });
        self.send(Flags::NONE, &rst).await
    }

    /// Flushes frames still waiting in the buffer.
    pub async fn resend(&self) -> Result<(), TransportError> {
        let mut guard = self.send.lock().await;
        if self.is_paused() {
            return Ok(());
        }
        self.flush(&mut guard).await
    }

    /// Stops writing to the connection; sends only buffer.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resumes writing and flushes what accumulated.
    pub async fn resume(&self) -> Result<(), TransportError> {
        self.paused.store(false, Ordering::Release);
        self.resend().await
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------

    /// Receives the next frame that should be delivered.
    ///
    /// Sequenced duplicates (replays of frames that already arrived on
    /// an earlier connection) are skipped. A connection swap while
    /// waiting is followed transparently.
    pub async fn recv(&self) -> Result<Event, TransportError> {
        let mut guard = self.recv.lock().await;
        let recv = &mut *guard;
        loop {
            let conn = self.follow_link(recv);

            if let Some(event) = recv.decoder.fetch()? {
                match self.counters.validation(&event.head)? {
                    Validation::Accepted => return Ok(event),
                    Validation::Duplicate => {
                        tracing::debug!(
                            seq = event.head.seq,
                            msg = %event.msg.id(),
                            "dropping replayed duplicate"
                        );
                        continue;
                    }
                }
            }

            let read = tokio::select! {
                biased;
                _ = recv.generation_rx.changed() => continue,
                read = timeout(self.timeout, conn.read(&mut recv.scratch)) => read,
            };
            let result = match read {
                Ok(result) => result,
                Err(_) => return Err(TransportError::Timeout),
            };
            let swapped = *recv.generation_rx.borrow() != recv.generation;
            match result {
                Ok(n) if n > 0 => {
                    let n = n.min(recv.scratch.len());
                    recv.decoder.feed(&recv.scratch[..n]);
                }
                // The old connection was closed by a renewal.
                _ if swapped => continue,
                Ok(_) => {
                    return Err(TransportError::ConnectionClosed(
                        "peer closed the connection".into(),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves the receive half onto the current connection if it changed.
    fn follow_link(&self, recv: &mut RecvHalf) -> Arc<C> {
        let mut link = self.lock_link();
        let current = *recv.generation_rx.borrow_and_update();
        if current != recv.generation {
            match link.staged.take() {
                Some(decoder) => recv.decoder = decoder,
                None => recv.decoder.reset(),
            }
            recv.generation = current;
        }
        Arc::clone(&link.conn)
    }

    // -----------------------------------------------------------------
    // Codec and sequence management
    // -----------------------------------------------------------------

    /// Mutates the encoder under the send lock.
    pub async fn configure_encoder<F: FnOnce(&mut Encoder)>(&self, f: F) {
        f(&mut self.send.lock().await.encoder);
    }

    /// Mutates the decoder under the receive lock.
    pub async fn configure_decoder<F: FnOnce(&mut Decoder)>(&self, f: F) {
        f(&mut self.recv.lock().await.decoder);
    }

    /// `(send_seq, recv_seq)`.
    pub async fn sequences(&self) -> (u32, u32) {
        let send = self.send.lock().await;
        (send.buffer.send_seq(), self.counters.recv_seq())
    }

    /// Restarts sequencing, dropping everything buffered.
    pub async fn reset_sequences(&self, send_seq: u32, recv_seq: u32) {
        self.send.lock().await.buffer.reset(send_seq, recv_seq);
    }

    /// Frames currently held by the sequenced buffer.
    pub async fn buffered(&self) -> usize {
        self.send.lock().await.buffer.len()
    }

    // -----------------------------------------------------------------
    // Renewal
    // -----------------------------------------------------------------

    /// Switches to a new connection and replays unacknowledged frames.
    pub async fn renew(&self, renewal: Renewal<C>, remote_recv_seq: u32) -> Result<(), TransportError> {
        self.renew_inner(renewal, remote_recv_seq, None::<fn(u32, u32) -> (Flags, Msg)>)
            .await
            .map_err(|refused| refused.error)
    }

    /// Like [`renew`](Self::renew), writing `preface(send_seq,
    /// recv_seq)` on the new connection before the replay.
    ///
    /// On failure the renewal comes back untouched by the session, so
    /// the caller can still refuse it.
    pub async fn renew_with_preface<F>(
        &self,
        renewal: Renewal<C>,
        remote_recv_seq: u32,
        preface: F,
    ) -> Result<(), Refused<C>>
    where
        F: FnOnce(u32, u32) -> (Flags, Msg) + Send,
    {
        self.renew_inner(renewal, remote_recv_seq, Some(preface)).await
    }

    async fn renew_inner<F>(
        &self,
        renewal: Renewal<C>,
        remote_recv_seq: u32,
        preface: Option<F>,
    ) -> Result<(), Refused<C>>
    where
        F: FnOnce(u32, u32) -> (Flags, Msg) + Send,
    {
        let mut guard = self.send.lock().await;
        let half = &mut *guard;
        if let Err(error) = half.buffer.synchronization(remote_recv_seq) {
            return Err(Refused { error, renewal });
        }

        let Renewal {
            conn,
            mut encoder,
            decoder,
        } = renewal;

        if let Some(preface) = preface {
            let (flags, msg) = preface(half.buffer.send_seq(), self.counters.recv_seq());
            if let Err(error) = write_frame(&*conn, &mut encoder, flags, &msg, self.timeout).await {
                return Err(Refused {
                    error,
                    renewal: Renewal {
                        conn,
                        encoder,
                        decoder,
                    },
                });
            }
        }
        half.encoder = encoder;

        let old = {
            let mut link = self.lock_link();
            link.staged = Some(decoder);
            let old = std::mem::replace(&mut link.conn, conn);
            self.generation.send_modify(|generation| *generation += 1);
            old
        };
        self.paused.store(false, Ordering::Release);

        tracing::info!(
            old = %old.id(),
            new = %self.conn().id(),
            remote_recv_seq,
            replay = half.buffer.unsent(),
            "connection renewed"
        );

        if let Err(e) = self.flush(half).await {
            // Surfaces again through recv on the new connection.
            tracing::debug!(error = %e, "replay after renewal failed");
        }
        drop(guard);

        let close_timeout = self.timeout;
        tokio::spawn(async move {
            let _ = timeout(close_timeout, old.close()).await;
        });
        Ok(())
    }

    /// Resolves once the generation differs from `since`.
    pub async fn renewed(&self, since: u64) {
        let mut rx = self.generation.subscribe();
        let _ = rx.wait_for(|generation| *generation != since).await;
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Closes the connection and drops everything buffered.
    pub async fn shutdown(&self) {
        let conn = self.conn();
        if let Err(e) = timeout(self.timeout, conn.close()).await.unwrap_or(Ok(())) {
            tracing::debug!(error = %e, "closing connection failed");
        }
        let mut send = self.send.lock().await;
        let (send_seq, recv_seq) = (send.buffer.send_seq(), self.counters.recv_seq());
        send.buffer.reset(send_seq, recv_seq);
    }

    /// Closes just the connection.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.conn().close().await
    }

    /// Takes the connection and codec state apart, e.g. to hand a
    /// freshly handshaken connection to an existing session.
    pub fn into_renewal(self) -> Renewal<C> {
        let link = self.link.into_inner().unwrap_or_else(PoisonError::into_inner);
        let send = self.send.into_inner();
        let recv = self.recv.into_inner();
        Renewal {
            conn: link.conn,
            encoder: send.encoder,
            decoder: link.staged.unwrap_or(recv.decoder),
        }
    }
}

// =========================================================================
// Tests
// =========================================================================
