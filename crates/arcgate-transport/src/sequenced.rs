//! Sequenced frame buffer.
//!
//! Every frame a session sends goes through a [`SequencedBuffer`].
//! Frames flagged `SEQUENCED` get the next send sequence number and stay
//! in the buffer after they were written, until the peer's `ack` shows
//! it has them. When the client reconnects and reports its receive
//! sequence, [`SequencedBuffer::synchronization`] drops what the client
//! already has and rewinds the write cursor, so the next
//! [`write_to`](SequencedBuffer::write_to) replays exactly the missing
//! frames.
//!
//! Frames are held unsealed (see [`PlainFrame`]). Sealing happens at
//! write time with whatever encoder the current connection uses, so a
//! replay after a reconnect is encrypted with the new keys.
//!
//! Sequence numbers are `u32` and wrap; comparisons use serial-number
//! arithmetic ([`seq_before`]).

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arcgate_protocol::{Encoder, MsgHead, PlainFrame};
use bytes::Bytes;

use crate::{Conn, TransportError};

/// Default byte budget of a buffer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 512 * 1024;

/// `true` if `a` comes before `b` in wrapping sequence order.
pub fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

// ---------------------------------------------------------------------------
// SequenceCounters
// ---------------------------------------------------------------------------

/// What to do with a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Deliver it.
    Accepted,
    /// Already delivered on an earlier connection; drop it.
    Duplicate,
}

/// Receive-side sequence state, shared between the receive path (which
/// advances it) and the buffer (which stamps `ack` from it and trims
/// with the peer's acknowledgements).
#[derive(Debug, Default)]
pub struct SequenceCounters {
    recv_seq: AtomicU32,
    remote_ack: AtomicU32,
}

impl SequenceCounters {
    /// Next sequence number expected from the peer.
    pub fn recv_seq(&self) -> u32 {
        self.recv_seq.load(Ordering::Acquire)
    }

    /// Highest acknowledgement received from the peer.
    pub fn remote_ack(&self) -> u32 {
        self.remote_ack.load(Ordering::Acquire)
    }

    /// Checks a received head and advances the counters.
    ///
    /// Unsequenced frames are always accepted. A sequenced frame equal
    /// to `recv_seq` is accepted and bumps it; an older one is a replay
    /// duplicate; a newer one means frames were lost, which the
    /// connection cannot recover from.
    pub fn validation(&self, head: &MsgHead) -> Result<Validation, TransportError> {
        if !head.flags.is_sequenced() {
            return Ok(Validation::Accepted);
        }
        let expected = self.recv_seq();
        if head.seq == expected {
            self.recv_seq.store(expected.wrapping_add(1), Ordering::Release);
            self.record_ack(head.ack);
            Ok(Validation::Accepted)
        } else if seq_before(head.seq, expected) {
            self.record_ack(head.ack);
            Ok(Validation::Duplicate)
        } else {
            Err(TransportError::SequenceAhead {
                expected,
                received: head.seq,
            })
        }
    }

    fn record_ack(&self, ack: u32) {
        let _ = self
            .remote_ack
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                seq_before(current, ack).then_some(ack)
            });
    }

    fn reset(&self, recv_seq: u32, remote_ack: u32) {
        self.recv_seq.store(recv_seq, Ordering::Release);
        self.remote_ack.store(remote_ack, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// SequencedBuffer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BufferedFrame {
    frame: PlainFrame,
    /// Sealed bytes for the current connection, once sealing started.
    sealed: Option<Bytes>,
    /// How much of `sealed` reached the connection.
    offset: usize,
}

impl BufferedFrame {
    fn seq(&self) -> u32 {
        self.frame.head.seq
    }

    fn sequenced(&self) -> bool {
        self.frame.is_sequenced()
    }
}

/// Retains frames until the peer acknowledges them.
#[derive(Debug)]
pub struct SequencedBuffer {
    frames: VecDeque<BufferedFrame>,
    /// Index of the first frame not fully written.
    sent: usize,
    send_seq: u32,
    cached: usize,
    capacity: usize,
    evicted: u64,
    counters: Arc<SequenceCounters>,
}

impl SequencedBuffer {
    pub fn new(capacity: usize) -> Self {
        Self::with_sequences(0, 0, capacity)
    }

    /// A buffer that continues from known sequence numbers.
    pub fn with_sequences(send_seq: u32, recv_seq: u32, capacity: usize) -> Self {
        let counters = Arc::new(SequenceCounters::default());
        counters.reset(recv_seq, send_seq);
        Self {
            frames: VecDeque::new(),
            sent: 0,
            send_seq,
            cached: 0,
            capacity,
            evicted: 0,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<SequenceCounters> {
        &self.counters
    }

    /// Sequence number the next sequenced frame gets.
    pub fn send_seq(&self) -> u32 {
        self.send_seq
    }

    pub fn recv_seq(&self) -> u32 {
        self.counters.recv_seq()
    }

    /// Bytes held, counted before sealing.
    pub fn cached(&self) -> usize {
        self.cached
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames not fully written to the current connection.
    pub fn unsent(&self) -> usize {
        self.frames.len() - self.sent
    }

    /// Frames dropped to stay within capacity. Any eviction of an
    /// unacknowledged sequenced frame makes a later resume impossible.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Empties the buffer and restarts from the given sequences.
    pub fn reset(&mut self, send_seq: u32, recv_seq: u32) {
        self.frames.clear();
        self.sent = 0;
        self.cached = 0;
        self.send_seq = send_seq;
        self.counters.reset(recv_seq, send_seq);
    }

    /// Appends a frame, stamping `seq`/`ack` on sequenced ones.
    pub fn write(&mut self, mut frame: PlainFrame) -> Result<(), TransportError> {
        let size = frame.size();
        if size > self.capacity {
            return Err(TransportError::FrameTooLarge {
                size,
                capacity: self.capacity,
            });
        }

        self.trim_acknowledged();
        self.make_room(size)?;

        if frame.is_sequenced() {
            frame.head.seq = self.send_seq;
            frame.head.ack = self.counters.recv_seq();
            self.send_seq = self.send_seq.wrapping_add(1);
        }
        self.cached += size;
        self.frames.push_back(BufferedFrame {
            frame,
            sealed: None,
            offset: 0,
        });
        Ok(())
    }

    /// Drops written sequenced frames the peer acknowledged.
    fn trim_acknowledged(&mut self) {
        let mut ack = self.counters.remote_ack();
        // The peer cannot acknowledge what we never sent.
        if seq_before(self.send_seq, ack) {
            ack = self.send_seq;
            self.counters.remote_ack.store(ack, Ordering::Release);
        }
        while self.sent > 0 {
            let Some(front) = self.frames.front() else { break };
            if !(front.sequenced() && seq_before(front.seq(), ack)) {
                break;
            }
            self.pop_front();
            self.sent -= 1;
        }
    }

    fn make_room(&mut self, size: usize) -> Result<(), TransportError> {
        while self.cached + size > self.capacity {
            let Some(front) = self.frames.front() else { break };
            if self.sent == 0 && front.sealed.is_some() {
                // Sealing advanced the encoder; the peer must get it.
                return Err(TransportError::BufferFull);
            }
            tracing::warn!(
                seq = front.seq(),
                sequenced = front.sequenced(),
                cached = self.cached,
                capacity = self.capacity,
                "sequenced buffer full, evicting oldest frame"
            );
            self.pop_front();
            self.evicted += 1;
            self.sent = self.sent.saturating_sub(1);
        }
        Ok(())
    }

    fn pop_front(&mut self) {
        if let Some(frame) = self.frames.pop_front() {
            self.cached -= frame.frame.size();
        }
    }

    /// Writes every unsent frame to `conn`, sealing each with `encoder`
    /// the first time it is attempted on this connection.
    ///
    /// Short writes are resumed from the recorded offset. Sequenced
    /// frames stay buffered after writing; unsequenced ones are dropped.
    /// Returns the number of bytes written.
    pub async fn write_to<C: Conn + ?Sized>(
        &mut self,
        conn: &C,
        encoder: &mut Encoder,
    ) -> Result<usize, TransportError> {
        let mut written = 0;
        while self.sent < self.frames.len() {
            let entry = &mut self.frames[self.sent];
            let sealed = match &entry.sealed {
                Some(sealed) => sealed.clone(),
                None => {
                    let sealed = encoder.seal(&entry.frame)?;
                    entry.sealed = Some(sealed.clone());
                    sealed
                }
            };
            while entry.offset < sealed.len() {
                let n = conn.write(&sealed[entry.offset..]).await?;
                if n == 0 {
                    return Err(TransportError::SendFailed(
                        std::io::ErrorKind::WriteZero.into(),
                    ));
                }
                entry.offset += n;
                written += n;
            }
            if entry.sequenced() {
                self.sent += 1;
            } else if let Some(done) = self.frames.remove(self.sent) {
                self.cached -= done.frame.size();
            }
        }
        Ok(written)
    }

    /// Checks whether the buffer can resume from the peer's receive
    /// sequence, without changing anything.
    pub fn check_synchronization(&self, remote_recv_seq: u32) -> Result<(), TransportError> {
        let fail = |reason| TransportError::SyncFailed {
            remote_recv_seq,
            reason,
        };
        if seq_before(self.send_seq, remote_recv_seq) {
            return Err(fail("peer is ahead of our send sequence"));
        }
        // The frame the peer needs next must still be here.
        let first = self
            .frames
            .iter()
            .filter(|f| f.sequenced())
            .map(BufferedFrame::seq)
            .find(|&seq| !seq_before(seq, remote_recv_seq));
        match first {
            Some(seq) if seq != remote_recv_seq => Err(fail("frames were evicted")),
            None if remote_recv_seq != self.send_seq => Err(fail("frames were evicted")),
            _ => Ok(()),
        }
    }

    /// Prepares the buffer for a new connection.
    ///
    /// Drops the frames the peer already has and every unsequenced
    /// frame, forgets per-connection sealing state, and rewinds the
    /// cursor so the next [`write_to`](Self::write_to) replays from
    /// `remote_recv_seq`.
    pub fn synchronization(&mut self, remote_recv_seq: u32) -> Result<(), TransportError> {
        self.check_synchronization(remote_recv_seq)?;

        let before = self.frames.len();
        let mut cached = 0;
        self.frames.retain(|f| {
            let keep = f.sequenced() && !seq_before(f.seq(), remote_recv_seq);
            if keep {
                cached += f.frame.size();
            }
            keep
        });
        self.cached = cached;
        for frame in &mut self.frames {
            frame.sealed = None;
            frame.offset = 0;
        }
        self.sent = 0;
        self.counters.record_ack(remote_recv_seq);

        tracing::debug!(
            remote_recv_seq,
            dropped = before - self.frames.len(),
            replay = self.frames.len(),
            "sequenced buffer synchronized"
        );
        Ok(())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use arcgate_protocol::{Decoder, Flags, Msg, Payload};

    use crate::ConnectionId;

    /// Records every byte written; optionally accepts only a few bytes
    /// per call, or fails every write.
    #[derive(Default)]
    struct RecordingConn {
        written: StdMutex<Vec<u8>>,
        max_write: Option<usize>,
        broken: bool,
    }

    impl Conn for RecordingConn {
        async fn read(&self, _buf: &mut [u8]) -> Result<usize, TransportError> {
            Ok(0)
        }

        async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
            if self.broken {
                return Err(TransportError::SendFailed(std::io::ErrorKind::BrokenPipe.into()));
            }
            let n = self.max_write.map_or(data.len(), |max| data.len().min(max));
            self.written.lock().unwrap().extend_from_slice(&data[..n]);
            Ok(n)
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn id(&self) -> ConnectionId {
            ConnectionId::new(0)
        }
    }

    impl RecordingConn {
        fn decoded(&self) -> Vec<(u32, Msg)> {
            let mut decoder = Decoder::default();
            decoder.feed(&self.written.lock().unwrap());
            let mut out = Vec::new();
            while let Some(event) = decoder.fetch().unwrap() {
                out.push((event.head.seq, event.msg));
            }
            out
        }
    }

    fn data(n: u8) -> Msg {
        Msg::Payload(Payload {
            data: Bytes::from(vec![n; 4]),
        })
    }

    fn frame(encoder: &mut Encoder, flags: Flags, n: u8) -> PlainFrame {
        encoder.encode(flags, &data(n)).unwrap()
    }

    #[test]
    fn test_seq_before_wraps() {
        assert!(seq_before(1, 2));
        assert!(!seq_before(2, 2));
        assert!(seq_before(u32::MAX, 0));
        assert!(!seq_before(0, u32::MAX));
    }

    #[test]
    fn test_send_seq_advances_only_for_sequenced_frames() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY);
        let mut last = buffer.send_seq();
        for i in 0..10u8 {
            let flags = if i % 3 == 0 { Flags::NONE } else { Flags::SEQUENCED };
            buffer.write(frame(&mut encoder, flags, i)).unwrap();
            let now = buffer.send_seq();
            assert!(now == last || now == last + 1);
            assert_eq!(now != last, flags.is_sequenced());
            last = now;
        }
        assert_eq!(buffer.send_seq(), 6);
    }

    #[tokio::test]
    async fn test_write_to_keeps_sequenced_and_drops_unsequenced() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY);
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 1)).unwrap();
        buffer.write(frame(&mut encoder, Flags::NONE, 2)).unwrap();
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 3)).unwrap();

        let conn = RecordingConn::default();
        buffer.write_to(&conn, &mut encoder).await.unwrap();

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.unsent(), 0);
        let seqs: Vec<u32> = conn.decoded().into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![0, 0, 1]);
    }

    #[tokio::test]
    async fn test_partial_writes_resume_at_offset() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY);
        for i in 0..3 {
            buffer.write(frame(&mut encoder, Flags::SEQUENCED, i)).unwrap();
        }
        let conn = RecordingConn {
            max_write: Some(5),
            ..Default::default()
        };
        buffer.write_to(&conn, &mut encoder).await.unwrap();
        let msgs: Vec<Msg> = conn.decoded().into_iter().map(|(_, m)| m).collect();
        assert_eq!(msgs, vec![data(0), data(1), data(2)]);
    }

    #[tokio::test]
    async fn test_resume_replays_exactly_the_missing_frames() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::with_sequences(5, 0, DEFAULT_BUFFER_CAPACITY);
        for i in 5..=8 {
            buffer.write(frame(&mut encoder, Flags::SEQUENCED, i)).unwrap();
        }
        let first = RecordingConn::default();
        buffer.write_to(&first, &mut encoder).await.unwrap();

        // The peer only got 5 and 6 before the connection dropped.
        buffer.synchronization(7).unwrap();
        let second = RecordingConn::default();
        buffer.write_to(&second, &mut encoder).await.unwrap();

        let replayed = second.decoded();
        assert_eq!(replayed, vec![(7, data(7)), (8, data(8))]);
    }

    #[test]
    fn test_synchronization_drops_unsequenced_frames() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY);
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 0)).unwrap();
        buffer.write(frame(&mut encoder, Flags::NONE, 1)).unwrap();
        buffer.synchronization(0).unwrap();
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.cached(), frame(&mut encoder, Flags::SEQUENCED, 0).size());
    }

    #[test]
    fn test_synchronization_rejects_peer_ahead() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY);
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 0)).unwrap();
        assert!(matches!(
            buffer.synchronization(5),
            Err(TransportError::SyncFailed { remote_recv_seq: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_eviction_breaks_resume_from_before_it() {
        let mut encoder = Encoder::new();
        let one = frame(&mut encoder, Flags::SEQUENCED, 0).size();
        let mut buffer = SequencedBuffer::new(one * 3);
        let conn = RecordingConn::default();
        for i in 0..5 {
            buffer.write(frame(&mut encoder, Flags::SEQUENCED, i)).unwrap();
            buffer.write_to(&conn, &mut encoder).await.unwrap();
        }
        assert_eq!(buffer.evicted(), 2);
        assert!(buffer.cached() <= buffer.capacity());
        assert!(buffer.check_synchronization(0).is_err());
        assert!(buffer.check_synchronization(2).is_ok());
        assert!(buffer.check_synchronization(5).is_ok());
    }

    #[tokio::test]
    async fn test_sealed_unsent_frame_is_never_evicted() {
        let mut encoder = Encoder::new();
        let one = frame(&mut encoder, Flags::SEQUENCED, 0).size();
        let mut buffer = SequencedBuffer::new(one * 2);
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 0)).unwrap();
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 1)).unwrap();

        // Frame 0 gets sealed, then the write fails.
        let broken = RecordingConn {
            broken: true,
            ..Default::default()
        };
        assert!(buffer.write_to(&broken, &mut encoder).await.is_err());
        assert_eq!(buffer.unsent(), 2);

        assert!(matches!(
            buffer.write(frame(&mut encoder, Flags::SEQUENCED, 2)),
            Err(TransportError::BufferFull)
        ));
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.evicted(), 0);

        let conn = RecordingConn::default();
        buffer.write_to(&conn, &mut encoder).await.unwrap();
        let seqs: Vec<u32> = conn.decoded().into_iter().map(|(seq, _)| seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_acknowledged_frames_are_trimmed_on_write() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY);
        for i in 0..3 {
            buffer.write(frame(&mut encoder, Flags::SEQUENCED, i)).unwrap();
        }
        // Pretend everything was written, then the peer acks 2.
        buffer.sent = buffer.frames.len();
        let mut head = MsgHead::new(arcgate_protocol::MsgId::PAYLOAD, Flags::SEQUENCED);
        head.ack = 2;
        buffer.counters().validation(&head).unwrap();

        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 3)).unwrap();
        let seqs: Vec<u32> = buffer.frames.iter().map(BufferedFrame::seq).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[test]
    fn test_ack_beyond_send_seq_is_clamped() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(DEFAULT_BUFFER_CAPACITY);
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 0)).unwrap();
        buffer.sent = 1;
        let mut head = MsgHead::new(arcgate_protocol::MsgId::PAYLOAD, Flags::SEQUENCED);
        head.ack = 100;
        buffer.counters().validation(&head).unwrap();
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 1)).unwrap();
        // Frame 0 is acknowledged; frame 1 is new and stays.
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.send_seq(), 2);
    }

    #[test]
    fn test_frame_larger_than_capacity_is_rejected() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::new(8);
        assert!(matches!(
            buffer.write(frame(&mut encoder, Flags::SEQUENCED, 0)),
            Err(TransportError::FrameTooLarge { .. })
        ));
        assert_eq!(buffer.send_seq(), 0);
    }

    #[test]
    fn test_validation_accepts_in_order_and_flags_duplicates() {
        let counters = SequenceCounters::default();
        let mut head = MsgHead::new(arcgate_protocol::MsgId::PAYLOAD, Flags::SEQUENCED);
        assert_eq!(counters.validation(&head).unwrap(), Validation::Accepted);
        assert_eq!(counters.recv_seq(), 1);
        assert_eq!(counters.validation(&head).unwrap(), Validation::Duplicate);
        head.seq = 3;
        assert!(matches!(
            counters.validation(&head),
            Err(TransportError::SequenceAhead { expected: 1, received: 3 })
        ));
        let plain = MsgHead::new(arcgate_protocol::MsgId::HEARTBEAT, Flags::NONE);
        assert_eq!(counters.validation(&plain).unwrap(), Validation::Accepted);
        assert_eq!(counters.recv_seq(), 1);
    }

    #[test]
    fn test_stamped_ack_is_current_recv_seq() {
        let mut encoder = Encoder::new();
        let mut buffer = SequencedBuffer::with_sequences(0, 9, DEFAULT_BUFFER_CAPACITY);
        buffer.write(frame(&mut encoder, Flags::SEQUENCED, 0)).unwrap();
        assert_eq!(buffer.frames[0].frame.head.ack, 9);
    }
}
