//! Frame encoder and decoder.
//!
//! Encoding is split in two steps so the sequenced buffer can hold
//! frames before they are committed to a connection:
//!
//! 1. [`Encoder::encode`] serializes the body and compresses it. The
//!    result, a [`PlainFrame`], can be retained and replayed.
//! 2. [`Encoder::seal`] appends the MAC and encrypts. Stream ciphers
//!    carry state across frames, so sealing must happen in wire order,
//!    right before the bytes are written.
//!
//! [`Encoder::stuff`] does both and collects the output, for callers
//! that write immediately.
//!
//! The [`Decoder`] is the mirror image: feed it raw bytes in arbitrary
//! chunks and [`fetch`](Decoder::fetch) complete messages out of its
//! cache.

use std::ops::ControlFlow;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::cipher::EncryptionModule;
use crate::crypto::compression::CompressionModule;
use crate::crypto::mac::MacModule;
use crate::messages::Msg;
use crate::registry::MsgCreator;
use crate::types::{Event, Flags, MsgHead};
use crate::ProtocolError;

/// Bodies smaller than this are never compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 256;

/// Frames longer than this are rejected by the decoder.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 8 * 1024 * 1024;

/// An encoded frame that has not been sealed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainFrame {
    /// Head with caller flags plus `COMPRESSED`. `len` is filled in by
    /// [`Encoder::seal`]; `seq`/`ack` by whoever sequences the frame.
    pub head: MsgHead,
    /// Serialized (and possibly compressed) body.
    pub body: Bytes,
}

impl PlainFrame {
    /// Size of the frame before sealing.
    pub fn size(&self) -> usize {
        self.head.size() + self.body.len()
    }

    pub fn is_sequenced(&self) -> bool {
        self.head.flags.is_sequenced()
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// Turns messages into wire frames.
#[derive(Debug)]
pub struct Encoder {
    encryption: Option<EncryptionModule>,
    mac: Option<MacModule>,
    compression: Option<CompressionModule>,
    compression_threshold: usize,
    output: BytesMut,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// A plain encoder with no modules installed.
    pub fn new() -> Self {
        Self {
            encryption: None,
            mac: None,
            compression: None,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            output: BytesMut::new(),
        }
    }

    pub fn set_encryption(&mut self, module: Option<EncryptionModule>) {
        self.encryption = module;
    }

    pub fn set_mac(&mut self, module: Option<MacModule>) {
        self.mac = module;
    }

    pub fn set_compression(&mut self, module: Option<CompressionModule>, threshold: usize) {
        self.compression = module;
        self.compression_threshold = threshold;
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn is_compressing(&self) -> bool {
        self.compression.is_some()
    }

    /// Serializes `msg` and compresses it when worthwhile.
    ///
    /// `ENCRYPTED`, `MAC` and `COMPRESSED` are codec outputs; callers
    /// setting them must have the matching module installed, and the
    /// encoder decides the final value of each bit itself.
    pub fn encode(&mut self, flags: Flags, msg: &Msg) -> Result<PlainFrame, ProtocolError> {
        self.check_setup(flags)?;

        let mut body = BytesMut::with_capacity(msg.size());
        msg.write(&mut body);
        let mut body = body.freeze();
        let mut flags = flags.without(Flags::CODEC);

        if let Some(module) = &self.compression {
            if body.len() >= self.compression_threshold {
                let packed = module.compress(&body)?;
                if packed.len() < body.len() {
                    body = Bytes::from(packed);
                    flags |= Flags::COMPRESSED;
                }
            }
        }

        Ok(PlainFrame {
            head: MsgHead::new(msg.id(), flags),
            body,
        })
    }

    /// Applies the MAC and encryption and returns the finished frame.
    ///
    /// Each call advances stream cipher state, so a frame must be
    /// sealed exactly once per connection, in write order.
    pub fn seal(&mut self, frame: &PlainFrame) -> Result<Bytes, ProtocolError> {
        let mut head = frame.head;
        let payload = match self.encryption.as_mut() {
            Some(encryption) => {
                head.flags |= Flags::ENCRYPTED;
                let mut block = frame.body.to_vec();
                if let Some(mac) = &self.mac {
                    head.flags |= Flags::MAC;
                    mac.append(head.msg_id, head.flags, &mut block);
                }
                Bytes::from(encryption.transforming(&block)?)
            }
            None => frame.body.clone(),
        };

        let len = head.size() + payload.len();
        head.len = u32::try_from(len).map_err(|_| ProtocolError::PacketTooLarge {
            len,
            max: u32::MAX as usize,
        })?;

        let mut out = BytesMut::with_capacity(len);
        head.write(&mut out);
        out.put_slice(&payload);
        Ok(out.freeze())
    }

    /// Encodes and seals `msg` into the internal output buffer.
    pub fn stuff(&mut self, flags: Flags, msg: &Msg) -> Result<(), ProtocolError> {
        let frame = self.encode(flags, msg)?;
        let wire = self.seal(&frame)?;
        self.output.extend_from_slice(&wire);
        Ok(())
    }

    /// Bytes produced by [`stuff`](Self::stuff) and not taken yet.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    fn check_setup(&self, flags: Flags) -> Result<(), ProtocolError> {
        if flags.contains(Flags::ENCRYPTED) && self.encryption.is_none() {
            return Err(ProtocolError::ModuleNotConfigured("encryption"));
        }
        if flags.contains(Flags::MAC) && (self.mac.is_none() || self.encryption.is_none()) {
            return Err(ProtocolError::ModuleNotConfigured("mac"));
        }
        if flags.contains(Flags::COMPRESSED) && self.compression.is_none() {
            return Err(ProtocolError::ModuleNotConfigured("compression"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Reassembles frames from a byte stream.
#[derive(Debug)]
pub struct Decoder {
    creator: Arc<MsgCreator>,
    encryption: Option<EncryptionModule>,
    mac: Option<MacModule>,
    compression: Option<CompressionModule>,
    cache: BytesMut,
    max_packet_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(Arc::new(MsgCreator::default()))
    }
}

impl Decoder {
    pub fn new(creator: Arc<MsgCreator>) -> Self {
        Self {
            creator,
            encryption: None,
            mac: None,
            compression: None,
            cache: BytesMut::new(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }

    pub fn set_encryption(&mut self, module: Option<EncryptionModule>) {
        self.encryption = module;
    }

    pub fn set_mac(&mut self, module: Option<MacModule>) {
        self.mac = module;
    }

    pub fn set_compression(&mut self, module: Option<CompressionModule>) {
        self.compression = module;
    }

    pub fn creator(&self) -> &Arc<MsgCreator> {
        &self.creator
    }

    /// Appends raw bytes to the cache.
    pub fn feed(&mut self, data: &[u8]) {
        self.cache.extend_from_slice(data);
    }

    /// Bytes buffered but not decoded yet.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Drops any partially received frame.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Decodes the next complete frame.
    ///
    /// `Ok(None)` means the cache does not hold a whole frame yet. Any
    /// error leaves the stream unusable: the offending frame has been
    /// consumed and stream ciphers may have advanced.
    pub fn fetch(&mut self) -> Result<Option<Event>, ProtocolError> {
        let Some(head) = MsgHead::peek(&self.cache)? else {
            return Ok(None);
        };
        let len = head.len as usize;
        if len > self.max_packet_size {
            return Err(ProtocolError::PacketTooLarge {
                len,
                max: self.max_packet_size,
            });
        }
        if self.cache.len() < len {
            return Ok(None);
        }
        let frame = self.cache.split_to(len);
        self.unpack(head, &frame[head.size()..]).map(Some)
    }

    /// Fetches frames until the cache runs dry or `consumer` breaks.
    pub fn multi_fetch<F>(&mut self, mut consumer: F) -> Result<(), ProtocolError>
    where
        F: FnMut(Event) -> ControlFlow<()>,
    {
        while let Some(event) = self.fetch()? {
            if consumer(event).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn unpack(&mut self, head: MsgHead, body: &[u8]) -> Result<Event, ProtocolError> {
        let flags = head.flags;
        let mut payload = if flags.contains(Flags::ENCRYPTED) {
            let encryption = self
                .encryption
                .as_mut()
                .ok_or(ProtocolError::ModuleNotConfigured("encryption"))?;
            let mut plain = encryption.transforming(body)?;
            match (&self.mac, flags.contains(Flags::MAC)) {
                (Some(mac), true) => mac.verify_and_strip(head.msg_id, flags, &mut plain)?,
                // A peer that negotiated a MAC never omits it.
                (Some(_), false) => return Err(ProtocolError::MacMismatch),
                (None, true) => return Err(ProtocolError::ModuleNotConfigured("mac")),
                (None, false) => {}
            }
            plain
        } else if flags.contains(Flags::MAC) {
            return Err(ProtocolError::MalformedHead("MAC flag without encryption"));
        } else {
            body.to_vec()
        };

        if flags.contains(Flags::COMPRESSED) {
            let compression = self
                .compression
                .as_ref()
                .ok_or(ProtocolError::ModuleNotConfigured("compression"))?;
            payload = compression.uncompress(&payload)?;
        }

        let msg = self.creator.create(head.msg_id, &payload)?;
        Ok(Event { head, msg })
    }
}

// =========================================================================
// Tests
// =========================================================================
