//! Primitive field encoding shared by every message body.
//!
//! Integers are big-endian. Byte strings and text are prefixed with a
//! `u32` length. Reading is bounds-checked: a short body yields
//! [`ProtocolError::Truncated`] instead of a panic, because bodies come
//! straight off the network.

use bytes::{BufMut, Bytes, BytesMut};

use crate::ProtocolError;

/// Size of the length prefix in front of byte strings and text.
pub const LEN_PREFIX: usize = 4;

/// A cursor over one message body.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Wraps a message body.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes not consumed yet.
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() < n {
            return Err(ProtocolError::Truncated {
                needed: n,
                remaining: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.array().map(u16::from_be_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.array().map(u32::from_be_bytes)
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.array().map(i32::from_be_bytes)
    }

    pub fn i64(&mut self) -> Result<i64, ProtocolError> {
        self.array().map(i64::from_be_bytes)
    }

    /// Reads a one-byte wire enum.
    pub fn tag<T>(&mut self) -> Result<T, ProtocolError>
    where
        T: TryFrom<u8, Error = ProtocolError>,
    {
        T::try_from(self.u8()?)
    }

    /// Reads a length-prefixed byte string.
    pub fn bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let len = self.u32()? as usize;
        self.take(len).map(Bytes::copy_from_slice)
    }

    /// Reads length-prefixed UTF-8 text.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidValue {
            field: "string",
            value: len as u64,
        })
    }

    /// Consumes everything that is left.
    pub fn rest(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.data);
        self.data = &[];
        rest
    }

    /// Fails if the body was not consumed completely.
    pub fn finish(self) -> Result<(), ProtocolError> {
        match self.data.len() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

/// Writes a length-prefixed byte string.
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Writes length-prefixed UTF-8 text.
pub fn put_string(buf: &mut BytesMut, text: &str) {
    put_bytes(buf, text.as_bytes());
}
