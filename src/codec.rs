// ABOUTME: Payload Codec (C1) - a LIFO byte buffer for building and consuming frame bodies
// ABOUTME: Owns the wire size-header encoding; leaves PDU-level schemas to the caller

use crate::message::MessageId;
use bytes::{Buf, BufMut, BytesMut};
use std::convert::TryFrom;
use thiserror::Error;

/// Width, in bytes, of the frame's size header on the wire.
pub const HEADER_SIZE: usize = 8;

/// Errors raised while pushing to, or popping from, a [`Payload`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// A `pop_*` call needed more bytes than remain in the buffer.
    #[error("payload underflow: needed {needed} bytes, had {available}")]
    Underflow { needed: usize, available: usize },

    /// A popped `u32` did not map to a valid message id.
    #[error("invalid message id: {0:#x}")]
    InvalidMessageId(u32),

    /// A popped byte sequence was not valid UTF-8.
    #[error("invalid utf-8 in popped string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// A type that can be pushed to, and popped from, a [`Payload`] as a
/// trivially-copyable fixed-width scalar, in little-endian byte order.
pub trait Primitive: Sized + Copy {
    const WIDTH: usize;
    fn to_le_bytes_vec(self) -> Vec<u8>;
    fn from_le_slice(bytes: &[u8]) -> Self;
}

macro_rules! impl_primitive {
    ($t:ty) => {
        impl Primitive for $t {
            const WIDTH: usize = std::mem::size_of::<$t>();

            fn to_le_bytes_vec(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }

            fn from_le_slice(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_primitive!(u8);
impl_primitive!(u16);
impl_primitive!(u32);
impl_primitive!(u64);
impl_primitive!(i8);
impl_primitive!(i16);
impl_primitive!(i32);
impl_primitive!(i64);
impl_primitive!(f32);
impl_primitive!(f64);

impl Primitive for bool {
    const WIDTH: usize = 1;

    fn to_le_bytes_vec(self) -> Vec<u8> {
        vec![self as u8]
    }

    fn from_le_slice(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// An opaque, bidirectional byte buffer holding one frame's body.
///
/// `push_*` and `pop_*` behave as a stack: each push prepends its encoded
/// bytes to the front of the buffer, so the most recently pushed value is
/// the first one popped (LIFO) *and* the first bytes on the wire. Owners
/// that want the message id to be "the first value extractable" (§3) push
/// it last, after every other field.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    buf: Vec<u8>,
}

impl Payload {
    /// An empty payload, ready for fields to be pushed.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Wrap raw bytes received off the wire as a payload ready for popping.
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Current body length in bytes, matching the size field sent on the wire.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the body bytes for framing; this is exactly what travels on
    /// the wire after the size header.
    pub fn raw_view(&self) -> &[u8] {
        &self.buf
    }

    fn prepend(&mut self, chunk: &[u8]) {
        let mut next = Vec::with_capacity(chunk.len() + self.buf.len());
        next.extend_from_slice(chunk);
        next.extend_from_slice(&self.buf);
        self.buf = next;
    }

    /// Push a fixed-width scalar, encoded little-endian.
    pub fn push<T: Primitive>(&mut self, value: T) {
        let bytes = value.to_le_bytes_vec();
        self.prepend(&bytes);
    }

    /// Pop a fixed-width scalar from the front of the buffer.
    pub fn pop<T: Primitive>(&mut self) -> Result<T, CodecError> {
        if self.buf.len() < T::WIDTH {
            return Err(CodecError::Underflow {
                needed: T::WIDTH,
                available: self.buf.len(),
            });
        }
        let value = T::from_le_slice(&self.buf[..T::WIDTH]);
        self.buf.drain(..T::WIDTH);
        Ok(value)
    }

    /// Push a variable-length byte sequence as `u32` length + bytes.
    pub fn push_bytes(&mut self, data: &[u8]) {
        let mut chunk = Vec::with_capacity(4 + data.len());
        chunk.extend_from_slice(&(data.len() as u32).to_le_bytes());
        chunk.extend_from_slice(data);
        self.prepend(&chunk);
    }

    /// Pop a variable-length byte sequence from the front of the buffer.
    pub fn pop_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        if self.buf.len() < 4 {
            return Err(CodecError::Underflow {
                needed: 4,
                available: self.buf.len(),
            });
        }
        let len = u32::from_le_bytes(self.buf[..4].try_into().unwrap()) as usize;
        let total = 4 + len;
        if self.buf.len() < total {
            return Err(CodecError::Underflow {
                needed: total,
                available: self.buf.len(),
            });
        }
        let data = self.buf[4..total].to_vec();
        self.buf.drain(..total);
        Ok(data)
    }

    /// Push a UTF-8 string as a variable-length byte sequence.
    pub fn push_str(&mut self, value: &str) {
        self.push_bytes(value.as_bytes());
    }

    /// Pop a UTF-8 string from the front of the buffer.
    pub fn pop_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.pop_bytes()?;
        Ok(String::from_utf8(bytes)?)
    }

    /// Push a message id. Owners push this *last* so dispatch can pop it
    /// first, satisfying the "first value extractable is the message id"
    /// invariant.
    pub fn push_id<M: MessageId>(&mut self, id: M) {
        self.push::<u32>(id.into());
    }

    /// Pop a message id from the front of the buffer.
    pub fn pop_id<M: MessageId>(&mut self) -> Result<M, CodecError> {
        let raw = self.pop::<u32>()?;
        M::try_from(raw).map_err(|_| CodecError::InvalidMessageId(raw))
    }
}

/// Encode a body size into the fixed-width wire header.
pub fn encode_header(size: u64) -> [u8; HEADER_SIZE] {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_u64_le(size);
    let mut out = [0u8; HEADER_SIZE];
    out.copy_from_slice(&buf);
    out
}

/// Decode the fixed-width wire header back into a body size.
pub fn decode_header(bytes: &[u8; HEADER_SIZE]) -> u64 {
    let mut buf = &bytes[..];
    buf.get_u64_le()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::test_ids::DemoId;

    #[test]
    fn header_round_trip() {
        let encoded = encode_header(1234);
        assert_eq!(decode_header(&encoded), 1234);
    }

    #[test]
    fn scalar_round_trip_is_lifo() {
        let mut payload = Payload::new();
        payload.push::<u32>(7); // id, pushed last by convention
        payload.push::<u32>(42);
        payload.push_str("ab");

        // Reconstruct from the raw wire bytes, as a receiver would.
        let mut received = Payload::from_bytes(payload.raw_view().to_vec());
        assert_eq!(received.pop_string().unwrap(), "ab");
        assert_eq!(received.pop::<u32>().unwrap(), 42);
        assert_eq!(received.pop::<u32>().unwrap(), 7);
    }

    #[test]
    fn encode_decode_is_byte_equal() {
        let mut payload = Payload::new();
        payload.push::<u32>(1);
        payload.push_bytes(b"hello");

        let bytes = payload.raw_view().to_vec();
        let decoded = Payload::from_bytes(bytes.clone());
        assert_eq!(decoded.raw_view(), bytes.as_slice());
    }

    #[test]
    fn message_id_is_first_extractable_when_pushed_last() {
        let mut payload = Payload::new();
        payload.push_str("hello");
        payload.push_id(DemoId::MessageRequest);

        let mut received = Payload::from_bytes(payload.raw_view().to_vec());
        let id: DemoId = received.pop_id().unwrap();
        assert_eq!(id, DemoId::MessageRequest);
        assert_eq!(received.pop_string().unwrap(), "hello");
    }

    #[test]
    fn pop_underflow_is_reported() {
        let mut payload = Payload::new();
        payload.push::<u8>(1);
        let err = payload.pop::<u32>().unwrap_err();
        assert!(matches!(err, CodecError::Underflow { .. }));
    }

    #[test]
    fn invalid_message_id_is_reported() {
        let mut payload = Payload::new();
        payload.push::<u32>(0xDEAD_BEEF);
        let err = payload.pop_id::<DemoId>().unwrap_err();
        assert!(matches!(err, CodecError::InvalidMessageId(0xDEAD_BEEF)));
    }
}
