use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Transport frame header: channel ID (4 bytes, big-endian).
pub const CHANNEL_ID_SIZE: usize = 4;

/// A reassembled stream routed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The channel this stream belongs to.
    pub channel: u32,
    /// The stream payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        CHANNEL_ID_SIZE + self.payload.len()
    }

    /// Encode into a freshly allocated stream.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.wire_size());
        encode_frame(self.channel, &self.payload, &mut dst);
        dst.freeze()
    }
}

/// Encode a frame into the transport wire format.
///
/// Wire format:
/// ```text
/// ┌───────────────────┬──────────────────────┐
/// │ Channel ID (4B BE)│ Payload (rest)       │
/// └───────────────────┴──────────────────────┘
/// ```
///
/// There is no length prefix; the link layer delimits streams.
pub fn encode_frame(channel: u32, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(CHANNEL_ID_SIZE + payload.len());
    dst.put_u32(channel);
    dst.put_slice(payload);
}

/// Decode a frame from one complete link-layer stream.
///
/// Fails with [`FrameError::Truncated`] if the stream is shorter than the
/// channel header.
pub fn decode_frame(mut stream: Bytes) -> Result<Frame> {
    let channel = stream.take_u32()?;
    Ok(Frame {
        channel,
        payload: stream,
    })
}

/// Checked big-endian field readers over a received buffer.
///
/// Every method consumes what it decodes and fails instead of panicking
/// when the buffer is too short.
pub trait WireRead {
    /// Read one byte.
    fn take_u8(&mut self) -> Result<u8>;
    /// Read an unsigned 32-bit integer.
    fn take_u32(&mut self) -> Result<u32>;
    /// Read a signed 32-bit integer.
    fn take_i32(&mut self) -> Result<i32>;
    /// Read an unsigned 64-bit integer.
    fn take_u64(&mut self) -> Result<u64>;
    /// Read a NUL-terminated string, consuming the terminator.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    fn take_cstring(&mut self) -> Result<String>;
    /// Take everything that is left.
    fn take_rest(&mut self) -> Bytes;
}

impl WireRead for Bytes {
    fn take_u8(&mut self) -> Result<u8> {
        ensure(self, 1)?;
        Ok(self.get_u8())
    }

    fn take_u32(&mut self) -> Result<u32> {
        ensure(self, 4)?;
        Ok(self.get_u32())
    }

    fn take_i32(&mut self) -> Result<i32> {
        ensure(self, 4)?;
        Ok(self.get_i32())
    }

    fn take_u64(&mut self) -> Result<u64> {
        ensure(self, 8)?;
        Ok(self.get_u64())
    }

    fn take_cstring(&mut self) -> Result<String> {
        let end = self
            .iter()
            .position(|&b| b == 0)
            .ok_or(FrameError::MissingTerminator)?;
        let raw = self.split_to(end);
        self.advance(1);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn take_rest(&mut self) -> Bytes {
        self.split_off(0)
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Writer-side counterpart of [`WireRead`] for the fields `BufMut` lacks.
pub trait WireWrite: BufMut {
    /// Write `value` followed by a NUL terminator.
    fn put_cstring(&mut self, value: &str) {
        self.put_slice(value.as_bytes());
        self.put_u8(0);
    }
}

impl<B: BufMut> WireWrite for B {}
