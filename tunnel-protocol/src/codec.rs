//! Turns a raw duplex byte stream into a stream of [`Frame`]s using a
//! 4-byte big-endian length prefix covering `tag + payload`, followed by
//! the tagged, bincode-encoded payload itself. Usable with
//! `tokio_util::codec::Framed` over anything that is `AsyncRead +
//! AsyncWrite` — a raw TCP+TLS stream, or (as the edge does) the byte
//! payload of a single WebSocket binary message.

use crate::error::FrameError;
use crate::frame::Frame;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const LENGTH_PREFIX_BYTES: usize = 4;

/// Codec pairing `Frame` with the length-prefixed wire format.
///
/// `max_frame_len` bounds the `tag + payload` length read off the wire;
/// exceeding it tears down the session with [`FrameError::TooLarge`]
/// rather than growing the read buffer unboundedly — the same
/// deliberate backpressure applies here as to a session's in-flight
/// byte cap.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        // 32 MiB matches the default session inflight-bytes cap; a
        // single frame should never need to exceed the whole session
        // budget.
        Self::new(32 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..LENGTH_PREFIX_BYTES].try_into().unwrap()) as usize;
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge(len, self.max_frame_len));
        }
        if src.len() < LENGTH_PREFIX_BYTES + len {
            src.reserve(LENGTH_PREFIX_BYTES + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_BYTES);
        let payload = src.split_to(len);
        Frame::decode(&payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = item.encode()?;
        if body.len() > self.max_frame_len {
            return Err(FrameError::TooLarge(body.len(), self.max_frame_len));
        }
        dst.reserve(LENGTH_PREFIX_BYTES + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PongFrame;

    #[test]
    fn encode_then_decode_recovers_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        let frame = Frame::Pong(PongFrame { nonce: 7 });
        codec.encode(frame.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::Ping, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        // Pong's body (tag + 8-byte nonce) is 9 bytes, over the 4-byte cap.
        let big = Frame::Pong(PongFrame { nonce: u64::MAX });
        assert!(codec.encode(big, &mut buf).is_err());
    }
}
