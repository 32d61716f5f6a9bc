//! Wire framing shared between tunnel clients and the tunnel edge server.
//!
//! This crate owns exactly one concern: the byte-level contract of the
//! tunnel control channel. It has no opinion on transport (WebSocket,
//! raw TCP+TLS, anything `AsyncRead + AsyncWrite`) and no opinion on
//! what either side does with a decoded [`Frame`].

mod codec;
mod error;
mod frame;

pub use codec::FrameCodec;
pub use error::FrameError;
pub use frame::{
    is_hop_by_hop, CorrelationId, ErrorFrame, ErrorKind, Frame, PongFrame, RequestFrame,
    ResponseHeadFrame, StreamChunkFrame, TunnelProtocol, HOP_BY_HOP_HEADERS,
};
