//! The six wire variants exchanged over a tunnel's control channel, and
//! their binary encoding: a 1-byte variant tag followed by a
//! bincode-serialized payload. The 4-byte big-endian length prefix that
//! precedes `tag + payload` on the wire is the job of
//! [`crate::codec::FrameCodec`], not of this module — `Frame` itself
//! only knows how to turn into and out of a tagged byte buffer.

use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type CorrelationId = Uuid;

/// The tunnel protocol a client registered for at handshake time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelProtocol {
    Http,
    Tcp,
    Tls,
    Udp,
}

impl TunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Tls => "tls",
            TunnelProtocol::Udp => "udp",
        }
    }

    pub fn is_l4(&self) -> bool {
        !matches!(self, TunnelProtocol::Http)
    }
}

impl std::str::FromStr for TunnelProtocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(TunnelProtocol::Http),
            "tcp" => Ok(TunnelProtocol::Tcp),
            "tls" => Ok(TunnelProtocol::Tls),
            "udp" => Ok(TunnelProtocol::Udp),
            _ => Err(()),
        }
    }
}

/// Stable error-kind taxonomy carried by a terminal `ERROR` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionRefused,
    LocalTimeout,
    LocalError,
    BadResponse,
}

/// `REQUEST { correlation_id, method, path, query, headers, body_bytes, remote_addr }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub correlation_id: CorrelationId,
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_addr: String,
}

/// `STREAM_CHUNK { correlation_id, seq, payload, fin }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunkFrame {
    pub correlation_id: CorrelationId,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub fin: bool,
}

/// `RESPONSE_HEAD { correlation_id, status_code, headers }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseHeadFrame {
    pub correlation_id: CorrelationId,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
}

/// `ERROR { correlation_id, kind, message }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub correlation_id: CorrelationId,
    pub kind: ErrorKind,
    pub message: String,
}

/// `PONG { nonce }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongFrame {
    pub nonce: u64,
}

/// All wire messages exchanged over a tunnel's duplex control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Request(RequestFrame),
    StreamChunk(StreamChunkFrame),
    ResponseHead(ResponseHeadFrame),
    Error(ErrorFrame),
    Ping,
    Pong(PongFrame),
}

const TAG_REQUEST: u8 = 1;
const TAG_STREAM_CHUNK: u8 = 2;
const TAG_RESPONSE_HEAD: u8 = 3;
const TAG_ERROR: u8 = 4;
const TAG_PING: u8 = 5;
const TAG_PONG: u8 = 6;

impl Frame {
    /// Correlation id this frame belongs to, if any (`PING`/`PONG` carry none).
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Frame::Request(f) => Some(f.correlation_id),
            Frame::StreamChunk(f) => Some(f.correlation_id),
            Frame::ResponseHead(f) => Some(f.correlation_id),
            Frame::Error(f) => Some(f.correlation_id),
            Frame::Ping | Frame::Pong(_) => None,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Frame::Request(_) => TAG_REQUEST,
            Frame::StreamChunk(_) => TAG_STREAM_CHUNK,
            Frame::ResponseHead(_) => TAG_RESPONSE_HEAD,
            Frame::Error(_) => TAG_ERROR,
            Frame::Ping => TAG_PING,
            Frame::Pong(_) => TAG_PONG,
        }
    }

    /// Serializes `tag + payload` (no length prefix — see module docs).
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = vec![self.tag()];
        match self {
            Frame::Request(f) => bincode::serialize_into(&mut out, f),
            Frame::StreamChunk(f) => bincode::serialize_into(&mut out, f),
            Frame::ResponseHead(f) => bincode::serialize_into(&mut out, f),
            Frame::Error(f) => bincode::serialize_into(&mut out, f),
            Frame::Ping => Ok(()),
            Frame::Pong(f) => bincode::serialize_into(&mut out, f),
        }
        .map_err(FrameError::Encode)?;
        Ok(out)
    }

    /// Parses `tag + payload` back into a [`Frame`]. Inverse of [`Frame::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        let (&tag, payload) = bytes.split_first().ok_or(FrameError::UnknownTag(0))?;
        Ok(match tag {
            TAG_REQUEST => Frame::Request(bincode::deserialize(payload).map_err(FrameError::Decode)?),
            TAG_STREAM_CHUNK => {
                Frame::StreamChunk(bincode::deserialize(payload).map_err(FrameError::Decode)?)
            }
            TAG_RESPONSE_HEAD => {
                Frame::ResponseHead(bincode::deserialize(payload).map_err(FrameError::Decode)?)
            }
            TAG_ERROR => Frame::Error(bincode::deserialize(payload).map_err(FrameError::Decode)?),
            TAG_PING => Frame::Ping,
            TAG_PONG => Frame::Pong(bincode::deserialize(payload).map_err(FrameError::Decode)?),
            other => return Err(FrameError::UnknownTag(other)),
        })
    }
}

/// Hop-by-hop headers stripped before forwarding or replaying a request.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "transfer-encoding",
    "keep-alive",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str()) || lower.starts_with("proxy-")
}
