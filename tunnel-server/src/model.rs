//! Data model: `Tunnel`, `RequestRecord`, `CustomDomain`.
//!
//! These types are plain data — no behaviour lives here beyond small
//! constructors and the invariant checks cheap enough to assert inline.
//! Ownership rules are enforced by the modules that hold these values
//! (`Registry`, `RequestLog`), not by the types themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tunnel_protocol::{ErrorKind, TunnelProtocol};
use uuid::Uuid;

pub type TunnelId = Uuid;
pub type UserId = Uuid;
pub type RequestId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Inactive,
}

/// A single client registration (`Tunnel`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tunnel {
    pub id: TunnelId,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    pub local_url: String,
    pub public_url: String,
    pub custom_domain: Option<String>,
    pub owner_user_id: Option<UserId>,
    pub status: TunnelStatus,
    pub allocated_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub active_since: Option<DateTime<Utc>>,
}

impl Tunnel {
    /// `protocol != http` implies `allocated_port` is set (invariant).
    pub fn check_invariants(&self) -> bool {
        if self.protocol.is_l4() {
            self.allocated_port.is_some()
        } else {
            true
        }
    }
}

/// The terminal outcome of a proxied HTTP call (invariant: either the
/// response fields are all present or an `error_kind` replaces them).
///
/// A client that sends a response head and some body, then vanishes
/// before the terminal chunk, produces a record with *both* a
/// `status_code` and an `error_kind` — neither a clean `Response` nor
/// a headless `Error` fits that shape, so it gets its own `Partial`
/// variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestOutcome {
    /// Head and a final chunk both arrived; no error.
    Response {
        status_code: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        /// `true` if `body` was truncated to `log_body_cap` bytes.
        truncated: bool,
        /// Size of the body as reported by the origin, pre-truncation.
        reported_size: usize,
    },
    /// Head arrived and some body bytes streamed, but the session ended
    /// (or the deadline fired) before a terminal chunk.
    Partial {
        status_code: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
        truncated: bool,
        reported_size: usize,
        error_kind: ErrorKind,
    },
    /// No head was ever sent.
    Error { error_kind: ErrorKind },
}

/// One captured proxied HTTP call (`RequestRecord`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: RequestId,
    pub tunnel_id: TunnelId,
    pub correlation_id: Uuid,
    pub method: String,
    pub path: String,
    pub query_string: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_addr: String,
    pub user_agent: Option<String>,
    pub received_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcome: RequestOutcome,
}

impl RequestRecord {
    pub fn latency_ms(&self) -> i64 {
        (self.completed_at - self.received_at).num_milliseconds().max(0)
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.outcome {
            RequestOutcome::Response { status_code, .. } => Some(*status_code),
            RequestOutcome::Partial { status_code, .. } => Some(*status_code),
            RequestOutcome::Error { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            RequestOutcome::Error { error_kind } => Some(*error_kind),
            RequestOutcome::Partial { error_kind, .. } => Some(*error_kind),
            RequestOutcome::Response { .. } => None,
        }
    }

    /// invariant: `completed_at >= received_at`.
    pub fn check_invariants(&self) -> bool {
        self.completed_at >= self.received_at
    }
}

/// Filter + pagination for `list_request_records` (`list`).
#[derive(Debug, Clone, Default)]
pub struct RequestRecordFilter {
    pub method: Option<String>,
    pub path: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// `{ id, user_id, domain, verified, dns_configured }` (`CustomDomain`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomDomain {
    pub id: Uuid,
    pub user_id: UserId,
    pub domain: String,
    pub verified: bool,
    pub dns_configured: bool,
}
