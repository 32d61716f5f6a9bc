//! Public HTTP Proxy: turns an inbound HTTP request at the
//! edge into a `REQUEST` frame over the matching tunnel session, waits
//! for the `RESPONSE_HEAD` + `STREAM_CHUNK`s that answer it (or a
//! terminal `ERROR`), and finalizes one `RequestRecord` either way.
//!
//! [`dispatch_request`] is the shared core: the axum handler below uses
//! it to serve a live browser request, and `request_log::replay` reuses
//! it verbatim to re-fire a stored request through whatever session is
//! currently active.

use crate::app_state::AppState;
use crate::deps::Deps;
use crate::error::ServiceError;
use crate::errors_page::{
    connection_refused_page, local_error_page, local_timeout_page, not_found_page,
    tunnel_disconnected_page, wrong_protocol_page,
};
use crate::model::{RequestOutcome, RequestRecord, TunnelId};
use crate::session::{PendingEvent, Session};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tunnel_protocol::{is_hop_by_hop, ErrorKind, Frame, RequestFrame, TunnelProtocol};
use uuid::Uuid;

/// A request about to be sent down a tunnel session — built either from
/// a live inbound HTTP request or reconstructed from a stored
/// `RequestRecord` for replay.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_addr: String,
    pub user_agent: Option<String>,
}

/// Everything a caller needs after a round trip: the record to log, and
/// (when the origin answered at all) the bytes to forward downstream.
pub struct DispatchOutcome {
    pub record: RequestRecord,
    pub forward_status: Option<u16>,
    pub forward_headers: Vec<(String, String)>,
    pub forward_body: Vec<u8>,
}

/// Request bodies above the inline threshold are split into frames of
/// this size when streamed as `STREAM_CHUNK`s following the `REQUEST`
/// frame.
const REQUEST_CHUNK_SIZE: usize = 64 * 1024;

/// Disarms itself once the wait for a response is over; if the
/// surrounding future is dropped while still armed — the downstream
/// client went away mid-request — it cancels the pending sink in the
/// background.
struct CancelOnDrop {
    session: Arc<Session>,
    correlation_id: Uuid,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let session = self.session.clone();
            let correlation_id = self.correlation_id;
            tokio::spawn(async move {
                session.cancel_pending(&correlation_id, "client gone").await;
            });
        }
    }
}

/// Sends `outbound` as a `REQUEST` (inline or streamed per the inline
/// body threshold), waits up to the configured request deadline for a
/// terminal answer, and returns both the `RequestRecord` to log and the
/// bytes to forward to the downstream client, if any arrived.
pub async fn dispatch_request(
    session: &Arc<Session>,
    tunnel_id: TunnelId,
    outbound: OutboundRequest,
    deps: &Deps,
) -> DispatchOutcome {
    let config = deps.config.clone();
    let received_at = deps.clock.now();
    let correlation_id = Uuid::new_v4();
    let mut rx = session.register_pending(correlation_id);
    let mut guard = CancelOnDrop {
        session: session.clone(),
        correlation_id,
        armed: true,
    };

    let send_result = send_request(session, correlation_id, &outbound, config.inline_body_threshold);

    if let Err(err) = send_result {
        guard.armed = false;
        session.remove_pending(&correlation_id);
        let completed_at = deps.clock.now();
        return DispatchOutcome {
            record: error_record(
                tunnel_id,
                correlation_id,
                &outbound,
                received_at,
                completed_at,
                error_kind_for(&err),
            ),
            forward_status: None,
            forward_headers: Vec::new(),
            forward_body: Vec::new(),
        };
    }

    let drained = tokio::time::timeout(config.request_deadline, drain(&mut rx, config.log_body_cap)).await;
    guard.armed = false;
    session.remove_pending(&correlation_id);
    let completed_at = deps.clock.now();

    match drained {
        Err(_elapsed) => DispatchOutcome {
            record: error_record(
                tunnel_id,
                correlation_id,
                &outbound,
                received_at,
                completed_at,
                ErrorKind::LocalTimeout,
            ),
            forward_status: None,
            forward_headers: Vec::new(),
            forward_body: Vec::new(),
        },
        Ok(Drained::Error(kind)) => DispatchOutcome {
            record: error_record(tunnel_id, correlation_id, &outbound, received_at, completed_at, kind),
            forward_status: None,
            forward_headers: Vec::new(),
            forward_body: Vec::new(),
        },
        Ok(Drained::Complete {
            status_code,
            headers,
            full_body,
            log_body,
            truncated,
        }) => {
            let record = RequestRecord {
                id: Uuid::new_v4(),
                tunnel_id,
                correlation_id,
                method: outbound.method.clone(),
                path: outbound.path.clone(),
                query_string: outbound.query.clone(),
                headers: outbound.headers.clone(),
                body: outbound.body.clone(),
                remote_addr: outbound.remote_addr.clone(),
                user_agent: outbound.user_agent.clone(),
                received_at,
                completed_at,
                outcome: RequestOutcome::Response {
                    status_code,
                    headers: headers.clone(),
                    body: log_body,
                    truncated,
                    reported_size: full_body.len(),
                },
            };
            DispatchOutcome {
                record,
                forward_status: Some(status_code),
                forward_headers: headers,
                forward_body: full_body,
            }
        }
        Ok(Drained::Partial {
            status_code,
            headers,
            full_body,
            log_body,
            truncated,
            error_kind,
        }) => {
            let record = RequestRecord {
                id: Uuid::new_v4(),
                tunnel_id,
                correlation_id,
                method: outbound.method.clone(),
                path: outbound.path.clone(),
                query_string: outbound.query.clone(),
                headers: outbound.headers.clone(),
                body: outbound.body.clone(),
                remote_addr: outbound.remote_addr.clone(),
                user_agent: outbound.user_agent.clone(),
                received_at,
                completed_at,
                outcome: RequestOutcome::Partial {
                    status_code,
                    headers: headers.clone(),
                    body: log_body,
                    truncated,
                    reported_size: full_body.len(),
                    error_kind,
                },
            };
            DispatchOutcome {
                record,
                forward_status: Some(status_code),
                forward_headers: headers,
                forward_body: full_body,
            }
        }
    }
}

fn send_request(
    session: &Arc<Session>,
    correlation_id: Uuid,
    outbound: &OutboundRequest,
    inline_threshold: usize,
) -> Result<(), ServiceError> {
    if outbound.body.len() <= inline_threshold {
        return session.send_frame(Frame::Request(RequestFrame {
            correlation_id,
            method: outbound.method.clone(),
            path: outbound.path.clone(),
            query: outbound.query.clone(),
            headers: outbound.headers.clone(),
            body: outbound.body.clone(),
            remote_addr: outbound.remote_addr.clone(),
        }));
    }

    session.send_frame(Frame::Request(RequestFrame {
        correlation_id,
        method: outbound.method.clone(),
        path: outbound.path.clone(),
        query: outbound.query.clone(),
        headers: outbound.headers.clone(),
        body: Vec::new(),
        remote_addr: outbound.remote_addr.clone(),
    }))?;

    let chunks: Vec<&[u8]> = outbound.body.chunks(REQUEST_CHUNK_SIZE).collect();
    let last = chunks.len().saturating_sub(1);
    for (seq, chunk) in chunks.iter().enumerate() {
        session.send_frame(Frame::StreamChunk(tunnel_protocol::StreamChunkFrame {
            correlation_id,
            seq: seq as u64,
            payload: chunk.to_vec(),
            fin: seq == last,
        }))?;
    }
    Ok(())
}

enum Drained {
    Error(ErrorKind),
    Complete {
        status_code: u16,
        headers: Vec<(String, String)>,
        full_body: Vec<u8>,
        log_body: Vec<u8>,
        truncated: bool,
    },
    Partial {
        status_code: u16,
        headers: Vec<(String, String)>,
        full_body: Vec<u8>,
        log_body: Vec<u8>,
        truncated: bool,
        error_kind: ErrorKind,
    },
}

/// Consumes events off a pending sink until a terminal outcome is
/// reached: a clean `fin` chunk, a terminal `ERROR`, or the sink
/// closing without one (treated as a disconnect).
async fn drain(rx: &mut mpsc::Receiver<PendingEvent>, log_cap: usize) -> Drained {
    let (status_code, headers) = loop {
        match rx.recv().await {
            Some(PendingEvent::Head { status_code, headers }) => break (status_code, headers),
            Some(PendingEvent::Error { kind, .. }) => return Drained::Error(kind),
            Some(PendingEvent::Chunk { .. }) => continue,
            None => return Drained::Error(ErrorKind::ConnectionRefused),
        }
    };

    let mut full_body = Vec::new();
    let mut log_body = Vec::new();
    let mut truncated = false;

    loop {
        match rx.recv().await {
            Some(PendingEvent::Chunk { payload, fin, .. }) => {
                append_capped(&mut log_body, &payload, log_cap, &mut truncated);
                full_body.extend_from_slice(&payload);
                if fin {
                    return Drained::Complete {
                        status_code,
                        headers,
                        full_body,
                        log_body,
                        truncated,
                    };
                }
            }
            Some(PendingEvent::Error { kind, .. }) => {
                return Drained::Partial {
                    status_code,
                    headers,
                    full_body,
                    log_body,
                    truncated,
                    error_kind: kind,
                };
            }
            Some(PendingEvent::Head { .. }) => continue,
            None => {
                return Drained::Partial {
                    status_code,
                    headers,
                    full_body,
                    log_body,
                    truncated,
                    error_kind: ErrorKind::ConnectionRefused,
                };
            }
        }
    }
}

fn append_capped(log_body: &mut Vec<u8>, payload: &[u8], cap: usize, truncated: &mut bool) {
    if log_body.len() >= cap {
        if !payload.is_empty() {
            *truncated = true;
        }
        return;
    }
    let remaining = cap - log_body.len();
    if payload.len() > remaining {
        log_body.extend_from_slice(&payload[..remaining]);
        *truncated = true;
    } else {
        log_body.extend_from_slice(payload);
    }
}

fn error_kind_for(err: &ServiceError) -> ErrorKind {
    match err {
        ServiceError::TunnelDisconnected => ErrorKind::ConnectionRefused,
        _ => ErrorKind::LocalError,
    }
}

fn error_record(
    tunnel_id: TunnelId,
    correlation_id: Uuid,
    outbound: &OutboundRequest,
    received_at: chrono::DateTime<chrono::Utc>,
    completed_at: chrono::DateTime<chrono::Utc>,
    error_kind: ErrorKind,
) -> RequestRecord {
    RequestRecord {
        id: Uuid::new_v4(),
        tunnel_id,
        correlation_id,
        method: outbound.method.clone(),
        path: outbound.path.clone(),
        query_string: outbound.query.clone(),
        headers: outbound.headers.clone(),
        body: outbound.body.clone(),
        remote_addr: outbound.remote_addr.clone(),
        user_agent: outbound.user_agent.clone(),
        received_at,
        completed_at,
        outcome: RequestOutcome::Error { error_kind },
    }
}

/// Resolves an inbound `Host` header to a session: strip the
/// base-domain suffix first; if the host isn't a `*.<base_domain>`
/// hostname, fall through to the custom-domain map maintained by the
/// Persistence Adapter.
async fn resolve_session(state: &AppState, host: &str) -> Option<Arc<Session>> {
    if let Some(session) = state.registry.lookup_by_host(host) {
        return Some(session);
    }
    if state.registry.subdomain_of_host(host).is_some() {
        return None;
    }
    let tunnel_id = state.deps.persistence.find_custom_domain(host).await.ok().flatten()?;
    state.registry.lookup_by_id(tunnel_id)
}

/// axum handler for every request that isn't the admin surface or the
/// handshake upgrade: resolve `Host` to a session, proxy, log, respond.
pub async fn handle_public_request(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<Body>,
) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let session = match resolve_session(&state, &host).await {
        Some(session) if !session.is_terminated() => session,
        Some(_) => return tunnel_disconnected_page(&host),
        None => return not_found_page(&host),
    };

    let tunnel = state.registry.tunnel_snapshot(session.tunnel_id);
    if let Some(tunnel) = &tunnel {
        if tunnel.protocol != TunnelProtocol::Http {
            return wrong_protocol_page(&host);
        }
    }

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let mut headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
        .collect();
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let remote_addr = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "0.0.0.0:0".to_string());

    // `X-Forwarded-For` appended with the remote address,
    // `X-Forwarded-Proto` set from the edge-observed scheme.
    let client_ip = remote_addr.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(&remote_addr);
    match headers.iter_mut().find(|(name, _)| name.eq_ignore_ascii_case("x-forwarded-for")) {
        Some((_, value)) => *value = format!("{value}, {client_ip}"),
        None => headers.push(("x-forwarded-for".to_string(), client_ip.to_string())),
    }
    headers.push(("x-forwarded-proto".to_string(), req.uri().scheme_str().unwrap_or("https").to_string()));

    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => return local_error_page(&host, "failed to read request body"),
    };

    let outbound = OutboundRequest {
        method,
        path,
        query,
        headers,
        body: body_bytes,
        remote_addr,
        user_agent,
    };

    let outcome = dispatch_request(&session, session.tunnel_id, outbound, &state.deps).await;
    let error_kind = outcome.record.error_kind();
    state.request_log.append(outcome.record).await;

    match outcome.forward_status {
        Some(status_code) => build_forward_response(status_code, outcome.forward_headers, outcome.forward_body),
        None => match error_kind {
            Some(ErrorKind::ConnectionRefused) | None => {
                let local_url = tunnel.map(|t| t.local_url).unwrap_or_default();
                connection_refused_page(&host, &local_url)
            }
            Some(ErrorKind::LocalTimeout) => local_timeout_page(&host),
            Some(ErrorKind::LocalError) | Some(ErrorKind::BadResponse) => {
                local_error_page(&host, "the origin reported an error")
            }
        },
    }
}

fn build_forward_response(status_code: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in headers.iter().filter(|(name, _)| !is_hop_by_hop(name)) {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            builder = builder.header(name, value);
        }
    }
    match builder.body(Body::from(body)) {
        Ok(response) => response,
        Err(_) => local_error_page("", "origin returned a malformed response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::Deps;
    use crate::model::TunnelId;
    use crate::session::Session;
    use std::sync::Weak;
    use tokio::sync::mpsc as tmpsc;
    use tunnel_protocol::{ErrorFrame, ResponseHeadFrame, StreamChunkFrame};

    fn sample_outbound() -> OutboundRequest {
        OutboundRequest {
            method: "GET".into(),
            path: "/".into(),
            query: "".into(),
            headers: vec![],
            body: vec![],
            remote_addr: "10.0.0.1:9".into(),
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn dispatch_resolves_to_response_on_clean_fin() {
        let (tx, mut outbound_rx) = tmpsc::unbounded_channel();
        let session = Session::new(
            Uuid::new_v4(),
            tx,
            Weak::new(),
            Arc::new(crate::persistence::InMemoryPersistence::new()),
            Arc::new(crate::config::Config::default()),
        );
        let tunnel_id: TunnelId = session.tunnel_id;
        let deps = Deps::test_default();

        let session_clone = session.clone();
        let driver = tokio::spawn(async move {
            let frame = outbound_rx.recv().await.unwrap();
            let correlation_id = frame.correlation_id().unwrap();
            session_clone
                .dispatch_incoming(Frame::ResponseHead(ResponseHeadFrame {
                    correlation_id,
                    status_code: 200,
                    headers: vec![],
                }))
                .await
                .unwrap();
            session_clone
                .dispatch_incoming(Frame::StreamChunk(StreamChunkFrame {
                    correlation_id,
                    seq: 0,
                    payload: b"hi".to_vec(),
                    fin: true,
                }))
                .await
                .unwrap();
        });

        let outcome = dispatch_request(&session, tunnel_id, sample_outbound(), &deps).await;
        driver.await.unwrap();

        assert_eq!(outcome.forward_status, Some(200));
        assert_eq!(outcome.forward_body, b"hi".to_vec());
        assert_eq!(outcome.record.status_code(), Some(200));
    }

    #[tokio::test]
    async fn dispatch_resolves_to_error_without_head() {
        let (tx, mut outbound_rx) = tmpsc::unbounded_channel();
        let session = Session::new(
            Uuid::new_v4(),
            tx,
            Weak::new(),
            Arc::new(crate::persistence::InMemoryPersistence::new()),
            Arc::new(crate::config::Config::default()),
        );
        let tunnel_id = session.tunnel_id;
        let deps = Deps::test_default();

        let session_clone = session.clone();
        let driver = tokio::spawn(async move {
            let frame = outbound_rx.recv().await.unwrap();
            let correlation_id = frame.correlation_id().unwrap();
            session_clone
                .dispatch_incoming(Frame::Error(ErrorFrame {
                    correlation_id,
                    kind: ErrorKind::ConnectionRefused,
                    message: "refused".into(),
                }))
                .await
                .unwrap();
        });

        let outcome = dispatch_request(&session, tunnel_id, sample_outbound(), &deps).await;
        driver.await.unwrap();

        assert!(outcome.forward_status.is_none());
        assert_eq!(outcome.record.error_kind(), Some(ErrorKind::ConnectionRefused));
    }

    #[tokio::test]
    async fn resolve_session_falls_back_to_custom_domain() {
        use crate::app_state::AppState;
        use crate::persistence::InMemoryPersistence;

        let deps = Deps::test_default();
        let state = AppState::new(deps);
        let (tx, _rx) = tmpsc::unbounded_channel();
        let tunnel_id = Uuid::new_v4();
        let session = Session::new(
            tunnel_id,
            tx,
            Arc::downgrade(&state.registry),
            state.deps.persistence.clone(),
            state.deps.config.clone(),
        );
        state
            .registry
            .register(
                "abc",
                tunnel_id,
                session,
                crate::model::Tunnel {
                    id: tunnel_id,
                    subdomain: "abc".into(),
                    protocol: TunnelProtocol::Http,
                    local_url: "http://localhost:3000".into(),
                    public_url: "https://abc.example.test".into(),
                    custom_domain: Some("tunnels.example.com".into()),
                    owner_user_id: None,
                    status: crate::model::TunnelStatus::Active,
                    allocated_port: None,
                    created_at: chrono::Utc::now(),
                    last_active_at: chrono::Utc::now(),
                    active_since: Some(chrono::Utc::now()),
                },
                false,
            )
            .unwrap();

        let persistence = Arc::new(InMemoryPersistence::new()).with_custom_domain("tunnels.example.com", tunnel_id);
        let mut state = state;
        state.deps.persistence = persistence;

        assert!(resolve_session(&state, "tunnels.example.com").await.is_some());
        assert!(resolve_session(&state, "unmapped.example.com").await.is_none());
    }
}
