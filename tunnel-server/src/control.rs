//! Control Plane: the `/tunnel` upgrade handshake —
//! auth, subdomain/port assignment, session bring-up — and the
//! reader/writer/heartbeat tasks that keep a [`Session`] alive
//! afterward.

use crate::app_state::AppState;
use crate::error::{ServiceError, ServiceResult};
use crate::model::{Tunnel, TunnelId, TunnelStatus, UserId};
use crate::session::Session;
use crate::subdomain::generate_label;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tunnel_protocol::{Frame, TunnelProtocol};
use uuid::Uuid;

struct Registration {
    tunnel_id: TunnelId,
    subdomain: String,
    protocol: TunnelProtocol,
    local_url: String,
    public_url: String,
    is_resume: bool,
    allocated_port: Option<u16>,
    owner_user_id: Option<UserId>,
}

/// `GET /tunnel` upgrade entry point (handshake headers).
pub async fn handle_handshake(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let protocol = match headers
        .get("x-tunnel-protocol")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| TunnelProtocol::from_str(s).ok())
    {
        Some(protocol) => protocol,
        None => return (StatusCode::BAD_REQUEST, "missing or invalid X-Tunnel-Protocol").into_response(),
    };

    let resume_requested = headers
        .get("x-tunnel-resume")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|s| s.eq_ignore_ascii_case("true"));

    let requested_tunnel_id = headers
        .get("x-tunnel-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok());

    let advisory_subdomain = headers
        .get("x-tunnel-subdomain")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let local_url = headers
        .get("x-tunnel-local-url")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let bearer_token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "));

    let owner_user_id = bearer_token.and_then(|token| state.deps.token_validator.validate(token));

    if state.deps.config.require_auth_at_handshake && owner_user_id.is_none() {
        return ServiceError::Unauthorized.into_response();
    }

    let registration = match resolve_registration(
        &state,
        protocol,
        local_url,
        resume_requested,
        requested_tunnel_id,
        advisory_subdomain,
        owner_user_id,
    )
    .await
    {
        Ok(registration) => registration,
        Err(err) => return err.into_response(),
    };

    let handshake_tunnel_id = registration.tunnel_id;
    let handshake_subdomain = registration.subdomain.clone();
    let handshake_public_url = registration.public_url.clone();
    let handshake_allocated_port = registration.allocated_port;

    let mut response = ws.on_upgrade(move |socket| run_session(socket, state, registration));

    let headers = response.headers_mut();
    if let Ok(v) = handshake_tunnel_id.to_string().parse() {
        headers.insert("X-Tunnel-Id", v);
    }
    if let Ok(v) = handshake_subdomain.parse() {
        headers.insert("X-Tunnel-Subdomain", v);
    }
    if let Ok(v) = handshake_public_url.parse() {
        headers.insert("X-Tunnel-Public-Url", v);
    }
    if let Some(port) = handshake_allocated_port {
        if let Ok(v) = port.to_string().parse() {
            headers.insert("X-Tunnel-Allocated-Port", v);
        }
    }
    response
}

/// Resolves subdomain and L4 port assignment for a handshake. Resume is
/// honoured only when the caller supplies the prior id, no live session
/// currently holds it, and a persisted row for it exists; anything short
/// of that falls back to a fresh registration rather than failing the
/// handshake.
async fn resolve_registration(
    state: &AppState,
    protocol: TunnelProtocol,
    local_url: String,
    resume_requested: bool,
    requested_tunnel_id: Option<Uuid>,
    advisory_subdomain: Option<String>,
    owner_user_id: Option<UserId>,
) -> ServiceResult<Registration> {
    let resumed = if resume_requested {
        match requested_tunnel_id {
            Some(id) if state.registry.lookup_by_id(id).is_none() => {
                state.deps.persistence.get_tunnel(id).await.ok().flatten()
            }
            _ => None,
        }
    } else {
        None
    };

    let (tunnel_id, subdomain, is_resume, owner_user_id) = if let Some(tunnel) = resumed {
        (tunnel.id, tunnel.subdomain, true, tunnel.owner_user_id.or(owner_user_id))
    } else {
        // A client-supplied X-Tunnel-Id is only ever honoured via the
        // resume path above; any other handshake always gets a fresh id,
        // so a guessed/leaked id can't be adopted to hijack a live session.
        let tunnel_id = Uuid::new_v4();
        let subdomain = allocate_subdomain(state, advisory_subdomain)?;
        (tunnel_id, subdomain, false, owner_user_id)
    };

    let allocated_port = if protocol.is_l4() {
        Some(state.port_allocator.allocate().ok_or(ServiceError::PortExhausted)?)
    } else {
        None
    };

    let public_url = build_public_url(protocol, &subdomain, &state.deps.config.base_domain, allocated_port);

    Ok(Registration {
        tunnel_id,
        subdomain,
        protocol,
        local_url,
        public_url,
        is_resume,
        allocated_port,
        owner_user_id,
    })
}

fn allocate_subdomain(state: &AppState, advisory: Option<String>) -> ServiceResult<String> {
    if let Some(label) = advisory {
        if !label.is_empty() && !state.registry.is_subdomain_taken(&label) {
            return Ok(label);
        }
    }
    let config = &state.deps.config;
    for _ in 0..config.subdomain_retry {
        let candidate = generate_label(state.deps.rng.as_ref(), &config.subdomain_alphabet, config.subdomain_length);
        if !state.registry.is_subdomain_taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ServiceError::SubdomainExhausted)
}

fn build_public_url(protocol: TunnelProtocol, subdomain: &str, base_domain: &str, allocated_port: Option<u16>) -> String {
    match protocol {
        TunnelProtocol::Http => format!("https://{subdomain}.{base_domain}"),
        _ => format!("{base_domain}:{}", allocated_port.unwrap_or_default()),
    }
}

/// Brings a freshly upgraded socket to life as an active [`Session`]:
/// registers it, then spawns the writer, heartbeat, and reader tasks
/// that keep it alive until EOF, a protocol violation, or `terminate()`.
async fn run_session(socket: WebSocket, state: AppState, registration: Registration) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let session = Session::new(
        registration.tunnel_id,
        outbound_tx,
        Arc::downgrade(&state.registry),
        state.deps.persistence.clone(),
        state.deps.config.clone(),
    );

    let now = state.deps.clock.now();
    let tunnel = Tunnel {
        id: registration.tunnel_id,
        subdomain: registration.subdomain.clone(),
        protocol: registration.protocol,
        local_url: registration.local_url.clone(),
        public_url: registration.public_url.clone(),
        custom_domain: None,
        owner_user_id: registration.owner_user_id,
        status: TunnelStatus::Active,
        allocated_port: registration.allocated_port,
        created_at: now,
        last_active_at: now,
        active_since: Some(now),
    };

    if let Err(err) = state.registry.register(
        &registration.subdomain,
        registration.tunnel_id,
        session.clone(),
        tunnel.clone(),
        registration.is_resume,
    ) {
        warn!(tunnel_id = %registration.tunnel_id, error = %err, "failed to register session after upgrade");
        if let Some(port) = registration.allocated_port {
            state.port_allocator.release(port);
        }
        return;
    }

    info!(
        tunnel_id = %registration.tunnel_id,
        subdomain = %registration.subdomain,
        resume = registration.is_resume,
        "tunnel session active"
    );

    if !registration.is_resume {
        if let Err(e) = state.deps.persistence.save_tunnel(&tunnel).await {
            warn!(tunnel_id = %registration.tunnel_id, error = %e, "failed to persist new tunnel");
        }
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            match frame.encode() {
                Ok(bytes) => {
                    if sink.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode outbound frame"),
            }
        }
        let _ = sink.close().await;
    });
    session.track_task(writer);

    let heartbeat_session = session.clone();
    let heartbeat_interval = state.deps.config.heartbeat_interval;
    let heartbeat_timeout_millis = state.deps.config.heartbeat_timeout.as_millis() as u64;
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if heartbeat_session.is_terminated() {
                break;
            }
            if heartbeat_session.millis_since_last_pong() > heartbeat_timeout_millis {
                heartbeat_session.terminate("heartbeat timeout").await;
                break;
            }
            if heartbeat_session.send_frame(Frame::Ping).is_err() {
                break;
            }
        }
    });
    session.track_task(heartbeat);

    if let Some(port) = registration.allocated_port {
        crate::proxy_l4::spawn_l4_listener(state.clone(), session.clone(), registration.protocol, port);
    }

    // Tracked like the writer/heartbeat so `Session::terminate()` (heartbeat
    // timeout, admin disconnect) aborts it too, instead of leaving it
    // blocked on `stream.next()` forever while it alone holds the socket's
    // read half.
    let reader_session = session.clone();
    let reader_port_allocator = state.port_allocator.clone();
    let reader_allocated_port = registration.allocated_port;
    let reader_tunnel_id = registration.tunnel_id;
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                Err(_) => break,
            };
            match message {
                Message::Binary(bytes) => match Frame::decode(&bytes) {
                    Ok(frame) => {
                        if let Err(e) = reader_session.dispatch_incoming(frame).await {
                            warn!(tunnel_id = %reader_tunnel_id, error = %e, "protocol violation; terminating session");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(tunnel_id = %reader_tunnel_id, error = %e, "malformed frame; terminating session");
                        break;
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        reader_session.terminate("eof").await;
        if let Some(port) = reader_allocated_port {
            reader_port_allocator.release(port);
        }
    });
    session.track_task(reader);
}
