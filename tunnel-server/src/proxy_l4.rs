//! Raw L4 Proxy: one accept loop per TCP/TLS tunnel, one
//! datagram loop per UDP tunnel, all piping bytes through the tunnel's
//! [`Session`] via the same `REQUEST`/`STREAM_CHUNK` frames the HTTP
//! proxy uses, keyed by a fresh correlation id per connection (or, for
//! UDP, per source address).

use crate::app_state::AppState;
use crate::session::{PendingEvent, Session};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tracing::warn;
use tunnel_protocol::{Frame, RequestFrame, StreamChunkFrame, TunnelProtocol};
use uuid::Uuid;

const IO_BUFFER_SIZE: usize = 16 * 1024;
const UDP_DATAGRAM_CAP: usize = 64 * 1024;
const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Starts whatever background accept/receive loop this tunnel's
/// protocol needs, tracked on the session so it's torn down with it.
pub fn spawn_l4_listener(state: AppState, session: Arc<Session>, protocol: TunnelProtocol, port: u16) {
    match protocol {
        TunnelProtocol::Tcp | TunnelProtocol::Tls => {
            let handle = tokio::spawn(run_stream_listener(session.clone(), protocol, port));
            session.track_task(handle);
        }
        TunnelProtocol::Udp => {
            let handle = tokio::spawn(run_udp_listener(state, session.clone(), port));
            session.track_task(handle);
        }
        TunnelProtocol::Http => {}
    }
}

async fn run_stream_listener(session: Arc<Session>, protocol: TunnelProtocol, port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(port, error = %e, "failed to bind L4 listener");
            return;
        }
    };

    let tls_acceptor = if protocol == TunnelProtocol::Tls {
        match build_tls_acceptor() {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                warn!(port, error = %e, "failed to initialise TLS termination; closing listener");
                return;
            }
        }
    } else {
        None
    };

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(port, error = %e, "accept failed");
                continue;
            }
        };
        let session = session.clone();
        match &tls_acceptor {
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(tls_stream) => {
                            let (reader, writer) = tokio::io::split(tls_stream);
                            handle_connection(reader, writer, peer_addr, session, protocol).await;
                        }
                        Err(e) => warn!(peer = %peer_addr, error = %e, "TLS handshake failed"),
                    }
                });
            }
            None => {
                let (reader, writer) = socket.into_split();
                tokio::spawn(handle_connection(reader, writer, peer_addr, session, protocol));
            }
        }
    }
}

/// Pipes one accepted TCP/TLS connection through a single correlation
/// id: a `CONNECT` request, then bytes in both directions wrapped as
/// `STREAM_CHUNK`s with `fin` marking half-close.
async fn handle_connection<R, W>(
    mut reader: R,
    mut writer: W,
    peer_addr: SocketAddr,
    session: Arc<Session>,
    protocol: TunnelProtocol,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let correlation_id = Uuid::new_v4();
    let mut rx = session.register_pending(correlation_id);

    if connect_frame(&session, correlation_id, protocol, peer_addr).is_err() {
        session.remove_pending(&correlation_id);
        return;
    }

    let reader_session = session.clone();
    let reader_task: JoinHandle<()> = tokio::spawn(async move {
        let mut buf = vec![0u8; IO_BUFFER_SIZE];
        let mut seq: u64 = 0;
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    let _ = reader_session.send_frame(Frame::StreamChunk(StreamChunkFrame {
                        correlation_id,
                        seq,
                        payload: Vec::new(),
                        fin: true,
                    }));
                    break;
                }
                Ok(n) => {
                    let sent = reader_session.send_frame(Frame::StreamChunk(StreamChunkFrame {
                        correlation_id,
                        seq,
                        payload: buf[..n].to_vec(),
                        fin: false,
                    }));
                    seq += 1;
                    if sent.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    loop {
        match rx.recv().await {
            Some(PendingEvent::Chunk { payload, fin, .. }) => {
                if !payload.is_empty() && writer.write_all(&payload).await.is_err() {
                    break;
                }
                if fin {
                    let _ = writer.shutdown().await;
                    break;
                }
            }
            Some(PendingEvent::Error { .. }) | None => break,
            Some(PendingEvent::Head { .. }) => continue,
        }
    }

    reader_task.abort();
    session.remove_pending(&correlation_id);
}

fn connect_frame(
    session: &Arc<Session>,
    correlation_id: Uuid,
    protocol: TunnelProtocol,
    peer_addr: SocketAddr,
) -> Result<(), crate::error::ServiceError> {
    session.send_frame(Frame::Request(RequestFrame {
        correlation_id,
        method: "CONNECT".into(),
        path: "/".into(),
        query: String::new(),
        headers: vec![
            ("protocol".into(), protocol.as_str().into()),
            ("remote_addr".into(), peer_addr.to_string()),
        ],
        body: Vec::new(),
        remote_addr: peer_addr.to_string(),
    }))
}

fn build_tls_acceptor() -> anyhow::Result<tokio_rustls::TlsAcceptor> {
    use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])?;
    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}

struct UdpFlow {
    correlation_id: Uuid,
    seq: AtomicU64,
    last_active_millis: AtomicU64,
    reply_task: JoinHandle<()>,
}

impl UdpFlow {
    fn touch(&self) {
        self.last_active_millis.store(now_millis(), Ordering::Relaxed);
    }
}

/// One `STREAM_CHUNK` per inbound datagram, correlated per source
/// address and kept alive for `udp_flow_idle` before the sweep drops it.
async fn run_udp_listener(state: AppState, session: Arc<Session>, port: u16) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            warn!(port, error = %e, "failed to bind UDP listener");
            return;
        }
    };

    let flows: DashMap<SocketAddr, UdpFlow> = DashMap::new();
    let idle_millis = state.deps.config.udp_flow_idle.as_millis() as u64;
    let mut buf = vec![0u8; UDP_DATAGRAM_CAP];
    let mut sweep = tokio::time::interval(UDP_SWEEP_INTERVAL);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (n, addr) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(port, error = %e, "udp recv failed");
                        continue;
                    }
                };
                let payload = buf[..n].to_vec();
                let entry = flows.entry(addr).or_insert_with(|| new_udp_flow(&session, &socket, addr));
                let seq = entry.seq.fetch_add(1, Ordering::Relaxed);
                let correlation_id = entry.correlation_id;
                entry.touch();
                let _ = session.send_frame(Frame::StreamChunk(StreamChunkFrame {
                    correlation_id,
                    seq,
                    payload,
                    fin: false,
                }));
            }
            _ = sweep.tick() => {
                let now = now_millis();
                let session = &session;
                flows.retain(|_, flow| {
                    let alive = now.saturating_sub(flow.last_active_millis.load(Ordering::Relaxed)) < idle_millis;
                    if !alive {
                        flow.reply_task.abort();
                        session.remove_pending(&flow.correlation_id);
                    }
                    alive
                });
            }
        }
    }
}

fn new_udp_flow(session: &Arc<Session>, socket: &Arc<UdpSocket>, addr: SocketAddr) -> UdpFlow {
    let correlation_id = Uuid::new_v4();
    let _ = connect_frame(session, correlation_id, TunnelProtocol::Udp, addr);
    let rx = session.register_pending(correlation_id);
    let reply_task = tokio::spawn(pump_udp_replies(socket.clone(), addr, rx));
    UdpFlow {
        correlation_id,
        seq: AtomicU64::new(0),
        last_active_millis: AtomicU64::new(now_millis()),
        reply_task,
    }
}

async fn pump_udp_replies(socket: Arc<UdpSocket>, addr: SocketAddr, mut rx: tokio::sync::mpsc::Receiver<PendingEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PendingEvent::Chunk { payload, .. } => {
                let _ = socket.send_to(&payload, addr).await;
            }
            PendingEvent::Error { .. } => break,
            PendingEvent::Head { .. } => {}
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
