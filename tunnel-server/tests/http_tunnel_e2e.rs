//! End-to-end scenarios driven against a real axum server bound to an
//! ephemeral port, a WebSocket "tunnel client" driven directly with
//! `tokio-tungstenite` standing in for a real remote agent, and a plain
//! `TcpStream` standing in for the public HTTP caller — no mocks on the
//! wire, only the two peers talking the real protocol.

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tunnel_server::app_state::AppState;
use tunnel_server::config::Config;
use tunnel_server::deps::{Deps, NullTokenValidator};
use tunnel_server::persistence::{InMemoryPersistence, PersistenceAdapter};
use tunnel_server::{control, proxy_http};
use tunnel_protocol::{ErrorFrame, ErrorKind, Frame, ResponseHeadFrame, StreamChunkFrame};

async fn spawn_server(base_domain: &str) -> SocketAddr {
    spawn_server_with_state(base_domain).await.0
}

async fn spawn_server_with_state(base_domain: &str) -> (SocketAddr, AppState) {
    let mut config = Config::default();
    config.base_domain = base_domain.to_string();
    let persistence = Arc::new(InMemoryPersistence::new());
    let deps = Deps::new(config, persistence, Arc::new(NullTokenValidator));
    let state = AppState::new(deps);

    let app = Router::new()
        .route("/tunnel", get(control::handle_handshake))
        .fallback(proxy_http::handle_public_request)
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });
    (addr, state)
}

async fn connect_tunnel_client(
    addr: SocketAddr,
    subdomain: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>> {
    connect_tunnel_client_full(addr, subdomain, None, false).await.0
}

/// Same handshake, but also hands back the `X-Tunnel-Id`/`X-Tunnel-Subdomain`
/// the edge accepted with, so a caller can reconnect with `resume=true`.
async fn connect_tunnel_client_full(
    addr: SocketAddr,
    subdomain: &str,
    resume_tunnel_id: Option<&str>,
    resume: bool,
) -> (tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>, String, String) {
    let mut request = format!("ws://{addr}/tunnel").as_str().into_client_request().unwrap();
    request.headers_mut().insert("x-tunnel-protocol", "http".parse().unwrap());
    request.headers_mut().insert("x-tunnel-subdomain", subdomain.parse().unwrap());
    if let Some(id) = resume_tunnel_id {
        request.headers_mut().insert("x-tunnel-id", id.parse().unwrap());
        request.headers_mut().insert("x-tunnel-resume", resume.to_string().parse().unwrap());
    }
    let (ws_stream, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    let tunnel_id = response
        .headers()
        .get("x-tunnel-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let accepted_subdomain = response
        .headers()
        .get("x-tunnel-subdomain")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (ws_stream, tunnel_id, accepted_subdomain)
}

/// Sends one raw HTTP/1.1 GET request by hand (no client library needed
/// for a request this small) and returns `(status, body)`.
async fn raw_http_get(addr: SocketAddr, host: &str, path: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();

    let header_end = find_subslice(&raw, b"\r\n\r\n").expect("response has headers");
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let status_line = head.lines().next().unwrap();
    let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = raw[header_end + 4..].to_vec();
    (status, body)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

type TunnelWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Reads frames off the fake tunnel client's socket until a `Frame` is
/// decoded or the socket closes.
async fn next_frame(ws: &mut TunnelWs) -> Option<Frame> {
    use futures::StreamExt;
    loop {
        match ws.next().await? {
            Ok(WsMessage::Binary(bytes)) => return Frame::decode(&bytes).ok(),
            Ok(WsMessage::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

async fn send_frame(ws: &mut TunnelWs, frame: Frame) {
    use futures::SinkExt;
    if let Ok(bytes) = frame.encode() {
        let _ = ws.send(WsMessage::Binary(bytes)).await;
    }
}

/// A registered tunnel answers one request with a head and a single
/// terminal chunk; the public caller gets the full body back.
#[tokio::test]
async fn basic_http_round_trip() {
    let addr = spawn_server("example.test").await;
    let mut ws = connect_tunnel_client(addr, "abc").await;

    let origin = tokio::spawn(async move {
        loop {
            match next_frame(&mut ws).await {
                Some(Frame::Request(req)) => {
                    send_frame(
                        &mut ws,
                        Frame::ResponseHead(ResponseHeadFrame {
                            correlation_id: req.correlation_id,
                            status_code: 200,
                            headers: vec![("content-type".into(), "text/plain".into())],
                        }),
                    )
                    .await;
                    send_frame(
                        &mut ws,
                        Frame::StreamChunk(StreamChunkFrame {
                            correlation_id: req.correlation_id,
                            seq: 0,
                            payload: b"world".to_vec(),
                            fin: true,
                        }),
                    )
                    .await;
                    return;
                }
                Some(_) => continue,
                None => return,
            }
        }
    });

    let host = "abc.example.test";
    let (status, body) = raw_http_get(addr, host, "/hello").await;
    origin.await.unwrap();

    assert_eq!(status, 200);
    assert!(String::from_utf8_lossy(&body).contains("world"));
}

/// The tunnel client reports its origin refused the connection; the
/// public caller gets a styled 502 naming the host.
#[tokio::test]
async fn dead_origin_serves_styled_502() {
    let addr = spawn_server("example.test").await;
    let mut ws = connect_tunnel_client(addr, "abc").await;

    let origin = tokio::spawn(async move {
        if let Some(Frame::Request(req)) = next_frame(&mut ws).await {
            send_frame(
                &mut ws,
                Frame::Error(ErrorFrame {
                    correlation_id: req.correlation_id,
                    kind: ErrorKind::ConnectionRefused,
                    message: "refused".into(),
                }),
            )
            .await;
        }
    });

    let host = "abc.example.test";
    let (status, body) = raw_http_get(addr, host, "/").await;
    origin.await.unwrap();

    let text = String::from_utf8_lossy(&body);
    assert_eq!(status, 502);
    assert!(text.contains("Connection Refused"));
    assert!(text.contains(host));
}

/// A host with no registered tunnel gets the styled not-found page.
#[tokio::test]
async fn unknown_subdomain_serves_styled_404() {
    let addr = spawn_server("example.test").await;
    let (status, body) = raw_http_get(addr, "nope.example.test", "/").await;
    let text = String::from_utf8_lossy(&body);
    assert_eq!(status, 404);
    assert!(text.contains("Tunnel Not Found") || text.contains("nope.example.test"));
}

/// The tunnel client answers with a head and one chunk, then the whole
/// duplex channel closes before a terminal `fin` chunk arrives. The
/// public caller still gets the head and the partial body it already
/// streamed, and the logged record carries both the partial response
/// and a terminal `error_kind` (`RequestOutcome::Partial`).
#[tokio::test]
async fn disconnect_mid_stream_yields_partial_record() {
    let (addr, state) = spawn_server_with_state("example.test").await;
    let (mut ws, tunnel_id, _subdomain) = connect_tunnel_client_full(addr, "abc", None, false).await;

    let origin = tokio::spawn(async move {
        if let Some(Frame::Request(req)) = next_frame(&mut ws).await {
            send_frame(
                &mut ws,
                Frame::ResponseHead(ResponseHeadFrame {
                    correlation_id: req.correlation_id,
                    status_code: 200,
                    headers: vec![],
                }),
            )
            .await;
            send_frame(
                &mut ws,
                Frame::StreamChunk(StreamChunkFrame {
                    correlation_id: req.correlation_id,
                    seq: 0,
                    payload: b"part".to_vec(),
                    fin: false,
                }),
            )
            .await;
        }
        // Drop the socket without ever sending a terminal chunk.
    });

    let host = "abc.example.test";
    let (status, body) = raw_http_get(addr, host, "/").await;
    origin.await.unwrap();

    assert_eq!(status, 200);
    assert_eq!(body, b"part".to_vec());

    let tunnel_id: uuid::Uuid = tunnel_id.parse().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let records = state
        .request_log
        .list(tunnel_id, tunnel_server::model::RequestRecordFilter::default())
        .await
        .unwrap();
    let record = records.first().expect("request was logged");
    assert_eq!(record.status_code(), Some(200));
    assert!(record.error_kind().is_some());
}

/// `replay` reconstructs the stored request and fires it through the
/// still-active session, producing a fresh record with the same
/// request-side fields.
#[tokio::test]
async fn replay_resends_through_the_active_session() {
    let (addr, state) = spawn_server_with_state("example.test").await;
    let (mut ws, tunnel_id, _subdomain) = connect_tunnel_client_full(addr, "abc", None, false).await;
    let tunnel_id: uuid::Uuid = tunnel_id.parse().unwrap();

    let origin = tokio::spawn(async move {
        for _ in 0..2 {
            if let Some(Frame::Request(req)) = next_frame(&mut ws).await {
                send_frame(
                    &mut ws,
                    Frame::ResponseHead(ResponseHeadFrame {
                        correlation_id: req.correlation_id,
                        status_code: 200,
                        headers: vec![],
                    }),
                )
                .await;
                send_frame(
                    &mut ws,
                    Frame::StreamChunk(StreamChunkFrame {
                        correlation_id: req.correlation_id,
                        seq: 0,
                        payload: b"world".to_vec(),
                        fin: true,
                    }),
                )
                .await;
            }
        }
    });

    let (status, body) = raw_http_get(addr, "abc.example.test", "/hello").await;
    assert_eq!(status, 200);
    assert_eq!(body, b"world".to_vec());

    let first = state
        .request_log
        .list(tunnel_id, tunnel_server::model::RequestRecordFilter::default())
        .await
        .unwrap();
    let original = first.first().expect("first request logged").clone();

    let replayed = state
        .request_log
        .replay(&state.registry, &state.deps, tunnel_id, original.id)
        .await
        .unwrap();
    origin.await.unwrap();

    assert_eq!(replayed.method, original.method);
    assert_eq!(replayed.path, original.path);
    assert_eq!(replayed.body, original.body);
    assert_ne!(replayed.id, original.id);
}

/// A client that reconnects with `X-Tunnel-Resume: true` and its prior
/// `X-Tunnel-Id` gets its old subdomain back, and no duplicate tunnel
/// row is persisted.
#[tokio::test]
async fn resume_restores_the_same_subdomain() {
    let (addr, state) = spawn_server_with_state("example.test").await;
    let (ws, tunnel_id, subdomain) = connect_tunnel_client_full(addr, "abc", None, false).await;
    assert_eq!(subdomain, "abc");

    drop(ws);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(state.deps.persistence.count_tunnels().await.unwrap(), 1);

    let (_ws2, resumed_tunnel_id, resumed_subdomain) =
        connect_tunnel_client_full(addr, "abc", Some(&tunnel_id), true).await;

    assert_eq!(resumed_tunnel_id, tunnel_id);
    assert_eq!(resumed_subdomain, "abc");
    assert_eq!(state.deps.persistence.count_tunnels().await.unwrap(), 1);
}

