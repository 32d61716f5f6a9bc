//! Per-client stateful object (`Session`): the duplex channel,
//! write serialisation, the pending-response map, allocated L4
//! listeners, and the heartbeat loop.
//!
//! Follows a "reader task + per-request channel" pattern: exactly one
//! reader task per session demultiplexes incoming [`Frame`]s by
//! correlation id (`dispatch_incoming`); each correlation id gets a
//! bounded, single-producer/single-consumer channel (`PendingEvent`) so
//! a slow consumer backpressures the reader without affecting any other
//! correlation id.
//!
//! Writes go through `outbound_tx`, an unbounded `mpsc` feeding a single
//! writer task that owns the real transport sink — the channel *is* the
//! write mutex: because exactly one task drains it, frames are flushed
//! one at a time, in the order they were sent.

use crate::config::Config;
use crate::error::{ServiceError, ServiceResult};
use crate::model::TunnelId;
use crate::persistence::PersistenceAdapter;
use crate::registry::Registry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tunnel_protocol::{CorrelationId, ErrorKind, Frame};

/// Capacity of each per-correlation sink. Small and bounded so a slow
/// consumer applies backpressure to the session reader quickly.
const PENDING_SINK_CAPACITY: usize = 64;

/// One chunk, head, or terminal error routed to whichever task is
/// waiting on a given correlation id — the "pending sink".
#[derive(Debug, Clone)]
pub enum PendingEvent {
    Head {
        status_code: u16,
        headers: Vec<(String, String)>,
    },
    Chunk {
        seq: u64,
        payload: Vec<u8>,
        fin: bool,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

struct PendingEntry {
    tx: mpsc::Sender<PendingEvent>,
    bytes: AtomicUsize,
    last_seq: AtomicI64,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Terminating,
}

pub struct Session {
    pub tunnel_id: TunnelId,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    pending: DashMap<CorrelationId, PendingEntry>,
    inflight_bytes: AtomicUsize,
    state: std::sync::RwLock<SessionState>,
    terminated: AtomicBool,
    disconnect_tx: watch::Sender<bool>,
    last_pong_millis: AtomicU64,
    task_handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
    registry: Weak<Registry>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
    config: Arc<Config>,
}

impl Session {
    pub fn new(
        tunnel_id: TunnelId,
        outbound_tx: mpsc::UnboundedSender<Frame>,
        registry: Weak<Registry>,
        persistence: Arc<dyn PersistenceAdapter>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        let (disconnect_tx, _) = watch::channel(false);
        Arc::new(Self {
            tunnel_id,
            outbound_tx,
            pending: DashMap::new(),
            inflight_bytes: AtomicUsize::new(0),
            state: std::sync::RwLock::new(SessionState::Active),
            terminated: AtomicBool::new(false),
            disconnect_tx,
            last_pong_millis: AtomicU64::new(now_millis()),
            task_handles: std::sync::Mutex::new(Vec::new()),
            registry,
            persistence: Some(persistence),
            config,
        })
    }

    #[cfg(test)]
    pub fn new_for_test(tunnel_id: TunnelId) -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (disconnect_tx, _) = watch::channel(false);
        Self {
            tunnel_id,
            outbound_tx: tx,
            pending: DashMap::new(),
            inflight_bytes: AtomicUsize::new(0),
            state: std::sync::RwLock::new(SessionState::Active),
            terminated: AtomicBool::new(false),
            disconnect_tx,
            last_pong_millis: AtomicU64::new(now_millis()),
            task_handles: std::sync::Mutex::new(Vec::new()),
            registry: Weak::new(),
            persistence: None,
            config: Arc::new(Config::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Subscribes to this session's disconnect signal: a session's
    /// disconnect propagates to every pending sink within one
    /// scheduling cycle — callers `select!` against this.
    pub fn disconnect_signal(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }

    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.task_handles.lock().unwrap().push(handle);
    }

    /// Writes one frame to the client. The single outbound task owns the
    /// real sink, so this call never interleaves bytes from two frames.
    pub fn send_frame(&self, frame: Frame) -> ServiceResult<()> {
        if self.is_terminated() {
            return Err(ServiceError::TunnelDisconnected);
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| ServiceError::TunnelDisconnected)
    }

    pub fn record_pong(&self) {
        self.last_pong_millis.store(now_millis(), Ordering::Release);
    }

    pub fn millis_since_last_pong(&self) -> u64 {
        now_millis().saturating_sub(self.last_pong_millis.load(Ordering::Acquire))
    }

    /// Installs a pending sink for a freshly minted correlation id.
    /// Returns the receiving half; the caller reads from it until
    /// `Head`+terminal `Chunk`, or a terminal `Error`.
    pub fn register_pending(&self, correlation_id: CorrelationId) -> mpsc::Receiver<PendingEvent> {
        let (tx, rx) = mpsc::channel(PENDING_SINK_CAPACITY);
        self.pending.insert(
            correlation_id,
            PendingEntry {
                tx,
                bytes: AtomicUsize::new(0),
                last_seq: AtomicI64::new(-1),
            },
        );
        rx
    }

    /// Removes a pending sink without waiting for a terminal frame —
    /// used by cancellation and by session termination draining.
    pub fn remove_pending(&self, correlation_id: &CorrelationId) {
        if let Some((_, entry)) = self.pending.remove(correlation_id) {
            self.inflight_bytes
                .fetch_sub(entry.bytes.load(Ordering::Relaxed), Ordering::AcqRel);
        }
    }

    /// Cancels a pending sink in response to a downstream-client
    /// disconnect (or an inflight-byte cap breach): delivers a local
    /// `ERROR{local_error}` to whatever is still consuming, and — this is
    /// the "CANCEL" of §4.4 — also writes an `ERROR{local_error}` frame
    /// for this correlation id over the wire to the tunnel client itself,
    /// so its relay can abort the matching upstream call instead of
    /// streaming bytes nobody will ever read.
    pub async fn cancel_pending(&self, correlation_id: &CorrelationId, message: &str) {
        let entry_tx = self.pending.get(correlation_id).map(|e| e.tx.clone());
        if let Some(tx) = entry_tx {
            let _ = tx
                .send(PendingEvent::Error {
                    kind: ErrorKind::LocalError,
                    message: message.to_string(),
                })
                .await;
        }
        self.remove_pending(correlation_id);
        let _ = self.send_frame(Frame::Error(tunnel_protocol::ErrorFrame {
            correlation_id: *correlation_id,
            kind: ErrorKind::LocalError,
            message: message.to_string(),
        }));
    }

    /// Routes one incoming frame from the reader task. `Ping`/`Pong` are
    /// handled here directly; everything else is demultiplexed by
    /// correlation id into the matching pending sink.
    ///
    /// Returns `Err(ProtocolError)` for an out-of-order `seq`, which the
    /// caller must treat as fatal for the whole session.
    pub async fn dispatch_incoming(&self, frame: Frame) -> ServiceResult<()> {
        match frame {
            Frame::Pong(_) => {
                self.record_pong();
                Ok(())
            }
            Frame::Ping => {
                let _ = self.send_frame(Frame::Pong(tunnel_protocol::PongFrame { nonce: 0 }));
                Ok(())
            }
            Frame::ResponseHead(head) => {
                self.deliver(
                    head.correlation_id,
                    PendingEvent::Head {
                        status_code: head.status_code,
                        headers: head.headers,
                    },
                    None,
                )
                .await
            }
            Frame::StreamChunk(chunk) => {
                if let Some(entry) = self.pending.get(&chunk.correlation_id) {
                    let prev = entry.last_seq.load(Ordering::Acquire);
                    if (chunk.seq as i64) <= prev {
                        drop(entry);
                        self.remove_pending(&chunk.correlation_id);
                        return Err(ServiceError::ProtocolError(format!(
                            "out-of-order seq {} (last {}) for correlation {}",
                            chunk.seq, prev, chunk.correlation_id
                        )));
                    }
                    entry.last_seq.store(chunk.seq as i64, Ordering::Release);
                }
                let payload_len = chunk.payload.len();
                self.deliver(
                    chunk.correlation_id,
                    PendingEvent::Chunk {
                        seq: chunk.seq,
                        payload: chunk.payload,
                        fin: chunk.fin,
                    },
                    Some(payload_len),
                )
                .await
            }
            Frame::Error(err) => {
                self.deliver(
                    err.correlation_id,
                    PendingEvent::Error {
                        kind: err.kind,
                        message: err.message,
                    },
                    None,
                )
                .await
            }
            Frame::Request(_) => Err(ServiceError::ProtocolError(
                "edge does not accept REQUEST frames from a tunnel client".into(),
            )),
        }
    }

    async fn deliver(
        &self,
        correlation_id: CorrelationId,
        event: PendingEvent,
        added_bytes: Option<usize>,
    ) -> ServiceResult<()> {
        if let Some(n) = added_bytes {
            let total = self.inflight_bytes.fetch_add(n, Ordering::AcqRel) + n;
            if let Some(entry) = self.pending.get(&correlation_id) {
                entry.bytes.fetch_add(n, Ordering::Relaxed);
            }
            if total > self.config.max_inflight_bytes_per_session {
                warn!(
                    tunnel_id = %self.tunnel_id,
                    correlation_id = %correlation_id,
                    "session inflight byte cap exceeded; cancelling sink"
                );
                self.cancel_pending(&correlation_id, "inflight byte cap exceeded").await;
                return Ok(());
            }
        }
        // Sending blocks when the sink is slower than the reader — the
        // deliberate backpressure point.
        let tx = self.pending.get(&correlation_id).map(|e| e.tx.clone());
        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                self.remove_pending(&correlation_id);
            }
        }
        // A frame for an unknown/expired correlation id is silently
        // dropped: the waiting proxy task has already given up (timeout,
        // downstream disconnect) and there is nothing left to deliver to.
        Ok(())
    }

    /// Enters `Terminating` and drains every outstanding pending sink
    /// with a terminal "tunnel disconnected" event, aborts every tracked
    /// background task, deregisters from the registry, and marks the
    /// persisted row inactive best-effort. Idempotent — a session can
    /// only terminate once.
    pub async fn terminate(self: &Arc<Self>, reason: &str) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.write().unwrap() = SessionState::Terminating;
        info!(tunnel_id = %self.tunnel_id, reason, "terminating session");
        let _ = self.disconnect_tx.send(true);

        let correlation_ids: Vec<CorrelationId> = self.pending.iter().map(|e| *e.key()).collect();
        for correlation_id in correlation_ids {
            if let Some((_, entry)) = self.pending.remove(&correlation_id) {
                let _ = entry
                    .tx
                    .send(PendingEvent::Error {
                        kind: ErrorKind::ConnectionRefused,
                        message: "tunnel disconnected".into(),
                    })
                    .await;
            }
        }
        self.inflight_bytes.store(0, Ordering::Release);

        for handle in self.task_handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.tunnel_id);
        }
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.mark_tunnel_inactive(self.tunnel_id).await {
                warn!(tunnel_id = %self.tunnel_id, error = %e, "failed to mark tunnel inactive");
            }
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
