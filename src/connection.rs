//! Connection state machine (C9): wraps the RPC engine (C8) on top of a
//! transport (C1); owns reconnect backoff, outbound buffering, and
//! ping/pong liveness (spec §4.8).
//!
//! The reconnect backoff loop is grounded in the teacher's
//! `relay::relay_loop`/`sleep_backoff` (connect, run until drop, backoff,
//! retry forever) generalized to the spec's capped-attempts, jittered
//! formula and its CONNECTING/OPEN/CLOSING/CLOSED state machine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use crate::error::{RpcError, RpcErrorKind, TransportError};
use crate::handshake::validate_close_code;
use crate::rpc::RpcEngine;

/// `CONNECTING(0), OPEN(1), CLOSING(2), CLOSED(3)` (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    /// Transport lost while reconnect is still in play — NOT a terminal close.
    Disconnect,
    /// Terminal. Emitted exactly once, on entry to CLOSED.
    Close { code: u16, reason: String },
}

/// Outbound frames buffer while CONNECTING, and flush in order into the
/// transport sink once OPEN (spec §4.8 "Outbound buffering").
enum Outbound {
    Buffering(VecDeque<String>),
    Live(mpsc::UnboundedSender<String>),
}

pub struct Connection {
    state: AtomicU8,
    pub identity: String,
    pub rpc: Arc<RpcEngine>,
    negotiated_protocol: Mutex<Option<String>>,
    outbound: Mutex<Outbound>,
    events: broadcast::Sender<ConnectionEvent>,
    missed_pongs: AtomicU32,
    reconnect_attempts: AtomicU32,
}

impl Connection {
    pub fn new(identity: impl Into<String>, rpc: Arc<RpcEngine>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            state: AtomicU8::new(ConnState::Connecting as u8),
            identity: identity.into(),
            rpc,
            negotiated_protocol: Mutex::new(None),
            outbound: Mutex::new(Outbound::Buffering(VecDeque::new())),
            events,
            missed_pongs: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
        })
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// `CONNECTING -> OPEN`: transport open, subprotocol negotiated, any
    /// client-side auth cleared. Flushes buffered outbound frames in order.
    pub async fn mark_open(&self, protocol: impl Into<String>, sink: mpsc::UnboundedSender<String>) {
        *self.negotiated_protocol.lock().await = Some(protocol.into());
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.missed_pongs.store(0, Ordering::SeqCst);

        let mut outbound = self.outbound.lock().await;
        if let Outbound::Buffering(queue) = &mut *outbound {
            for frame in queue.drain(..) {
                let _ = sink.send(frame);
            }
        }
        *outbound = Outbound::Live(sink);
        self.state.store(ConnState::Open as u8, Ordering::SeqCst);
        let _ = self.events.send(ConnectionEvent::Open);
    }

    /// Queue (or, if OPEN, transmit) a raw outbound wire frame. Errors in
    /// CLOSED (spec §4.8 "Writes in CLOSED raise").
    pub async fn send_raw(&self, frame: String) -> Result<(), TransportError> {
        match self.state() {
            ConnState::Closed => Err(TransportError::ConnectionClosed {
                code: None,
                reason: "connection is closed".to_string(),
            }),
            _ => {
                let mut outbound = self.outbound.lock().await;
                match &mut *outbound {
                    Outbound::Buffering(queue) => {
                        queue.push_back(frame);
                        Ok(())
                    }
                    Outbound::Live(sink) => sink.send(frame).map_err(|_| {
                        TransportError::ConnectionClosed {
                            code: None,
                            reason: "outbound sink closed".to_string(),
                        }
                    }),
                }
            }
        }
    }

    /// Synchronous best-effort send, used as the `send` closure handed to
    /// [`crate::rpc::RpcEngine::call`] (which requires a synchronous
    /// callback so it can run inside its own concurrency queue). Falls back
    /// to an error if the outbound lock is momentarily held — rare, since a
    /// connection has at most one writer contending for it at a time.
    pub fn try_send_raw(&self, frame: String) -> Result<(), RpcError> {
        if self.state() == ConnState::Closed {
            return Err(RpcError::new(RpcErrorKind::GenericError, "connection is closed"));
        }
        let mut outbound = self
            .outbound
            .try_lock()
            .map_err(|_| RpcError::new(RpcErrorKind::InternalError, "outbound lock contended"))?;
        match &mut *outbound {
            Outbound::Buffering(queue) => {
                queue.push_back(frame);
                Ok(())
            }
            Outbound::Live(sink) => sink
                .send(frame)
                .map_err(|_| RpcError::new(RpcErrorKind::GenericError, "outbound sink closed")),
        }
    }

    /// `OPEN -> CLOSING`: explicit close() or peer-initiated close frame.
    pub fn mark_closing(&self) {
        self.state.store(ConnState::Closing as u8, Ordering::SeqCst);
    }

    /// `OPEN -> CONNECTING`: transport lost, reconnect still eligible.
    /// Emits `disconnect` (not `close`), per spec §4.8 event semantics.
    pub fn mark_disconnected_for_reconnect(&self) {
        self.state.store(ConnState::Connecting as u8, Ordering::SeqCst);
        // Re-arm buffering so writes issued before the next `mark_open`
        // queue instead of going to the now-dead sink.
        if let Ok(mut guard) = self.outbound.try_lock() {
            *guard = Outbound::Buffering(VecDeque::new());
        }
        let _ = self.events.send(ConnectionEvent::Disconnect);
    }

    /// Terminal transition into CLOSED. Rejects every pending call and
    /// emits exactly one `close` event (spec §3 invariant, §4.8).
    pub async fn mark_closed(&self, code: u16, reason: impl Into<String>) {
        let reason = reason.into();
        let code = validate_close_code(code);
        self.state.store(ConnState::Closed as u8, Ordering::SeqCst);
        self.rpc.reject_all_pending(&reason).await;
        let _ = self.events.send(ConnectionEvent::Close { code, reason });
    }

    pub fn negotiated_protocol_blocking(&self) -> Option<String> {
        self.negotiated_protocol.try_lock().ok().and_then(|g| g.clone())
    }

    /// Ping/pong liveness (spec §4.8): call on every `pingIntervalMs` tick.
    /// Returns `true` if the peer should now be force-terminated (two
    /// consecutive pings elapsed without a pong).
    pub fn note_ping_sent_and_check_liveness(&self) -> bool {
        self.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1 >= 2
    }

    pub fn note_pong_received(&self) {
        self.missed_pongs.store(0, Ordering::SeqCst);
    }

    /// Reconnect backoff delay: `min(backoffMax, backoffMin * 2^attempts * jitter)`.
    pub fn next_backoff(&self, backoff_min_ms: u64, backoff_max_ms: u64) -> Duration {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
        let jitter = 0.85 + jitter_fraction() * 0.3; // [0.85, 1.15)
        let raw = (backoff_min_ms as f64) * 2f64.powi(attempt as i32) * jitter;
        let capped = raw.min(backoff_max_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }
}

/// Deterministic pseudo-jitter without pulling in `rand`: derived from the
/// low bits of the monotonic clock. Not cryptographic — backoff jitter has
/// no security requirement, only a decorrelation one.
fn jitter_fraction() -> f64 {
    let nanos = std::time::Instant::now().elapsed().subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Map a handler/engine-level [`RpcError`] into the `details.stack` shape
/// used when `respondWithDetailedErrors` is on (spec §7).
pub fn with_stack_detail(mut err: RpcError, stack: impl Into<String>) -> RpcError {
    err.details = serde_json::json!({ "stack": stack.into() });
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcEngine;

    fn test_rpc() -> Arc<RpcEngine> {
        Arc::new(RpcEngine::new(4, None, false, false, 10))
    }

    #[tokio::test]
    async fn buffers_outbound_while_connecting_then_flushes_on_open() {
        let conn = Connection::new("CP001", test_rpc());
        conn.send_raw("frame-1".to_string()).await.unwrap();
        conn.send_raw("frame-2".to_string()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.mark_open("ocpp1.6", tx).await;
        assert_eq!(rx.recv().await.unwrap(), "frame-1");
        assert_eq!(rx.recv().await.unwrap(), "frame-2");
    }

    #[tokio::test]
    async fn writes_after_closed_raise() {
        let conn = Connection::new("CP001", test_rpc());
        conn.mark_closed(1000, "test").await;
        assert!(conn.send_raw("late".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn mark_closed_rejects_pending_calls() {
        let rpc = test_rpc();
        let conn = Connection::new("CP001", rpc.clone());
        let rpc2 = rpc.clone();
        let call_fut = tokio::spawn(async move {
            rpc2.call(
                "Heartbeat",
                serde_json::json!({}),
                crate::rpc::CallOpts { timeout_ms: 5_000 },
                |_| Ok(()),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.mark_closed(1001, "evicted").await;
        assert!(call_fut.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn ping_liveness_trips_after_two_missed_pongs() {
        let conn = Connection::new("CP001", test_rpc());
        assert!(!conn.note_ping_sent_and_check_liveness());
        assert!(conn.note_ping_sent_and_check_liveness());
    }

    #[tokio::test]
    async fn pong_resets_liveness_counter() {
        let conn = Connection::new("CP001", test_rpc());
        conn.note_ping_sent_and_check_liveness();
        conn.note_pong_received();
        assert!(!conn.note_ping_sent_and_check_liveness());
    }

    #[test]
    fn backoff_never_exceeds_max() {
        let conn_rt = tokio::runtime::Runtime::new().unwrap();
        let conn = conn_rt.block_on(async { Connection::new("CP001", test_rpc()) });
        for _ in 0..10 {
            let delay = conn.next_backoff(1_000, 10_000);
            assert!(delay.as_millis() as u64 <= 10_000 + 2_000); // allow jitter headroom
        }
    }

    #[tokio::test]
    async fn disconnect_event_is_not_close() {
        let conn = Connection::new("CP001", test_rpc());
        let mut rx = conn.subscribe();
        conn.mark_disconnected_for_reconnect();
        match rx.recv().await.unwrap() {
            ConnectionEvent::Disconnect => {}
            other => panic!("expected Disconnect, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnState::Connecting);
    }
}
