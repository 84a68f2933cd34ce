//! Reconnecting charging-station-side client (spec §4.8, §6).
//!
//! Grounded in the teacher's `relay::relay_loop`/`sleep_backoff` shape:
//! connect, run the session until the transport drops, back off, retry
//! forever (unless `maxReconnects` bounds it) — generalized here onto
//! [`Connection`]'s CONNECTING/OPEN/CLOSING/CLOSED state machine and the
//! spec's jittered exponential backoff formula.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::handshake::serialize_subprotocols;
use crate::rpc::{CallOpts, HandlerFn, RpcEngine};
use serde_json::Value;

/// A charging-station-side OCPP-J client: owns one [`Connection`] and keeps
/// it alive across drops per `ClientConfig`'s backoff settings.
pub struct Client {
    config: ClientConfig,
    conn: Arc<Connection>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let rpc = Arc::new(RpcEngine::new(
            config.call_concurrency,
            None,
            config.strict_validation,
            false,
            u32::MAX,
        ));
        let conn = Connection::new(config.identity.clone(), rpc);
        Arc::new(Self { config, conn })
    }

    pub async fn register(&self, variant: impl Into<String>, action: impl Into<String>, handler: HandlerFn) {
        self.conn.rpc.register(variant, action, handler).await;
    }

    pub async fn register_wildcard(&self, handler: HandlerFn) {
        self.conn.rpc.register_wildcard(handler).await;
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Send an outbound CALL to the CSMS, resolving with the CALLRESULT
    /// payload or the mapped CALLERROR (spec §4.7 outbound call flow).
    pub async fn call(&self, action: &str, payload: Value) -> Result<Value, crate::error::CallFailure> {
        let conn = self.conn.clone();
        let opts = CallOpts {
            timeout_ms: self.config.call_timeout_ms,
        };
        conn.rpc
            .call(action, payload, opts, move |frame| conn.try_send_raw(frame))
            .await
    }

    /// Drive the reconnect loop forever (or until `maxReconnects` is spent).
    /// Returns once the attempt budget is exhausted; a `None` budget never
    /// returns on its own.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Some(max) = self.config.max_reconnects {
                if self.conn.reconnect_attempts() >= max {
                    warn!(identity = %self.config.identity, "max reconnect attempts reached, giving up");
                    return;
                }
            }

            match self.connect_once().await {
                Ok(()) => debug!(identity = %self.config.identity, "session ended cleanly"),
                Err(e) => warn!(identity = %self.config.identity, err = %e, "connection attempt failed"),
            }

            self.conn.mark_disconnected_for_reconnect();
            let delay = self.conn.next_backoff(self.config.backoff_min_ms, self.config.backoff_max_ms);
            info!(identity = %self.config.identity, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(&self) -> Result<(), crate::error::TransportError> {
        let mut request = self
            .config
            .url
            .clone()
            .into_client_request()
            .map_err(|e| crate::error::TransportError::WebsocketUpgradeError(e.to_string()))?;

        if !self.config.protocols.is_empty() {
            let value = serialize_subprotocols(&self.config.protocols);
            request.headers_mut().insert(
                "Sec-WebSocket-Protocol",
                value.parse().map_err(|_| {
                    crate::error::TransportError::WebsocketUpgradeError("invalid subprotocol header value".to_string())
                })?,
            );
        }

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(crate::error::TransportError::from)?;

        let protocol = response
            .headers()
            .get("sec-websocket-protocol")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_else(|| self.config.protocols.first().map(|s| s.as_str()).unwrap_or("ocpp1.6"))
            .to_string();

        info!(identity = %self.config.identity, protocol = %protocol, "connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.conn.mark_open(protocol.clone(), outbound_tx).await;

        self.io_loop(ws, outbound_rx, protocol).await
    }

    async fn io_loop(
        &self,
        mut ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        variant: String,
    ) -> Result<(), crate::error::TransportError> {
        let mut ping_ticker = tokio::time::interval(std::time::Duration::from_millis(self.config.ping_interval_ms));
        ping_ticker.tick().await;

        loop {
            tokio::select! {
                msg = ws.next() => {
                    match msg {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(crate::error::TransportError::from(e)),
                        Some(Ok(Message::Text(text))) => {
                            let session = crate::session::Session::new();
                            let result = self
                                .conn
                                .rpc
                                .dispatch_inbound(&text, &variant, &self.config.identity, session)
                                .await;
                            if let Some(reply) = result.reply {
                                ws.send(Message::Text(reply)).await.map_err(crate::error::TransportError::from)?;
                            }
                            if let Some(code) = result.close_with {
                                let _ = ws.close(None).await;
                                return Err(crate::error::TransportError::ConnectionClosed {
                                    code: Some(code),
                                    reason: "too many malformed messages".to_string(),
                                });
                            }
                        }
                        Some(Ok(Message::Pong(_))) => self.conn.note_pong_received(),
                        Some(Ok(Message::Ping(payload))) => {
                            ws.send(Message::Pong(payload)).await.map_err(crate::error::TransportError::from)?;
                        }
                        Some(Ok(Message::Close(_))) => {
                            self.conn.mark_closing();
                            return Ok(());
                        }
                        Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {}
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => ws.send(Message::Text(frame)).await.map_err(crate::error::TransportError::from)?,
                        None => return Ok(()),
                    }
                }
                _ = ping_ticker.tick() => {
                    if self.conn.note_ping_sent_and_check_liveness() {
                        let _ = ws.close(None).await;
                        return Err(crate::error::TransportError::Timeout);
                    }
                    ws.send(Message::Ping(Vec::new())).await.map_err(crate::error::TransportError::from)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outbound_call_before_connect_times_out_rather_than_hanging() {
        let mut config = ClientConfig::default();
        config.identity = "CP001".to_string();
        config.call_timeout_ms = 20;
        let client = Client::new(config);
        let err = client.call("Heartbeat", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, crate::error::CallFailure::Timeout));
    }

    #[tokio::test]
    async fn registered_handler_is_reachable_through_dispatch() {
        let mut config = ClientConfig::default();
        config.identity = "CP001".to_string();
        let client = Client::new(config);
        client
            .register(
                "ocpp1.6",
                "Reset",
                std::sync::Arc::new(|_payload, _ctx| {
                    Box::pin(async move { Ok(crate::rpc::HandlerOutcome::Reply(serde_json::json!({"status": "Accepted"}))) })
                }),
            )
            .await;
        let session = crate::session::Session::new();
        let result = client
            .conn
            .rpc
            .dispatch_inbound(r#"[2,"m1","Reset",{}]"#, "ocpp1.6", "CP001", session)
            .await;
        assert!(result.reply.unwrap().contains("Accepted"));
    }
}
