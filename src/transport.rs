//! Bidirectional frame transport abstraction (C1).
//!
//! A thin, replaceable trait over the WebSocket frame stream — the spec
//! treats the actual OS socket/WebSocket framer as an external collaborator
//! (§1), so this module only defines the seam `Connection` (C9) talks to.
//! The concrete implementation wraps `tokio-tungstenite`, mirroring how the
//! teacher wraps its transports behind a narrow trait rather than threading
//! `tokio_tungstenite` types through business logic directly.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::TransportError;

/// One message received from the peer.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    Pong,
    Close { code: Option<u16>, reason: String },
}

/// A bidirectional, replaceable frame stream. Implementors own the
/// underlying socket; `Connection` drives the protocol on top of it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn send_ping(&mut self) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError>;
    /// Receive the next frame, or `None` on a clean end of stream.
    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>>;
}

/// `tokio-tungstenite`-backed transport, generic over the underlying socket
/// so the same implementation serves plain and TLS-terminated upgrades
/// (spec §6 profiles 0/1 vs 2/3) without duplicating the frame-handling
/// logic per transport.
pub struct WsTransport<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(Message::Text(text)).await.map_err(TransportError::from)
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.inner
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(TransportError::from)
    }

    async fn close(&mut self, code: u16, reason: String) -> Result<(), TransportError> {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        self.inner
            .send(Message::Close(Some(frame)))
            .await
            .map_err(TransportError::from)
    }

    async fn recv(&mut self) -> Option<Result<InboundFrame, TransportError>> {
        loop {
            let msg = self.inner.next().await?;
            return Some(match msg {
                Ok(Message::Text(t)) => Ok(InboundFrame::Text(t)),
                Ok(Message::Pong(_)) => Ok(InboundFrame::Pong),
                Ok(Message::Ping(payload)) => {
                    if self.inner.send(Message::Pong(payload)).await.is_err() {
                        return Some(Err(TransportError::ConnectionClosed {
                            code: None,
                            reason: "failed to answer ping".to_string(),
                        }));
                    }
                    continue;
                }
                Ok(Message::Close(frame)) => Ok(InboundFrame::Close {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.to_string()).unwrap_or_default(),
                }),
                Ok(Message::Binary(_)) => continue,
                Ok(Message::Frame(_)) => continue,
                Err(e) => Err(TransportError::from(e)),
            });
        }
    }
}
