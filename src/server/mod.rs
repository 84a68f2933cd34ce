//! CSMS server (C11): accept loop, TLS termination for security profiles
//! 2/3, the 9-step upgrade pipeline, identity eviction, local/cluster call
//! routing, and plugin lifecycle wiring (spec §4.10).
//!
//! The upgrade path hand-parses the raw HTTP request instead of using
//! `tokio_tungstenite::accept_hdr_async`, whose header callback is
//! synchronous and so cannot await the async CORS/rate-limit/auth chain the
//! spec requires before the 101 response is committed. Grounded in the
//! teacher's `ipc::handle_connection`/`handle_health_check` pattern for
//! telling a health-check GET apart from a WS upgrade, and its
//! `make_shutdown_future` for SIGTERM/Ctrl-C-driven graceful shutdown.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use crate::cluster::{ClusterAdapter, LocalDelivery};
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::{CallFailure, RouterError, RpcError, RpcErrorKind, TlsError};
use crate::handshake::{
    extract_identity, is_allowed_origin, parse_subprotocols, HandshakeInfo, IpRule,
};
use crate::plugin::PluginManager;
use crate::ratelimit::{BucketConfig, TokenBucket};
use crate::router::{run_composed_chain, AuthDecision, AuthFn, MiddlewareContext, MiddlewareFn, Router};
use crate::rpc::{message::DecodeOutcome, CallOpts, RpcEngine};
use crate::session::SessionStore;
use crate::transport::{InboundFrame, Transport, WsTransport};
use crate::validator::SchemaSet;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A plain or TLS-terminated accepted socket. `handle_socket`'s upgrade
/// pipeline is written once against this type rather than duplicated per
/// transport (spec §6: profiles 0/1 run in plain, 2/3 behind TLS).
enum ServerStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ServerStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ServerStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ServerStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Shared server state: one instance per process (or per cluster node).
pub struct Server {
    config: ServerConfig,
    trie: crate::trie::RadixTrie<Arc<Router>>,
    regex_routes: RwLock<Vec<(Regex, Arc<Router>)>>,
    global_middleware: RwLock<Vec<MiddlewareFn>>,
    server_auth: RwLock<Option<AuthFn>>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    sessions: SessionStore,
    conn_rate_limiter: TokenBucket<IpAddr>,
    plugins: RwLock<PluginManager>,
    cluster: Option<Arc<ClusterAdapter>>,
    schema_set: Option<Arc<SchemaSet>>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        schema_set: Option<Arc<SchemaSet>>,
        cluster: Option<Arc<ClusterAdapter>>,
    ) -> Result<Arc<Self>, TlsError> {
        let sessions = SessionStore::new(config.max_sessions);
        let conn_rate_limiter = TokenBucket::new(BucketConfig {
            limit: config.conn_rate_limit,
            window_ms: config.conn_rate_window_ms,
        });
        let tls_acceptor = crate::tls::build_acceptor(&config)?;
        Ok(Arc::new(Self {
            config,
            trie: crate::trie::RadixTrie::new(),
            regex_routes: RwLock::new(Vec::new()),
            global_middleware: RwLock::new(Vec::new()),
            server_auth: RwLock::new(None),
            connections: RwLock::new(HashMap::new()),
            sessions,
            conn_rate_limiter,
            plugins: RwLock::new(PluginManager::new()),
            cluster,
            schema_set,
            tls_acceptor,
        }))
    }

    /// Register a router's static/`:param` patterns into the trie, and its
    /// `~regex` patterns into the linear regex fallback list (spec §4.9:
    /// "string patterns in the trie, regex patterns in a fallback list
    /// checked in registration order").
    pub async fn register_router(&self, router: Arc<Router>) -> Result<(), RouterError> {
        for pattern in &router.patterns {
            if let Some(expr) = pattern.strip_prefix('~') {
                match Regex::new(expr) {
                    Ok(re) => self.regex_routes.write().await.push((re, router.clone())),
                    Err(e) => warn!(pattern = %pattern, err = %e, "invalid regex route pattern, skipping"),
                }
            } else {
                self.trie.insert(pattern, router.clone())?;
            }
        }
        Ok(())
    }

    pub async fn use_global_middleware(&self, mw: MiddlewareFn) {
        self.global_middleware.write().await.push(mw);
    }

    pub async fn set_auth(&self, cb: AuthFn) {
        *self.server_auth.write().await = Some(cb);
    }

    pub async fn register_plugin(&self, plugin: Arc<dyn crate::plugin::Plugin>) {
        self.plugins.write().await.register(plugin);
    }

    pub async fn get_local_client(&self, identity: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(identity).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Call `identity` — locally if connected here, otherwise via the
    /// cluster adapter if one is configured (spec §4.11).
    pub async fn call(
        &self,
        identity: &str,
        action: &str,
        payload: Value,
        opts: CallOpts,
    ) -> Result<Value, CallFailure> {
        if let Some(conn) = self.get_local_client(identity).await {
            let send_conn = conn.clone();
            return conn
                .rpc
                .call(action, payload, opts, move |frame| send_conn.try_send_raw(frame))
                .await;
        }
        if let Some(cluster) = &self.cluster {
            return cluster
                .call(identity, action, payload, opts.timeout_ms)
                .await
                .map_err(CallFailure::Rpc);
        }
        Err(CallFailure::Rpc(RpcError::new(
            RpcErrorKind::GenericError,
            format!("`{identity}` is not connected"),
        )))
    }

    fn effective_cors(&self, routers: &[Arc<Router>]) -> (Vec<String>, Vec<String>) {
        for router in routers.iter().rev() {
            if let Some(origins) = &router.cors.allowed_origins {
                let ip_rules = router
                    .cors
                    .allowed_ip_rules
                    .clone()
                    .unwrap_or_else(|| self.config.allowed_ip_rules.clone());
                return (origins.clone(), ip_rules);
            }
        }
        (self.config.allowed_origins.clone(), self.config.allowed_ip_rules.clone())
    }

    /// Bind and run the accept loop until a shutdown signal arrives, then
    /// drain plugin `onClose` hooks before returning.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        let addr = format!("{}:{}", self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr = %addr, node_id = %self.config.node_id, "ocpp-rt server listening");

        self.plugins.read().await.init_all().await;

        let mut cluster_consumers: Vec<JoinHandle<()>> = Vec::new();
        if let Some(cluster) = self.cluster.clone() {
            let delivery: Arc<dyn LocalDelivery> = self.clone();
            let call_consumer = cluster.clone();
            cluster_consumers.push(tokio::spawn(async move { call_consumer.run_call_consumer(delivery).await }));
            let result_consumer = cluster.clone();
            cluster_consumers.push(tokio::spawn(async move { result_consumer.run_result_consumer().await }));
        }

        let mut shutdown = Box::pin(make_shutdown_future());
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move { server.handle_socket(stream, remote_addr).await; });
                        }
                        Err(e) => warn!(err = %e, "accept() failed"),
                    }
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        // Drain live connections with the same close code the spec assigns
        // identity eviction (spec §4.10 close-code table: 1001 for a
        // server-initiated disconnect), so every peer gets a wire close
        // frame instead of discovering the TCP reset on its next ping.
        let connections: Vec<Arc<Connection>> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.mark_closed(1001, "server shutdown").await;
        }

        for handle in cluster_consumers {
            handle.abort();
        }

        self.plugins.read().await.shutdown().await;
        Ok(())
    }

    async fn handle_socket(self: Arc<Self>, raw_stream: TcpStream, remote_addr: SocketAddr) {
        let mut stream = match &self.tls_acceptor {
            Some(acceptor) => match acceptor.accept(raw_stream).await {
                Ok(tls) => ServerStream::Tls(Box::new(tls)),
                Err(e) => {
                    warn!(err = %e, peer = %remote_addr, "TLS handshake failed");
                    return;
                }
            },
            None => ServerStream::Plain(raw_stream),
        };

        let request = match read_http_request(&mut stream).await {
            Ok(r) => r,
            Err(_) => {
                write_http_error(&mut stream, 400, "Bad Request", &[]).await;
                return;
            }
        };

        // A TLS stream can't cheaply peek ahead of the handshake the way a
        // raw `TcpStream` can, so the health check is told apart from a WS
        // upgrade by parsing the request line instead of sniffing bytes.
        // Checked before rate limiting so a liveness probe can never be
        // starved by a burst of real connection attempts.
        if request.method == "GET" && split_path_query(&request.path).0 == "/health" {
            respond_health_check(&mut stream).await;
            return;
        }

        let ip = remote_addr.ip();
        if !self.conn_rate_limiter.try_take(&ip, 1).await {
            write_http_error(&mut stream, 429, "Too Many Requests", &[]).await;
            return;
        }

        let ws_key = match request.header("sec-websocket-key") {
            Some(k) => k.to_string(),
            None => {
                write_http_error(&mut stream, 400, "Bad Request", &[]).await;
                return;
            }
        };

        let requested_protocols = match request.header("sec-websocket-protocol") {
            Some(h) => match parse_subprotocols(h) {
                Ok(p) => p,
                Err(_) => {
                    write_http_error(&mut stream, 400, "Bad Request", &[]).await;
                    return;
                }
            },
            None => Vec::new(),
        };

        let (pathname, query_str) = split_path_query(&request.path);
        let identity = match extract_identity(&pathname) {
            Some(id) => id,
            None => {
                write_http_error(&mut stream, 404, "Not Found", &[]).await;
                return;
            }
        };
        let query = parse_query(query_str);

        let normalized = crate::trie::normalize(&pathname);
        let mut matched_routers: Vec<Arc<Router>> = Vec::new();
        let mut params: Vec<(String, String)> = Vec::new();
        if let Some(m) = self.trie.match_path(&normalized) {
            matched_routers = m.values;
            params = m.params;
        }
        for (re, router) in self.regex_routes.read().await.iter() {
            if re.is_match(&pathname) {
                matched_routers.push(router.clone());
            }
        }
        if matched_routers.is_empty() {
            write_http_error(&mut stream, 404, "Not Found", &[]).await;
            return;
        }

        let origin = request.header("origin");
        let (allowed_origins, allowed_ip_rules) = self.effective_cors(&matched_routers);
        if !is_allowed_origin(origin, &allowed_origins) {
            write_http_error(&mut stream, 403, "Forbidden", &[]).await;
            return;
        }
        if !allowed_ip_rules.is_empty() {
            let rules: Vec<IpRule> = allowed_ip_rules.iter().filter_map(|s| IpRule::parse(s).ok()).collect();
            if !rules.iter().any(|r| r.matches(&ip)) {
                write_http_error(&mut stream, 403, "Forbidden", &[]).await;
                return;
            }
        }

        let tls_info = match &stream {
            ServerStream::Tls(tls) => Some(crate::tls::peer_tls_info(tls)),
            ServerStream::Plain(_) => None,
        };
        if self.config.security_profile >= 3 && !tls_info.as_ref().is_some_and(|t| t.authorized) {
            write_http_error(&mut stream, 403, "Forbidden", &[]).await;
            return;
        }

        let mut handshake = HandshakeInfo {
            identity: identity.clone(),
            pathname: pathname.clone(),
            params,
            query,
            headers: request.headers.clone(),
            remote_address: ip,
            tls: tls_info,
            password: None,
            requested_protocols: requested_protocols.clone(),
        };

        if self.config.security_profile >= 1 {
            if let Some(auth_header) = request.header("authorization") {
                if let Some(password) = parse_basic_auth(auth_header, &identity) {
                    handshake.password = Some(password);
                }
            }
        }

        let global = self.global_middleware.read().await.clone();
        let ctx = MiddlewareContext {
            handshake: Some(handshake.clone()),
            state: Default::default(),
        };
        let ctx = match run_composed_chain(&matched_routers, &global, ctx).await {
            Ok(ctx) => ctx,
            Err(abort) => {
                write_http_error(&mut stream, abort.status, &abort.reason, &abort.extra_headers).await;
                return;
            }
        };
        let handshake = ctx.handshake.unwrap_or(handshake);

        // Route-level auth overrides server-level (spec §4.9/§4.10 step 7).
        let auth_cb = matched_routers
            .iter()
            .rev()
            .find_map(|r| r.auth_callback().cloned())
            .or_else(|| self.server_auth.try_read().ok().and_then(|g| g.clone()));

        let decision = match auth_cb {
            Some(cb) => cb(handshake.clone()).await,
            None => match requested_protocols.first().cloned() {
                Some(protocol) => AuthDecision::Accept {
                    protocol,
                    session_marker: None,
                },
                None => AuthDecision::Reject {
                    code: 400,
                    reason: "no subprotocol offered and no auth callback configured".to_string(),
                    extra_headers: vec![],
                },
            },
        };

        let (protocol, session_marker) = match decision {
            AuthDecision::Accept { protocol, session_marker } => (protocol, session_marker),
            AuthDecision::Reject { code, reason, extra_headers } => {
                write_http_error(&mut stream, code, &reason, &extra_headers).await;
                return;
            }
        };
        if !requested_protocols.is_empty() && !requested_protocols.contains(&protocol) {
            write_http_error(&mut stream, 400, "Bad Request", &[]).await;
            return;
        }

        let accept_key = compute_ws_accept(&ws_key);
        write_ws_upgrade_response(&mut stream, &accept_key, Some(&protocol)).await;
        let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
        let transport = WsTransport::new(ws);

        if let Some(evicted) = self.connections.write().await.remove(&identity) {
            evicted.mark_closed(1001, "identity replaced by a new connection").await;
        }

        let session = self.sessions.get_or_create(&identity);
        if let Some(Value::Object(map)) = session_marker {
            for (k, v) in map {
                session.set(k, v);
            }
        }

        let rpc = Arc::new(RpcEngine::new(
            self.config.call_concurrency,
            self.schema_set.clone(),
            self.config.strict_validation,
            self.config.respond_with_detailed_errors,
            self.config.max_bad_messages,
        ));
        // Every matched router's handlers are attached to this client (spec
        // §4.9: "attached to every matched client on `client` event").
        for router in &matched_routers {
            for (variant, action, handler) in router.handlers() {
                rpc.register(variant.clone(), action.clone(), handler.clone()).await;
            }
            if let Some(handler) = router.wildcard_handler() {
                rpc.register_wildcard(handler.clone()).await;
            }
        }
        let conn = Connection::new(identity.clone(), rpc);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        conn.mark_open(protocol.clone(), outbound_tx).await;

        self.connections.write().await.insert(identity.clone(), conn.clone());
        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.refresh_presence(&identity).await {
                warn!(identity = %identity, err = %e, "failed to claim cluster presence on connect");
            }
        }
        self.plugins.read().await.notify_connection(conn.clone()).await;

        self.connection_io_loop(conn, transport, outbound_rx, protocol).await;
    }

    async fn connection_io_loop(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut transport: WsTransport<ServerStream>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
        variant: String,
    ) {
        let mut ping_ticker = tokio::time::interval(std::time::Duration::from_millis(self.config.ping_interval_ms));
        ping_ticker.tick().await; // first tick fires immediately; skip it
        // An identity eviction (spec §4.10 "older connection is closed with
        // code 1001") happens out-of-band, on the `Connection` object held
        // in the `connections` map — not on this loop's own transport. Watch
        // for that terminal transition here so the evicted peer actually
        // receives a wire close frame instead of hanging until its own
        // ping-liveness timeout.
        let mut events = conn.subscribe();

        loop {
            tokio::select! {
                frame = transport.recv() => {
                    match frame {
                        None | Some(Err(_)) => break,
                        Some(Ok(InboundFrame::Text(text))) => {
                            if text.len() > self.config.max_message_bytes {
                                let _ = transport.close(1009, "message exceeds maxMessageBytes".to_string()).await;
                                break;
                            }
                            if let Some(cluster) = &self.cluster {
                                if cluster.refresh_presence(&conn.identity).await.is_err() {
                                    let _ = transport.close(1001, "presence lost to another node".to_string()).await;
                                    break;
                                }
                            }
                            let session = self.sessions.get_or_create(&conn.identity);
                            let result = conn.rpc.dispatch_inbound(&text, &variant, &conn.identity, session).await;
                            if let Some(reply) = result.reply {
                                if transport.send_text(reply).await.is_err() {
                                    break;
                                }
                            }
                            if let Some(code) = result.close_with {
                                let _ = transport.close(code, "too many malformed messages".to_string()).await;
                                break;
                            }
                        }
                        Some(Ok(InboundFrame::Pong)) => conn.note_pong_received(),
                        Some(Ok(InboundFrame::Close { code, reason })) => {
                            conn.mark_closing();
                            let _ = transport.close(code.unwrap_or(1000), reason).await;
                            break;
                        }
                    }
                }
                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if transport.send_text(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if conn.note_ping_sent_and_check_liveness() {
                        let _ = transport.close(1000, "ping liveness timeout".to_string()).await;
                        break;
                    }
                    if transport.send_ping().await.is_err() {
                        break;
                    }
                }
                ev = events.recv() => {
                    if let Ok(crate::connection::ConnectionEvent::Close { code, reason }) = ev {
                        let _ = transport.close(code, reason).await;
                        break;
                    }
                }
            }
        }

        if conn.state() != crate::connection::ConnState::Closed {
            conn.mark_closed(1000, "transport loop ended").await;
        }
        // Only remove if this connection is still the registered one —
        // an identity eviction may have already replaced (and removed) it.
        {
            let mut connections = self.connections.write().await;
            if let Some(current) = connections.get(&conn.identity) {
                if Arc::ptr_eq(current, &conn) {
                    connections.remove(&conn.identity);
                }
            }
        }
        if let Some(cluster) = &self.cluster {
            let _ = cluster.drop_presence(&conn.identity).await;
        }
        self.plugins.read().await.notify_disconnect(&conn.identity).await;
    }
}

#[async_trait]
impl LocalDelivery for Server {
    /// Deliver a cluster-routed CALL to a locally connected identity by
    /// re-encoding it as a synthetic inbound wire frame and feeding it
    /// through the same [`RpcEngine::dispatch_inbound`] path a real socket
    /// frame would take — no separate handler-invocation path to keep in
    /// sync with the real one.
    async fn deliver_call(&self, identity: &str, action: &str, payload: Value) -> Result<Value, RpcError> {
        let conn = self
            .get_local_client(identity)
            .await
            .ok_or_else(|| RpcError::new(RpcErrorKind::GenericError, format!("`{identity}` not connected locally")))?;

        let variant = conn.negotiated_protocol_blocking().unwrap_or_default();
        let session = self.sessions.get_or_create(identity);
        let msg_id = uuid::Uuid::new_v4().to_string();
        let frame = crate::rpc::message::RpcMessage::Call {
            msg_id,
            action: action.to_string(),
            payload,
        }
        .encode();

        let result = conn.rpc.dispatch_inbound(&frame, &variant, identity, session).await;
        match result.reply {
            Some(reply) => match crate::rpc::message::decode(&reply) {
                DecodeOutcome::Ok(crate::rpc::message::RpcMessage::CallResult { payload, .. }) => Ok(payload),
                DecodeOutcome::Ok(crate::rpc::message::RpcMessage::CallError {
                    error_code,
                    error_description,
                    error_details,
                    ..
                }) => {
                    let kind = RpcErrorKind::from_wire_str(&error_code).unwrap_or(RpcErrorKind::GenericError);
                    Err(RpcError::new(kind, error_description).with_details(error_details))
                }
                _ => Err(RpcError::internal("unexpected local dispatch reply shape")),
            },
            None => Err(RpcError::internal("local handler returned NOREPLY for a cluster-routed call")),
        }
    }
}

fn make_shutdown_future() -> impl std::future::Future<Output = ()> {
    async {
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(err = %e, "failed to install SIGTERM handler, falling back to ctrl_c only");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

struct RawRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl RawRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_http_request(stream: &mut ServerStream) -> Result<RawRequest, crate::error::TransportError> {
    let mut buf = Vec::with_capacity(2048);
    let mut chunk = [0u8; 512];
    loop {
        if buf.len() > 16 * 1024 {
            return Err(crate::error::TransportError::WebsocketUpgradeError(
                "request header too large".to_string(),
            ));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(crate::error::TransportError::WebsocketUpgradeError(
                "connection closed during handshake".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_double_crlf(&buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            return parse_raw_request(&head);
        }
    }
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_raw_request(head: &str) -> Result<RawRequest, crate::error::TransportError> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();
    if method.is_empty() || path.is_empty() {
        return Err(crate::error::TransportError::WebsocketUpgradeError(
            "malformed request line".to_string(),
        ));
    }
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }
    Ok(RawRequest { method, path, headers })
}

fn split_path_query(path: &str) -> (String, &str) {
    match path.split_once('?') {
        Some((p, q)) => (p.to_string(), q),
        None => (path.to_string(), ""),
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    if query.is_empty() {
        return Vec::new();
    }
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode_owned(k), percent_decode_owned(v)),
            None => (percent_decode_owned(pair), String::new()),
        })
        .collect()
}

fn percent_decode_owned(s: &str) -> String {
    percent_encoding::percent_decode_str(s)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn parse_basic_auth(header: &str, identity: &str) -> Option<Vec<u8>> {
    let b64 = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    let prefix = format!("{identity}:");
    decoded
        .starts_with(prefix.as_bytes())
        .then(|| decoded[prefix.len()..].to_vec())
}

fn compute_ws_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

async fn write_http_error(stream: &mut ServerStream, status: u16, reason: &str, extra_headers: &[(String, String)]) {
    let mut resp = format!("HTTP/1.1 {status} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n");
    for (k, v) in extra_headers {
        resp.push_str(&format!("{k}: {v}\r\n"));
    }
    resp.push_str("\r\n");
    let _ = stream.write_all(resp.as_bytes()).await;
}

async fn write_ws_upgrade_response(stream: &mut ServerStream, accept_key: &str, protocol: Option<&str>) {
    let mut resp = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept_key}\r\n"
    );
    if let Some(p) = protocol {
        resp.push_str(&format!("Sec-WebSocket-Protocol: {p}\r\n"));
    }
    resp.push_str("\r\n");
    let _ = stream.write_all(resp.as_bytes()).await;
}

async fn respond_health_check(stream: &mut ServerStream) {
    let mut discard = [0u8; 1024];
    let _ = stream.read(&mut discard).await;
    let body = format!(
        r#"{{"status":"ok","time":"{}"}}"#,
        chrono::Utc::now().to_rfc3339()
    );
    let resp = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(resp.as_bytes()).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_accept_matches_rfc6455_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            compute_ws_accept("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn parse_raw_request_reads_method_path_headers() {
        let head = "GET /ocpp/CP001 HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let req = parse_raw_request(head).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/ocpp/CP001");
        assert_eq!(req.header("sec-websocket-key"), Some("abc"));
        assert_eq!(req.header("HOST"), Some("x"));
    }

    #[test]
    fn split_path_query_separates_query_string() {
        let (path, query) = split_path_query("/ocpp/CP001?foo=bar");
        assert_eq!(path, "/ocpp/CP001");
        assert_eq!(query, "foo=bar");
        assert_eq!(parse_query(query), vec![("foo".to_string(), "bar".to_string())]);
    }

    #[test]
    fn basic_auth_extracts_password_for_matching_identity() {
        let header = format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(b"CP001:secret"));
        let pw = parse_basic_auth(&header, "CP001").unwrap();
        assert_eq!(pw, b"secret");
        assert!(parse_basic_auth(&header, "CP002").is_none());
    }

    #[tokio::test]
    async fn register_router_rejects_conflicting_param_names() {
        let server = Server::new(ServerConfig::for_test(), None, None).unwrap();
        server
            .register_router(Arc::new(Router::new(vec!["/ocpp/:identity".to_string()])))
            .await
            .unwrap();
        let err = server
            .register_router(Arc::new(Router::new(vec!["/ocpp/:stationId".to_string()])))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ConflictingParamName { .. }));
    }

    #[tokio::test]
    async fn call_to_unknown_identity_without_cluster_errors() {
        let server = Server::new(ServerConfig::for_test(), None, None).unwrap();
        let err = server
            .call("CP999", "Reset", serde_json::json!({}), CallOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.into_rpc_error().kind, RpcErrorKind::GenericError);
    }
}
