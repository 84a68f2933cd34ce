//! End-to-end scenarios over a real loopback TCP socket: a live [`Server`]
//! and a raw `tokio-tungstenite` client speaking OCPP-J directly, covering
//! the literal scenarios of spec §8 (S1-S4, S6). S5 (cross-node cluster
//! call) is covered in `cluster::tests` against a fake in-memory driver,
//! since it needs no real socket.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use ocpp_rt::config::ServerConfig;
use ocpp_rt::rpc::HandlerOutcome;
use ocpp_rt::router::{AuthDecision, Router};
use ocpp_rt::server::Server;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Build a server with a single `/ocpp/:identity` route whose auth callback
/// always accepts `ocpp1.6`, and a `BootNotification`/`Heartbeat` handler
/// pair registered on that route (spec §4.9 "attached to every matched
/// client").
async fn start_test_server() -> (Arc<Server>, u16) {
    let port = free_port();
    let mut config = ServerConfig::for_test();
    config.port = port;
    config.ping_interval_ms = 60_000; // keep pings out of the way of these tests

    let server = Server::new(config, None, None).unwrap();

    let mut router = Router::new(vec!["/ocpp/:identity".to_string()]);
    router.auth(Arc::new(|_handshake| {
        Box::pin(async move {
            AuthDecision::Accept {
                protocol: "ocpp1.6".to_string(),
                session_marker: None,
            }
        })
    }));
    router.handle(
        "ocpp1.6",
        "BootNotification",
        Arc::new(|_payload, _ctx| {
            Box::pin(async move {
                Ok(HandlerOutcome::Reply(json!({
                    "status": "Accepted",
                    "currentTime": "2026-07-28T00:00:00Z",
                    "interval": 300
                })))
            })
        }),
    );
    router.handle(
        "ocpp1.6",
        "Heartbeat",
        Arc::new(|_payload, _ctx| {
            Box::pin(async move { Ok(HandlerOutcome::Reply(json!({ "currentTime": "2026-07-28T00:00:00Z" }))) })
        }),
    );
    // Exercises the session-persistence-across-eviction half of S4: the
    // session bag is keyed by identity in the server's LRU, not owned by
    // the connection, so a value set by the evicted peer is still readable
    // through the connection that replaced it.
    router.handle(
        "ocpp1.6",
        "SetMarker",
        Arc::new(|payload, ctx| {
            Box::pin(async move {
                ctx.session.set("marker", payload["value"].clone());
                Ok(HandlerOutcome::Reply(json!({})))
            })
        }),
    );
    router.handle(
        "ocpp1.6",
        "GetMarker",
        Arc::new(|_payload, ctx| {
            Box::pin(async move { Ok(HandlerOutcome::Reply(json!({ "marker": ctx.session.get("marker") }))) })
        }),
    );
    server.register_router(Arc::new(router)).await.unwrap();

    let server_run = server.clone();
    tokio::spawn(async move {
        server_run.run().await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (server, port)
}

async fn connect(port: u16, identity: &str) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = format!("ws://127.0.0.1:{port}/ocpp/{identity}")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "ocpp1.6".parse().unwrap());
    let (ws, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

async fn send_and_recv(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    frame: &str,
) -> Value {
    ws.send(Message::Text(frame.to_string())).await.unwrap();
    loop {
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame while waiting for reply: {other:?}"),
        }
    }
}

#[tokio::test]
async fn s1_boot_notification_accept() {
    let (_server, port) = start_test_server().await;
    let mut ws = connect(port, "CP001").await;

    let reply = send_and_recv(
        &mut ws,
        r#"[2,"m1","BootNotification",{"chargePointVendor":"V","chargePointModel":"M"}]"#,
    )
    .await;

    assert_eq!(reply[0], 3);
    assert_eq!(reply[1], "m1");
    assert_eq!(reply[2]["status"], "Accepted");
    assert_eq!(reply[2]["interval"], 300);
}

#[tokio::test]
async fn s2_unknown_action_returns_not_implemented() {
    let (_server, port) = start_test_server().await;
    let mut ws = connect(port, "CP002").await;

    let reply = send_and_recv(&mut ws, r#"[2,"m2","ThisDoesNotExist",{}]"#).await;

    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "m2");
    assert_eq!(reply[2], "NotImplemented");
}

#[tokio::test]
async fn s3_malformed_msg_id_is_rejected_without_closing() {
    let (_server, port) = start_test_server().await;
    let mut ws = connect(port, "CP003").await;

    let reply = send_and_recv(&mut ws, r#"[2,12345,"Heartbeat",{}]"#).await;

    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], 12345);
    assert!(matches!(reply[2].as_str(), Some("FormatViolation") | Some("ProtocolError")));

    // Connection stays OPEN: a subsequent well-formed call still gets served.
    let reply2 = send_and_recv(&mut ws, r#"[2,"m3","Heartbeat",{}]"#).await;
    assert_eq!(reply2[0], 3);
    assert_eq!(reply2[1], "m3");
}

#[tokio::test]
async fn s4_duplicate_identity_evicts_the_older_connection() {
    let (server, port) = start_test_server().await;
    let mut a = connect(port, "DUP").await;
    // Make sure A is actually registered, and stamp the session marker.
    let _ = send_and_recv(&mut a, r#"[2,"m1","SetMarker",{"value":"preserved"}]"#).await;
    assert_eq!(server.connection_count().await, 1);

    let mut b = connect(port, "DUP").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(server.connection_count().await, 1);

    // A is closed with 1001.
    match a.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Away),
        Some(Ok(other)) => panic!("expected close frame for evicted connection, got {other:?}"),
        Some(Err(e)) => panic!("transport error waiting for eviction close: {e}"),
        None => panic!("stream ended without a close frame"),
    }

    // B is still live, serving, and sees A's session marker.
    let reply = send_and_recv(&mut b, r#"[2,"m2","Heartbeat",{}]"#).await;
    assert_eq!(reply[0], 3);
    let marker_reply = send_and_recv(&mut b, r#"[2,"m3","GetMarker",{}]"#).await;
    assert_eq!(marker_reply[2]["marker"], "preserved");
}

#[tokio::test]
async fn s6_rate_limited_upgrade_rejects_third_attempt_with_429() {
    let port = free_port();
    let mut config = ServerConfig::for_test();
    config.port = port;
    config.conn_rate_limit = 2;
    config.conn_rate_window_ms = 10_000;
    let server = Server::new(config, None, None).unwrap();

    let mut router = Router::new(vec!["/ocpp/:identity".to_string()]);
    router.auth(Arc::new(|_h| {
        Box::pin(async move {
            AuthDecision::Accept {
                protocol: "ocpp1.6".to_string(),
                session_marker: None,
            }
        })
    }));
    server.register_router(Arc::new(router)).await.unwrap();

    let server_run = server.clone();
    tokio::spawn(async move {
        server_run.run().await.ok();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let _ok1 = connect(port, "CPA").await;
    let _ok2 = connect(port, "CPB").await;

    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    let mut request = format!("ws://127.0.0.1:{port}/ocpp/CPC")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "ocpp1.6".parse().unwrap());
    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status(), 429);
        }
        other => panic!("expected an HTTP 429 upgrade rejection, got {other:?}"),
    }
}
