//! Cluster adapter (C12): cross-node call routing, presence, and durable
//! streams over a Redis-compatible driver (spec §4.11).
//!
//! Grounded in the teacher's `relay/mod.rs` reconnect-loop shape (connect,
//! run until the stream ends, backoff, retry) generalized from a single
//! upstream relay connection to the two always-on consumer loops
//! (`call:<node_id>`, `result:<node_id>`) a cluster member keeps open.
//! `redis::aio::ConnectionManager` already retries transparently, so the
//! `onError`/`onReconnect` hooks the spec lists for the driver surface are
//! folded into `tracing` spans around each operation rather than a separate
//! callback registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, warn};

use crate::error::{ClusterError, RpcError, RpcErrorKind};

/// One entry read back from an `XREAD` reply.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

/// The "Redis-like" driver surface the cluster adapter depends on (spec
/// §4.11). Abstracted behind a trait so the adapter's call-routing logic is
/// testable without a live Redis instance.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ClusterError>;
    async fn get(&self, key: &str) -> Result<Option<String>, ClusterError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, ClusterError>;
    async fn del(&self, key: &str) -> Result<(), ClusterError>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), ClusterError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ClusterError>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, ClusterError>;
    async fn xadd(&self, stream: &str, fields: &[(String, String)], maxlen: usize) -> Result<String, ClusterError>;
    async fn xread(&self, stream: &str, last_id: &str, block_ms: u64) -> Result<Vec<StreamEntry>, ClusterError>;
    async fn xlen(&self, stream: &str) -> Result<usize, ClusterError>;
    async fn disconnect(&self) -> Result<(), ClusterError>;
}

/// Single-node Redis driver. The cluster-hash-tagged variant (`{identity}` /
/// `{nodeId}` key tags so related keys co-shard across a Redis Cluster) is
/// the same implementation with tagged key names — callers pass already-
/// tagged keys/stream names, so no separate type is needed here.
pub struct RedisClusterDriver {
    client: redis::Client,
    manager: Mutex<redis::aio::ConnectionManager>,
}

impl RedisClusterDriver {
    pub async fn connect(url: &str) -> Result<Self, ClusterError> {
        let client = redis::Client::open(url).map_err(ClusterError::from)?;
        let manager = client.get_connection_manager().await.map_err(ClusterError::from)?;
        Ok(Self {
            client,
            manager: Mutex::new(manager),
        })
    }
}

#[async_trait]
impl ClusterDriver for RedisClusterDriver {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), ClusterError> {
        let mut conn = self.manager.lock().await;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await.map_err(ClusterError::from)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, ClusterError> {
        let mut conn = self.manager.lock().await;
        conn.get(key).await.map_err(ClusterError::from)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, ClusterError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.manager.lock().await;
        conn.mget(keys).await.map_err(ClusterError::from)
    }

    async fn del(&self, key: &str) -> Result<(), ClusterError> {
        let mut conn = self.manager.lock().await;
        conn.del::<_, ()>(key).await.map_err(ClusterError::from)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), ClusterError> {
        let mut conn = self.manager.lock().await;
        conn.expire::<_, ()>(key, ttl_secs as i64).await.map_err(ClusterError::from)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ClusterError> {
        let mut conn = self.manager.lock().await;
        conn.publish::<_, _, ()>(channel, payload).await.map_err(ClusterError::from)
    }

    /// Opens a dedicated pub/sub connection (redis-rs's recommended pattern —
    /// a `ConnectionManager` is for regular commands only) and forwards
    /// messages into a channel until the receiver is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>, ClusterError> {
        let (tx, rx) = mpsc::channel(64);
        let mut pubsub = self.client.get_async_pubsub().await.map_err(ClusterError::from)?;
        pubsub.subscribe(channel).await.map_err(ClusterError::from)?;
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: Result<String, _> = msg.get_payload();
                match payload {
                    Ok(p) => {
                        if tx.send(p).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(err = %e, "cluster pub/sub payload was not valid UTF-8"),
                }
            }
        });
        Ok(rx)
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)], maxlen: usize) -> Result<String, ClusterError> {
        let mut conn = self.manager.lock().await;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("MAXLEN").arg("~").arg(maxlen).arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        let id: String = cmd.query_async(&mut *conn).await.map_err(ClusterError::from)?;
        Ok(id)
    }

    async fn xread(&self, stream: &str, last_id: &str, block_ms: u64) -> Result<Vec<StreamEntry>, ClusterError> {
        let mut conn = self.manager.lock().await;
        let value: redis::Value = redis::cmd("XREAD")
            .arg("BLOCK")
            .arg(block_ms)
            .arg("COUNT")
            .arg(50)
            .arg("STREAMS")
            .arg(stream)
            .arg(last_id)
            .query_async(&mut *conn)
            .await
            .map_err(ClusterError::from)?;
        Ok(parse_xread_reply(value))
    }

    async fn xlen(&self, stream: &str) -> Result<usize, ClusterError> {
        let mut conn = self.manager.lock().await;
        redis::cmd("XLEN").arg(stream).query_async(&mut *conn).await.map_err(ClusterError::from)
    }

    async fn disconnect(&self) -> Result<(), ClusterError> {
        Ok(())
    }
}

fn value_to_string(v: &redis::Value) -> Option<String> {
    match v {
        redis::Value::BulkString(b) => String::from_utf8(b.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        redis::Value::Int(i) => Some(i.to_string()),
        _ => None,
    }
}

fn parse_xread_reply(value: redis::Value) -> Vec<StreamEntry> {
    let mut out = Vec::new();
    let redis::Value::Array(streams) = value else {
        return out;
    };
    for stream in streams {
        let redis::Value::Array(pair) = stream else { continue };
        if pair.len() != 2 {
            continue;
        }
        let redis::Value::Array(entries) = &pair[1] else { continue };
        for entry in entries {
            let redis::Value::Array(parts) = entry else { continue };
            if parts.len() != 2 {
                continue;
            }
            let Some(id) = value_to_string(&parts[0]) else { continue };
            let redis::Value::Array(field_list) = &parts[1] else { continue };
            let mut fields = HashMap::new();
            let mut iter = field_list.iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                if let (Some(k), Some(v)) = (value_to_string(k), value_to_string(v)) {
                    fields.insert(k, v);
                }
            }
            out.push(StreamEntry { id, fields });
        }
    }
    out
}

/// Implemented by whatever owns the local connection registry (the
/// `Server`), so this module never depends on `crate::server` — avoids a
/// cycle while still letting the call consumer invoke local handlers.
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    async fn deliver_call(&self, identity: &str, action: &str, payload: Value) -> Result<Value, RpcError>;
}

struct PendingClusterCall {
    resolver: oneshot::Sender<Result<Value, RpcError>>,
}

/// Cross-node call routing, presence, and stream consumption for one node
/// in the cluster (spec §4.11).
pub struct ClusterAdapter {
    driver: Arc<dyn ClusterDriver>,
    pub node_id: String,
    channel_prefix: String,
    ping_interval_ms: u64,
    stream_maxlen: usize,
    pending: Mutex<HashMap<String, PendingClusterCall>>,
}

impl ClusterAdapter {
    pub fn new(
        driver: Arc<dyn ClusterDriver>,
        node_id: impl Into<String>,
        channel_prefix: impl Into<String>,
        ping_interval_ms: u64,
        stream_maxlen: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            driver,
            node_id: node_id.into(),
            channel_prefix: channel_prefix.into(),
            ping_interval_ms,
            stream_maxlen,
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.channel_prefix, suffix)
    }

    /// Refresh (or claim) presence for `identity`. TTL is `3 * pingIntervalMs`
    /// (spec §4.11). If another node already holds presence, returns
    /// `Err(NotConnected)` — the caller (the `Server`) MUST close its local
    /// connection with 1001 on this result (spec §9 open question 2:
    /// detection cadence is "every inbound message", per the spec's own
    /// "refreshed on every inbound message" wording).
    pub async fn refresh_presence(&self, identity: &str) -> Result<(), ClusterError> {
        let key = self.key(&format!("presence:{identity}"));
        let ttl_secs = (self.ping_interval_ms / 1000).saturating_mul(3).max(1);
        match self.driver.get(&key).await? {
            Some(owner) if owner != self.node_id => Err(ClusterError::NotConnected(format!(
                "presence for `{identity}` is now held by `{owner}`"
            ))),
            _ => self.driver.set_ex(&key, &self.node_id, ttl_secs).await,
        }
    }

    pub async fn drop_presence(&self, identity: &str) -> Result<(), ClusterError> {
        self.driver.del(&self.key(&format!("presence:{identity}"))).await
    }

    async fn lookup_owner(&self, identity: &str) -> Result<String, ClusterError> {
        self.driver
            .get(&self.key(&format!("presence:{identity}")))
            .await?
            .ok_or_else(|| ClusterError::NotConnected(identity.to_string()))
    }

    /// Route `action`/`payload` to `identity` wherever it is connected in
    /// the cluster (spec §4.11 cross-node call flow).
    pub async fn call(&self, identity: &str, action: &str, payload: Value, timeout_ms: u64) -> Result<Value, RpcError> {
        let target_node = self
            .lookup_owner(identity)
            .await
            .map_err(|_| RpcError::new(RpcErrorKind::GenericError, format!("`{identity}` has no known presence")))?;

        let msg_id = uuid::Uuid::new_v4().to_string();
        let (resolver, receiver) = oneshot::channel();
        self.pending.lock().await.insert(msg_id.clone(), PendingClusterCall { resolver });

        let deadline_ms = now_millis() + timeout_ms;
        let fields = vec![
            ("from".to_string(), self.node_id.clone()),
            ("identity".to_string(), identity.to_string()),
            ("msgId".to_string(), msg_id.clone()),
            ("action".to_string(), action.to_string()),
            ("payload".to_string(), payload.to_string()),
            ("deadline".to_string(), deadline_ms.to_string()),
        ];
        let stream = self.key(&format!("call:{target_node}"));
        if let Err(e) = self.driver.xadd(&stream, &fields, self.stream_maxlen).await {
            self.pending.lock().await.remove(&msg_id);
            return Err(RpcError::new(RpcErrorKind::InternalError, format!("cluster xadd failed: {e}")));
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::new(RpcErrorKind::InternalError, "cluster call dropped before resolution")),
            Err(_) => {
                self.pending.lock().await.remove(&msg_id);
                Err(RpcError::new(RpcErrorKind::GenericError, format!("cluster call to `{identity}` timed out")))
            }
        }
    }

    /// Long-running consumer of `call:<node_id>`: delivers inbound calls to
    /// `delivery` and replies on `result:<requester_node>`.
    pub async fn run_call_consumer(self: Arc<Self>, delivery: Arc<dyn LocalDelivery>) {
        let stream = self.key(&format!("call:{}", self.node_id));
        let mut last_id = "$".to_string();
        let mut backoff_ms = 500u64;
        loop {
            match self.driver.xread(&stream, &last_id, 5_000).await {
                Ok(entries) => {
                    backoff_ms = 500;
                    for entry in entries {
                        last_id = entry.id.clone();
                        self.handle_call_entry(&entry, &delivery).await;
                    }
                }
                Err(e) => {
                    error!(err = %e, "cluster call consumer xread failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                }
            }
        }
    }

    async fn handle_call_entry(&self, entry: &StreamEntry, delivery: &Arc<dyn LocalDelivery>) {
        let (Some(from), Some(msg_id), Some(action)) =
            (entry.fields.get("from"), entry.fields.get("msgId"), entry.fields.get("action"))
        else {
            warn!(id = %entry.id, "malformed cluster call entry, dropping");
            return;
        };
        let payload: Value = entry
            .fields
            .get("payload")
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or(Value::Null);
        let identity = entry.fields.get("identity").cloned().unwrap_or_default();

        let result = delivery.deliver_call(&identity, action, payload).await;
        let result_stream = self.key(&format!("result:{from}"));
        let fields = match result {
            Ok(payload) => vec![
                ("msgId".to_string(), msg_id.clone()),
                ("ok".to_string(), "1".to_string()),
                ("payload".to_string(), payload.to_string()),
            ],
            Err(err) => vec![
                ("msgId".to_string(), msg_id.clone()),
                ("ok".to_string(), "0".to_string()),
                ("error".to_string(), serde_json::json!({"code": err.kind.as_wire_str(), "description": err.description}).to_string()),
            ],
        };
        if let Err(e) = self.driver.xadd(&result_stream, &fields, self.stream_maxlen).await {
            error!(err = %e, "failed to publish cluster call result");
        }
    }

    /// Long-running consumer of `result:<node_id>`: resolves this node's own
    /// pending cluster calls.
    pub async fn run_result_consumer(self: Arc<Self>) {
        let stream = self.key(&format!("result:{}", self.node_id));
        let mut last_id = "$".to_string();
        let mut backoff_ms = 500u64;
        loop {
            match self.driver.xread(&stream, &last_id, 5_000).await {
                Ok(entries) => {
                    backoff_ms = 500;
                    for entry in entries {
                        last_id = entry.id.clone();
                        self.resolve_result_entry(&entry).await;
                    }
                }
                Err(e) => {
                    error!(err = %e, "cluster result consumer xread failed, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = (backoff_ms * 2).min(30_000);
                }
            }
        }
    }

    async fn resolve_result_entry(&self, entry: &StreamEntry) {
        let Some(msg_id) = entry.fields.get("msgId") else {
            return;
        };
        let Some(pending) = self.pending.lock().await.remove(msg_id) else {
            debug!(msg_id = %msg_id, "cluster result for unknown/expired msgId, discarding");
            return;
        };
        let ok = entry.fields.get("ok").map(|s| s == "1").unwrap_or(false);
        let result = if ok {
            let payload = entry
                .fields
                .get("payload")
                .and_then(|p| serde_json::from_str(p).ok())
                .unwrap_or(Value::Null);
            Ok(payload)
        } else {
            let err_json: Value = entry
                .fields
                .get("error")
                .and_then(|e| serde_json::from_str(e).ok())
                .unwrap_or(Value::Null);
            let kind = err_json
                .get("code")
                .and_then(|c| c.as_str())
                .and_then(RpcErrorKind::from_wire_str)
                .unwrap_or(RpcErrorKind::GenericError);
            let description = err_json
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("cluster call failed")
                .to_string();
            Err(RpcError::new(kind, description))
        };
        let _ = pending.resolver.send(result);
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
