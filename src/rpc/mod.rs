//! RPC engine (C8): framing, correlation, error mapping, and the
//! exact/wildcard handler registry (spec §4.7).
//!
//! Structurally grounded in the teacher's `ipc::dispatch_text` (parse →
//! look up → invoke → build response, with request/response correlation by
//! id) generalized from JSON-RPC 2.0's `id` field to OCPP-J's `msgId`, and
//! from a single request/response pair to a full outbound-CALL pending-map
//! plus inbound-CALL handler dispatch in both directions.

pub mod message;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{CallFailure, RpcError, RpcErrorKind};
use crate::queue::ConcurrencyQueue;
use crate::session::Session;
use crate::validator::SchemaSet;
use message::{decode, DecodeOutcome, RpcMessage};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler's non-error return: either a CALLRESULT payload, or the
/// `NOREPLY` sentinel suppressing any reply at all (spec §4.7).
pub enum HandlerOutcome {
    Reply(Value),
    NoReply,
}

/// Context visible to a handler: the connection's negotiated variant,
/// identity, and its durable session bag. Deliberately does not expose the
/// `Connection` itself — handlers interact with peers only through their
/// return value or by calling back out through the server registry.
#[derive(Clone)]
pub struct HandlerContext {
    pub variant: String,
    pub identity: String,
    pub session: Arc<Session>,
}

pub type HandlerFn =
    Arc<dyn Fn(Value, HandlerContext) -> BoxFuture<'static, Result<HandlerOutcome, RpcError>> + Send + Sync>;

#[derive(Default)]
struct HandlerRegistry {
    /// Keyed by `(variant, action)`.
    typed: HashMap<(String, String), HandlerFn>,
    wildcard: Option<HandlerFn>,
}

impl HandlerRegistry {
    /// Lookup order: exact match on negotiated variant, then wildcard.
    fn lookup(&self, variant: &str, action: &str) -> Option<HandlerFn> {
        self.typed
            .get(&(variant.to_string(), action.to_string()))
            .cloned()
            .or_else(|| self.wildcard.clone())
    }
}

struct PendingCall {
    action: String,
    resolver: oneshot::Sender<Result<Value, CallFailure>>,
    deadline: Instant,
}

/// Options for an outbound [`RpcEngine::call`].
#[derive(Clone, Copy)]
pub struct CallOpts {
    pub timeout_ms: u64,
}

impl Default for CallOpts {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Result of feeding one inbound wire frame through the engine.
pub struct DispatchResult {
    /// Wire frame to send back immediately, if any.
    pub reply: Option<String>,
    /// Set to the close code the connection must now close with, once the
    /// bad-message threshold is exceeded (spec §5 backpressure, §8).
    pub close_with: Option<u16>,
}

impl DispatchResult {
    fn reply_only(reply: String) -> Self {
        Self {
            reply: Some(reply),
            close_with: None,
        }
    }

    fn none() -> Self {
        Self {
            reply: None,
            close_with: None,
        }
    }
}

/// Per-connection RPC state (spec §4.7). Not `Clone` — one engine per
/// connection, wrapped in `Arc` by its owning [`crate::connection::Connection`].
pub struct RpcEngine {
    handlers: RwLock<HandlerRegistry>,
    pending: Mutex<HashMap<String, PendingCall>>,
    queue: ConcurrencyQueue,
    validator: Option<Arc<SchemaSet>>,
    strict: bool,
    respond_with_detailed_errors: bool,
    bad_message_count: AtomicU32,
    max_bad_messages: u32,
}

impl RpcEngine {
    pub fn new(
        call_concurrency: usize,
        validator: Option<Arc<SchemaSet>>,
        strict: bool,
        respond_with_detailed_errors: bool,
        max_bad_messages: u32,
    ) -> Self {
        Self {
            handlers: RwLock::new(HandlerRegistry::default()),
            pending: Mutex::new(HashMap::new()),
            queue: ConcurrencyQueue::new(call_concurrency.max(1)),
            validator,
            strict,
            respond_with_detailed_errors,
            bad_message_count: AtomicU32::new(0),
            max_bad_messages,
        }
    }

    pub async fn register(&self, variant: impl Into<String>, action: impl Into<String>, handler: HandlerFn) {
        self.handlers
            .write()
            .await
            .typed
            .insert((variant.into(), action.into()), handler);
    }

    pub async fn register_wildcard(&self, handler: HandlerFn) {
        self.handlers.write().await.wildcard = Some(handler);
    }

    pub fn bad_message_count(&self) -> u32 {
        self.bad_message_count.load(Ordering::SeqCst)
    }

    /// Feed one raw inbound text frame through framing, validation, and
    /// handler dispatch (spec §4.7 steps 1-3).
    pub async fn dispatch_inbound(
        &self,
        raw: &str,
        variant: &str,
        identity: &str,
        session: Arc<Session>,
    ) -> DispatchResult {
        match decode(raw) {
            DecodeOutcome::Unrecoverable { .. } => self.record_bad_message(),
            DecodeOutcome::Malformed {
                msg_id_echo, kind, ..
            } => {
                let reply = RpcMessage::call_error(
                    msg_id_echo,
                    &RpcError::new(kind, "malformed frame"),
                )
                .encode();
                let mut result = self.record_bad_message();
                result.reply = Some(reply);
                result
            }
            DecodeOutcome::Ok(RpcMessage::Call {
                msg_id,
                action,
                payload,
            }) => self.dispatch_call(msg_id, action, payload, variant, identity, session).await,
            DecodeOutcome::Ok(RpcMessage::CallResult { msg_id, payload }) => {
                self.resolve_pending(&msg_id, Ok(payload)).await;
                DispatchResult::none()
            }
            DecodeOutcome::Ok(RpcMessage::CallError {
                msg_id,
                error_code,
                error_description,
                error_details,
            }) => {
                let kind = RpcErrorKind::from_wire_str(&error_code)
                    .unwrap_or(RpcErrorKind::GenericError);
                let err = RpcError::new(kind, error_description).with_details(error_details);
                self.resolve_pending(&msg_id, Err(err)).await;
                DispatchResult::none()
            }
        }
    }

    async fn dispatch_call(
        &self,
        msg_id: String,
        action: String,
        payload: Value,
        variant: &str,
        identity: &str,
        session: Arc<Session>,
    ) -> DispatchResult {
        if self.strict {
            if let Some(validator) = &self.validator {
                let schema_id = format!("urn:{action}.req");
                if let Err(err) = validator.validate(&schema_id, &payload) {
                    let reply = RpcMessage::call_error(msg_id, &err).encode();
                    return DispatchResult::reply_only(reply);
                }
            }
        }

        let handler = self.handlers.read().await.lookup(variant, &action);
        let Some(handler) = handler else {
            let reply = RpcMessage::call_error(msg_id, &RpcError::not_implemented()).encode();
            return DispatchResult::reply_only(reply);
        };

        let ctx = HandlerContext {
            variant: variant.to_string(),
            identity: identity.to_string(),
            session,
        };

        let outcome = handler(payload, ctx).await;
        match outcome {
            Ok(HandlerOutcome::NoReply) => DispatchResult::none(),
            Ok(HandlerOutcome::Reply(response)) => {
                if let Some(validator) = &self.validator {
                    // §9 open question 3: CALLRESULT validation is advisory,
                    // never rejects a reply that's already been computed.
                    let schema_id = format!("urn:{action}.conf");
                    if let Err(e) = validator.validate(&schema_id, &response) {
                        debug!(action = %action, err = %e, "outbound CALLRESULT failed advisory validation");
                    }
                }
                let reply = RpcMessage::CallResult {
                    msg_id,
                    payload: response,
                }
                .encode();
                DispatchResult::reply_only(reply)
            }
            Err(mut err) => {
                if !self.respond_with_detailed_errors {
                    err.details = Value::Object(Default::default());
                }
                DispatchResult::reply_only(RpcMessage::call_error(msg_id, &err).encode())
            }
        }
    }

    async fn resolve_pending(&self, msg_id: &str, result: Result<Value, RpcError>) {
        let pending = self.pending.lock().await.remove(msg_id);
        match pending {
            Some(p) => {
                let _ = p.resolver.send(result.map_err(CallFailure::Rpc));
            }
            None => warn!(msg_id = %msg_id, "unmatched CALLRESULT/CALLERROR, discarding"),
        }
    }

    fn record_bad_message(&self) -> DispatchResult {
        let count = self.bad_message_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.max_bad_messages {
            DispatchResult {
                reply: None,
                close_with: Some(1007),
            }
        } else {
            DispatchResult::none()
        }
    }

    /// Outbound `call(action, payload, opts)` (spec §4.7). `send` transmits
    /// the already-encoded wire frame, e.g. into a [`crate::connection::Connection`]'s
    /// outbound buffer; it is invoked inside the concurrency queue (C3), so
    /// at most `call_concurrency` calls are in flight on the wire at once.
    pub async fn call<F>(
        &self,
        action: &str,
        payload: Value,
        opts: CallOpts,
        send: F,
    ) -> Result<Value, CallFailure>
    where
        F: FnOnce(String) -> Result<(), RpcError> + Send + 'static,
    {
        if self.strict {
            if let Some(validator) = &self.validator {
                let schema_id = format!("urn:{action}.req");
                validator.validate(&schema_id, &payload)?;
            }
        }

        let msg_id = new_msg_id();
        let (resolver, receiver) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_millis(opts.timeout_ms);
        self.pending.lock().await.insert(
            msg_id.clone(),
            PendingCall {
                action: action.to_string(),
                resolver,
                deadline,
            },
        );

        let frame = RpcMessage::Call {
            msg_id: msg_id.clone(),
            action: action.to_string(),
            payload,
        }
        .encode();

        let queue_result: Result<(), RpcError> = self.queue.push(async move { send(frame) }).await;
        if let Err(e) = queue_result {
            self.pending.lock().await.remove(&msg_id);
            return Err(CallFailure::Rpc(e));
        }

        match tokio::time::timeout(Duration::from_millis(opts.timeout_ms), receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallFailure::Rpc(RpcError::new(
                RpcErrorKind::InternalError,
                "pending call dropped before resolution",
            ))),
            Err(_) => {
                self.pending.lock().await.remove(&msg_id);
                Err(CallFailure::Timeout)
            }
        }
    }

    /// Reject every pending call with a `ConnectionClosed`-flavored error,
    /// called on transition to CLOSED (spec §3 invariant, §4.8, §5).
    pub async fn reject_all_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, p) in pending.drain() {
            let _ = p.resolver.send(Err(CallFailure::ConnectionClosed {
                reason: reason.to_string(),
            }));
        }
    }

    /// Pending calls whose deadline has already elapsed; callers should
    /// invoke this on a periodic tick and fail them with a timeout error
    /// (deadlines also apply while CONNECTING — spec §4.8 outbound buffering).
    pub async fn expire_overdue(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        let expired: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, p)| {
                debug!(action = %p.action, msg_id = %id, "outbound call deadline expired");
                id.clone()
            })
            .collect();
        for id in expired {
            if let Some(p) = pending.remove(&id) {
                let _ = p.resolver.send(Err(CallFailure::Timeout));
            }
        }
    }
}

fn new_msg_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
