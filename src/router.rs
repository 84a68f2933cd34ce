//! Router (C10): middleware chain, auth callback, and route-local
//! config/CORS bound to matched path patterns (spec §4.9).
//!
//! The spec's `ctx.next(extra)` JS idiom is expressed here as an explicit
//! `Result<Option<Value>, Abort>` sequence rather than a literal callback —
//! per the design note in spec §9 ("middleware chain without exceptions for
//! control flow... a value, not an exception"): each middleware returns the
//! `extra` state to merge instead of invoking a continuation, and the
//! dispatcher (not the middleware) decides whether to continue. Calling
//! `next` twice has no Rust equivalent to misuse, since there is no `next`
//! to call — the type system rules it out instead of runtime-checking it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::handshake::HandshakeInfo;
use crate::rpc::HandlerFn;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abort an upgrade in progress with an HTTP status (spec §4.9, §7).
#[derive(Debug, Clone)]
pub struct Abort {
    pub status: u16,
    pub reason: String,
    pub extra_headers: Vec<(String, String)>,
}

impl Abort {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            extra_headers: Vec::new(),
        }
    }
}

/// Mutable state threaded through a chain; middlewares merge `extra` maps
/// into `state` as they run.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareContext {
    pub handshake: Option<HandshakeInfo>,
    pub state: Map<String, Value>,
}

pub type MiddlewareFn =
    Arc<dyn Fn(MiddlewareContext) -> BoxFuture<'static, Result<(MiddlewareContext, Option<Value>), Abort>> + Send + Sync>;

/// `(accept, reject)` decision for an auth callback (spec §4.9).
pub enum AuthDecision {
    Accept {
        protocol: String,
        session_marker: Option<Value>,
    },
    Reject {
        code: u16,
        reason: String,
        extra_headers: Vec<(String, String)>,
    },
}

pub type AuthFn = Arc<
    dyn Fn(HandshakeInfo) -> BoxFuture<'static, AuthDecision> + Send + Sync,
>;

/// Route-local CORS overrides; `None` fields fall back to the server-level
/// policy (spec §4.10 step 5).
#[derive(Debug, Clone, Default)]
pub struct CorsOpts {
    pub allowed_origins: Option<Vec<String>>,
    pub allowed_ip_rules: Option<Vec<String>>,
}

/// `{ patterns, middlewares, auth_cb?, cors_opts?, route_cfg? }` (spec §3).
pub struct Router {
    pub patterns: Vec<String>,
    middlewares: Vec<MiddlewareFn>,
    auth: Option<AuthFn>,
    pub cors: CorsOpts,
    handlers: Vec<(String, String, HandlerFn)>,
    wildcard_handler: Option<HandlerFn>,
}

impl PartialEq for Router {
    /// Identity equality — used only by [`crate::trie::RadixTrie::insert`]
    /// to make re-registering the identical `Arc<Router>` at a pattern
    /// idempotent rather than registering it twice.
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Router {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns,
            middlewares: Vec::new(),
            auth: None,
            cors: CorsOpts::default(),
            handlers: Vec::new(),
            wildcard_handler: None,
        }
    }

    pub fn use_middleware(&mut self, mw: MiddlewareFn) {
        self.middlewares.push(mw);
    }

    pub fn auth(&mut self, cb: AuthFn) {
        self.auth = Some(cb);
    }

    pub fn handle(&mut self, variant: impl Into<String>, action: impl Into<String>, handler: HandlerFn) {
        self.handlers.push((variant.into(), action.into(), handler));
    }

    pub fn handle_wildcard(&mut self, handler: HandlerFn) {
        self.wildcard_handler = Some(handler);
    }

    pub fn auth_callback(&self) -> Option<&AuthFn> {
        self.auth.as_ref()
    }

    pub fn handlers(&self) -> &[(String, String, HandlerFn)] {
        &self.handlers
    }

    pub fn wildcard_handler(&self) -> Option<&HandlerFn> {
        self.wildcard_handler.as_ref()
    }

    /// Run this router's middleware chain against `ctx`, short-circuiting
    /// on the first `Abort`. Each middleware's returned `extra` is merged
    /// into `ctx.state` before the next middleware runs.
    pub async fn run_chain(&self, mut ctx: MiddlewareContext) -> Result<MiddlewareContext, Abort> {
        for mw in &self.middlewares {
            let (next_ctx, extra) = mw(ctx).await?;
            ctx = next_ctx;
            if let Some(Value::Object(extra_map)) = extra {
                ctx.state.extend(extra_map);
            }
        }
        Ok(ctx)
    }
}

/// Compose several routers' chains followed by a global chain, per spec
/// §4.10 step 6 ("matched routers, followed by the global chain").
pub async fn run_composed_chain(
    routers: &[Arc<Router>],
    global: &[MiddlewareFn],
    mut ctx: MiddlewareContext,
) -> Result<MiddlewareContext, Abort> {
    for router in routers {
        ctx = router.run_chain(ctx).await?;
    }
    for mw in global {
        let (next_ctx, extra) = mw(ctx).await?;
        ctx = next_ctx;
        if let Some(Value::Object(extra_map)) = extra {
            ctx.state.extend(extra_map);
        }
    }
    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passthrough_mw(extra_key: &'static str) -> MiddlewareFn {
        Arc::new(move |ctx| {
            Box::pin(async move {
                let extra = serde_json::json!({ extra_key: true });
                Ok((ctx, Some(extra)))
            })
        })
    }

    fn aborting_mw(status: u16) -> MiddlewareFn {
        Arc::new(move |_ctx| Box::pin(async move { Err(Abort::new(status, "blocked")) }))
    }

    #[tokio::test]
    async fn chain_merges_extra_state_in_order() {
        let mut router = Router::new(vec!["/ocpp/:identity".to_string()]);
        router.use_middleware(passthrough_mw("a"));
        router.use_middleware(passthrough_mw("b"));
        let ctx = router.run_chain(MiddlewareContext::default()).await.unwrap();
        assert_eq!(ctx.state.get("a"), Some(&Value::Bool(true)));
        assert_eq!(ctx.state.get("b"), Some(&Value::Bool(true)));
    }

    #[tokio::test]
    async fn chain_short_circuits_on_abort() {
        let mut router = Router::new(vec!["/ocpp/:identity".to_string()]);
        router.use_middleware(aborting_mw(403));
        router.use_middleware(passthrough_mw("never"));
        let err = router
            .run_chain(MiddlewareContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
    }

    #[tokio::test]
    async fn composed_chain_runs_router_then_global() {
        let router = Arc::new({
            let mut r = Router::new(vec!["/ocpp/:identity".to_string()]);
            r.use_middleware(passthrough_mw("router"));
            r
        });
        let global = vec![passthrough_mw("global")];
        let ctx = run_composed_chain(&[router], &global, MiddlewareContext::default())
            .await
            .unwrap();
        assert_eq!(ctx.state.get("router"), Some(&Value::Bool(true)));
        assert_eq!(ctx.state.get("global"), Some(&Value::Bool(true)));
    }
}
