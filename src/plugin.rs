//! Plugin surface (C13): passive lifecycle hooks (spec §4.12).
//!
//! Deliberately not the teacher's dylib/wasm plugin loader
//! (`plugins::manager::PluginManager`) — the spec scopes plugins to passive
//! in-process observers, so only the ordered-invocation/error-isolation
//! shape is carried over, not the dynamic loading machinery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::connection::Connection;

/// A passive observer attached via `onConnection`; MUST NOT block the
/// upgrade path (spec §4.12) — any async work it wants to do should detach
/// via `tokio::spawn` internally rather than being awaited by the caller
/// for longer than necessary.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Invoked once during registration. Errors are caught and logged,
    /// never crash the server (spec §7 propagation policy).
    async fn on_init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after auth succeeds and before handler code.
    async fn on_connection(&self, _conn: Arc<Connection>) {}

    /// Runs after transport close.
    async fn on_disconnect(&self, _identity: &str) {}

    /// Runs on server shutdown; the server waits for this to resolve with a
    /// bounded grace period (default 5s, see [`PluginManager::shutdown`]).
    async fn on_close(&self) {}
}

/// Ordered list of plugins, invoked in registration order (spec §4.12).
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    close_grace: Duration,
}

impl PluginManager {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            close_grace: Duration::from_secs(5),
        }
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Invoke `on_init` for every plugin; a failing plugin is logged and
    /// skipped rather than aborting registration of the others.
    pub async fn init_all(&self) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.on_init().await {
                error!(plugin = plugin.name(), err = %e, "plugin onInit failed — continuing");
            }
        }
    }

    pub async fn notify_connection(&self, conn: Arc<Connection>) {
        for plugin in &self.plugins {
            plugin.on_connection(conn.clone()).await;
        }
    }

    pub async fn notify_disconnect(&self, identity: &str) {
        for plugin in &self.plugins {
            plugin.on_disconnect(identity).await;
        }
    }

    /// Run every plugin's `on_close`, bounded by `close_grace` in aggregate —
    /// a slow/hanging plugin does not block server shutdown indefinitely.
    pub async fn shutdown(&self) {
        let grace = self.close_grace;
        let plugins = self.plugins.clone();
        let all_closed = async move {
            for plugin in &plugins {
                plugin.on_close().await;
            }
        };
        if tokio::time::timeout(grace, all_closed).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "plugin onClose grace period exceeded — proceeding with shutdown");
        }
    }
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}
