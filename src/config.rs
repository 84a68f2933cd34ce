//! Server and client configuration (spec §A.3).
//!
//! Priority (highest to lowest): CLI / env  >  TOML file  >  built-in
//! default, following the teacher's `config::DaemonConfig::new` layering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tracing::error;

const DEFAULT_PORT: u16 = 9220;
const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_MAX_SESSIONS: usize = 50_000;
const DEFAULT_MAX_BAD_MESSAGES: u32 = 10;
const DEFAULT_CALL_CONCURRENCY: usize = 4;
const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 128 * 1024;
const DEFAULT_CHANNEL_PREFIX: &str = "ocpp-ws-io:";
const DEFAULT_STREAM_MAXLEN: usize = 10_000;
const DEFAULT_CONN_RATE_LIMIT: u64 = 20;
const DEFAULT_CONN_RATE_WINDOW_MS: u64 = 1_000;

/// `{data_dir}/config.toml` — every field is an optional override layered
/// beneath CLI/env, above the built-in default.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    bind_addr: Option<String>,
    log: Option<String>,
    max_sessions: Option<usize>,
    max_bad_messages: Option<u32>,
    call_concurrency: Option<usize>,
    ping_interval_ms: Option<u64>,
    max_message_bytes: Option<usize>,
    security_profile: Option<u8>,
    strict_validation: Option<bool>,
    respond_with_detailed_errors: Option<bool>,
    redis_url: Option<String>,
    node_id: Option<String>,
    channel_prefix: Option<String>,
    stream_maxlen: Option<usize>,
    allowed_protocols: Option<Vec<String>>,
    conn_rate_limit: Option<u64>,
    conn_rate_window_ms: Option<u64>,
    allowed_origins: Option<Vec<String>>,
    allowed_ip_rules: Option<Vec<String>>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    tls_client_ca_path: Option<PathBuf>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// CLI surface. Every option falls back to `OCPP_*` env vars via clap's
/// `env` attribute before the TOML layer is consulted.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ocpp-rt", about = "OCPP-J CSMS runtime")]
pub struct Cli {
    #[arg(long, env = "OCPP_PORT")]
    pub port: Option<u16>,
    #[arg(long, env = "OCPP_BIND_ADDR")]
    pub bind_addr: Option<String>,
    #[arg(long, env = "OCPP_DATA_DIR")]
    pub data_dir: Option<PathBuf>,
    #[arg(long, env = "OCPP_LOG")]
    pub log: Option<String>,
    /// Daily-rolling log file path; when set, logs go to stdout and this file.
    #[arg(long, env = "OCPP_LOG_FILE")]
    pub log_file: Option<PathBuf>,
    #[arg(long, env = "OCPP_MAX_SESSIONS")]
    pub max_sessions: Option<usize>,
    #[arg(long, env = "OCPP_REDIS_URL")]
    pub redis_url: Option<String>,
    #[arg(long, env = "OCPP_NODE_ID")]
    pub node_id: Option<String>,
    /// Server certificate chain (PEM), required for security profiles 2/3.
    #[arg(long, env = "OCPP_TLS_CERT")]
    pub tls_cert_path: Option<PathBuf>,
    /// Server private key (PEM), required for security profiles 2/3.
    #[arg(long, env = "OCPP_TLS_KEY")]
    pub tls_key_path: Option<PathBuf>,
    /// Trusted client CA bundle (PEM), required for security profile 3 (mTLS).
    #[arg(long, env = "OCPP_TLS_CLIENT_CA")]
    pub tls_client_ca_path: Option<PathBuf>,
}

/// Resolved server configuration, immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub log: String,
    pub log_file: Option<PathBuf>,
    pub max_sessions: usize,
    pub max_bad_messages: u32,
    pub call_concurrency: usize,
    pub ping_interval_ms: u64,
    pub max_message_bytes: usize,
    /// 0..3, spec §6. 0 = plain, 1 = Basic Auth/plain, 2 = Basic Auth/TLS, 3 = mTLS.
    pub security_profile: u8,
    pub strict_validation: bool,
    pub respond_with_detailed_errors: bool,
    /// `None` disables the cluster adapter (C12); single-process mode.
    pub redis_url: Option<String>,
    pub node_id: String,
    pub channel_prefix: String,
    pub stream_maxlen: usize,
    /// Subprotocols this server's auth callback is willing to negotiate when
    /// no route-level allow-list overrides it. Empty means "accept anything
    /// mutually offered".
    pub allowed_protocols: Vec<String>,
    /// Connections per source IP per `conn_rate_window_ms` before the
    /// upgrade is rejected with 429 (spec §4.10 step 1).
    pub conn_rate_limit: u64,
    pub conn_rate_window_ms: u64,
    /// Server-level CORS defaults; a route's [`crate::router::CorsOpts`]
    /// overrides these when set.
    pub allowed_origins: Vec<String>,
    pub allowed_ip_rules: Vec<String>,
    pub providers: HashMap<String, ProviderProfile>,
    /// Server certificate chain (PEM), required for security profiles 2/3.
    pub tls_cert_path: Option<PathBuf>,
    /// Server private key (PEM), required for security profiles 2/3.
    pub tls_key_path: Option<PathBuf>,
    /// Trusted client CA bundle (PEM), required for security profile 3 (mTLS).
    pub tls_client_ca_path: Option<PathBuf>,
}

/// Placeholder for per-subprotocol tuning knobs an embedder might add
/// (kept from the teacher's `[provider.*]` TOML section shape; unused by
/// the core engine itself beyond being threaded through to handlers).
#[derive(Debug, Clone, Deserialize, Default, serde::Serialize)]
pub struct ProviderProfile {
    pub timeout_ms: Option<u64>,
}

fn default_data_dir() -> PathBuf {
    dirs_data_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn dirs_data_dir() -> Option<PathBuf> {
    std::env::var_os("OCPP_DATA_DIR")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".ocpp-rt")))
}

impl ServerConfig {
    /// Build config from parsed CLI args + optional TOML file, per the
    /// priority order documented on [`TomlConfig`].
    pub fn from_cli(cli: Cli) -> Self {
        let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        Self {
            port: cli.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            bind_addr: cli
                .bind_addr
                .or(toml.bind_addr)
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            data_dir,
            log: cli.log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            log_file: cli.log_file,
            max_sessions: cli
                .max_sessions
                .or(toml.max_sessions)
                .unwrap_or(DEFAULT_MAX_SESSIONS),
            max_bad_messages: toml.max_bad_messages.unwrap_or(DEFAULT_MAX_BAD_MESSAGES),
            call_concurrency: toml
                .call_concurrency
                .unwrap_or(DEFAULT_CALL_CONCURRENCY),
            ping_interval_ms: toml.ping_interval_ms.unwrap_or(DEFAULT_PING_INTERVAL_MS),
            max_message_bytes: toml
                .max_message_bytes
                .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES),
            security_profile: toml.security_profile.unwrap_or(0),
            strict_validation: toml.strict_validation.unwrap_or(true),
            respond_with_detailed_errors: toml.respond_with_detailed_errors.unwrap_or(false),
            redis_url: std::env::var("OCPP_REDIS_URL")
                .ok()
                .or(cli.redis_url)
                .or(toml.redis_url),
            node_id: cli
                .node_id
                .or(toml.node_id)
                .unwrap_or_else(random_node_id),
            channel_prefix: toml
                .channel_prefix
                .unwrap_or_else(|| DEFAULT_CHANNEL_PREFIX.to_string()),
            stream_maxlen: toml.stream_maxlen.unwrap_or(DEFAULT_STREAM_MAXLEN),
            allowed_protocols: toml.allowed_protocols.unwrap_or_default(),
            conn_rate_limit: toml.conn_rate_limit.unwrap_or(DEFAULT_CONN_RATE_LIMIT),
            conn_rate_window_ms: toml
                .conn_rate_window_ms
                .unwrap_or(DEFAULT_CONN_RATE_WINDOW_MS),
            allowed_origins: toml.allowed_origins.unwrap_or_default(),
            allowed_ip_rules: toml.allowed_ip_rules.unwrap_or_default(),
            providers: HashMap::new(),
            tls_cert_path: cli.tls_cert_path.or(toml.tls_cert_path),
            tls_key_path: cli.tls_key_path.or(toml.tls_key_path),
            tls_client_ca_path: cli.tls_client_ca_path.or(toml.tls_client_ca_path),
        }
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            port: 0,
            bind_addr: "127.0.0.1".to_string(),
            data_dir: PathBuf::from("."),
            log: "info".to_string(),
            log_file: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            max_bad_messages: DEFAULT_MAX_BAD_MESSAGES,
            call_concurrency: DEFAULT_CALL_CONCURRENCY,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            security_profile: 0,
            strict_validation: true,
            respond_with_detailed_errors: false,
            redis_url: None,
            node_id: "test-node".to_string(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            stream_maxlen: DEFAULT_STREAM_MAXLEN,
            allowed_protocols: vec![],
            conn_rate_limit: DEFAULT_CONN_RATE_LIMIT,
            conn_rate_window_ms: DEFAULT_CONN_RATE_WINDOW_MS,
            allowed_origins: vec![],
            allowed_ip_rules: vec![],
            providers: HashMap::new(),
            tls_cert_path: None,
            tls_key_path: None,
            tls_client_ca_path: None,
        }
    }
}

fn random_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4())
}

/// Client-side configuration for the reconnecting charging-station client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub identity: String,
    pub protocols: Vec<String>,
    pub call_timeout_ms: u64,
    pub call_concurrency: usize,
    pub ping_interval_ms: u64,
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnects: Option<u32>,
    pub strict_validation: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            identity: String::new(),
            protocols: vec!["ocpp1.6".to_string()],
            call_timeout_ms: 30_000,
            call_concurrency: DEFAULT_CALL_CONCURRENCY,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            backoff_min_ms: 1_000,
            backoff_max_ms: 60_000,
            max_reconnects: None,
            strict_validation: true,
        }
    }
}
