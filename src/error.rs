//! Error taxonomy for the OCPP-J runtime.
//!
//! Names carry semantics, not implementation type identity — `RpcErrorKind`
//! maps 1:1 to the OCPP-J wire error codes of the specification; everything
//! else here covers transport, routing, cluster and validation failures that
//! never reach the wire directly.

use std::fmt;

/// The OCPP-J `CALLERROR` error codes (spec §7).
///
/// `OccurenceConstraintViolation` (sic) is the legacy misspelling some peers
/// emit on the wire; we decode it into the same kind as the correctly
/// spelled variant but never encode it ourselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    GenericError,
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    FormatViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    MessageTypeNotSupported,
    RpcFrameworkError,
}

impl RpcErrorKind {
    /// The wire string for this error code. Always the correctly spelled form.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            RpcErrorKind::GenericError => "GenericError",
            RpcErrorKind::NotImplemented => "NotImplemented",
            RpcErrorKind::NotSupported => "NotSupported",
            RpcErrorKind::InternalError => "InternalError",
            RpcErrorKind::ProtocolError => "ProtocolError",
            RpcErrorKind::SecurityError => "SecurityError",
            RpcErrorKind::FormationViolation => "FormationViolation",
            RpcErrorKind::FormatViolation => "FormatViolation",
            RpcErrorKind::PropertyConstraintViolation => "PropertyConstraintViolation",
            RpcErrorKind::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            RpcErrorKind::TypeConstraintViolation => "TypeConstraintViolation",
            RpcErrorKind::MessageTypeNotSupported => "MessageTypeNotSupported",
            RpcErrorKind::RpcFrameworkError => "RpcFrameworkError",
        }
    }

    /// Decode a wire error code string, accepting both the correct and the
    /// legacy-misspelled `OccurenceConstraintViolation` for compatibility.
    pub fn from_wire_str(s: &str) -> Option<Self> {
        Some(match s {
            "GenericError" => RpcErrorKind::GenericError,
            "NotImplemented" => RpcErrorKind::NotImplemented,
            "NotSupported" => RpcErrorKind::NotSupported,
            "InternalError" => RpcErrorKind::InternalError,
            "ProtocolError" => RpcErrorKind::ProtocolError,
            "SecurityError" => RpcErrorKind::SecurityError,
            "FormationViolation" => RpcErrorKind::FormationViolation,
            "FormatViolation" => RpcErrorKind::FormatViolation,
            "PropertyConstraintViolation" => RpcErrorKind::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" | "OccurenceConstraintViolation" => {
                RpcErrorKind::OccurrenceConstraintViolation
            }
            "TypeConstraintViolation" => RpcErrorKind::TypeConstraintViolation,
            "MessageTypeNotSupported" => RpcErrorKind::MessageTypeNotSupported,
            "RpcFrameworkError" => RpcErrorKind::RpcFrameworkError,
            _ => return None,
        })
    }
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

/// An OCPP-J `CALLERROR` as raised by a handler or the RPC engine itself.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {description}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub description: String,
    pub details: serde_json::Value,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_implemented() -> Self {
        Self::new(
            RpcErrorKind::NotImplemented,
            "Requested method is not known",
        )
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::InternalError, description)
    }
}

/// Transport-level failures (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("unexpected HTTP response during upgrade: {0}")]
    UnexpectedHttpResponse(u16),
    #[error("WebSocket upgrade failed: {0}")]
    WebsocketUpgradeError(String),
    #[error("connection closed: code={code:?} reason={reason}")]
    ConnectionClosed { code: Option<u16>, reason: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors raised by the radix trie router (C5).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("conflicting parameter name at the same trie position: `{existing}` vs `{new}`")]
    ConflictingParamName { existing: String, new: String },
}

/// Errors raised by the cluster adapter (C12).
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("identity `{0}` has no known presence record")]
    NotConnected(String),
    #[error("cluster call to `{0}` timed out")]
    Timeout(String),
    #[error(transparent)]
    Driver(#[from] redis::RedisError),
    #[error("malformed stream entry: {0}")]
    MalformedEntry(String),
}

/// Errors raised while compiling or evaluating a JSON schema (C2).
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("schema `{0}` failed to compile: {1}")]
    Compile(String, String),
}

/// Why an outbound [`crate::rpc::RpcEngine::call`] did not resolve with a
/// CALLRESULT payload (spec §8: "exactly one of {…, timeout, cancel,
/// ConnectionClosed} resolves X's future"). Kept distinct from a plain
/// `RpcError` so a caller can `match` on which of the three happened instead
/// of string-matching `description`.
#[derive(Debug, thiserror::Error)]
pub enum CallFailure {
    /// A CALLERROR came back on the wire, or was raised locally (schema
    /// validation, queue rejection) before the frame was ever sent.
    #[error(transparent)]
    Rpc(#[from] RpcError),
    /// No response arrived before the call's deadline.
    #[error("call timed out before a response arrived")]
    Timeout,
    /// The connection transitioned to CLOSED before the call resolved.
    #[error("connection closed before a response arrived: {reason}")]
    ConnectionClosed { reason: String },
}

impl CallFailure {
    /// Flatten into a plain [`RpcError`] for boundaries that only speak the
    /// wire-facing taxonomy (e.g. forwarding a failure to another peer).
    pub fn into_rpc_error(self) -> RpcError {
        match self {
            CallFailure::Rpc(e) => e,
            CallFailure::Timeout => RpcError::new(RpcErrorKind::GenericError, "call timed out"),
            CallFailure::ConnectionClosed { reason } => {
                RpcError::new(RpcErrorKind::GenericError, format!("connection closed: {reason}"))
            }
        }
    }
}

/// Errors raised building the server's TLS acceptor for security profiles
/// 2/3 (spec §6).
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("security profile {0} requires `tls_cert_path`/`tls_key_path` to be configured")]
    MissingCertConfig(u8),
    #[error("security profile 3 (mTLS) requires `tls_client_ca_path` to be configured")]
    MissingClientCa,
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("client certificate verifier setup failed: {0}")]
    ClientVerifier(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}
