//! Error types for the realtime messaging core
//!
//! Component errors live next to their components (`MqttError`, `TokenError`,
//! `ConfigError`); the protocol-level errors shared between modules are here,
//! together with the crate-wide [`SdkError`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors surfaced by the RPC service
///
/// `Clone` because a single failure (a subscription error, a connection
/// close) fans out to several waiting callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error("[{context}] Client disconnected")]
    Disconnected { context: String },

    #[error("Request rejected with status {status}")]
    Rejected { response: Value, status: String },

    #[error("[{method}] Connection closed")]
    ConnectionClosed { method: String },

    #[error("[{method}] Transport error: {message}")]
    Transport { method: String, message: String },

    #[error("[{method}] Request cancelled")]
    Cancelled { method: String },

    #[error("Method {method} is already registered")]
    AlreadyRegistered { method: String },

    #[error("Method {method} was not registered")]
    NotRegistered { method: String },
}

impl RpcError {
    pub fn rejected(response: Value, status: impl Into<String>) -> Self {
        Self::Rejected {
            response,
            status: status.into(),
        }
    }

    /// HTTP-style status of a rejected response, if numeric
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => status.parse().ok(),
            _ => None,
        }
    }
}

/// Presence protocol error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceErrorKind {
    // recoverable
    KeepAliveTimedOut,
    ServerShutdown,
    SlowConsumer,
    WsError,
    // unrecoverable
    AccessDenied,
    InternalServerError,
    NotConnected,
    SessionReplaced,
    SerializationFailed,
    UnknownError,
    ConnectTimeout,
    InvalidCredentials,
    InvalidRequest,
    SessionTimeout,
}

impl PresenceErrorKind {
    /// Parse a server-provided type string; unknown types map to `UnknownError`
    pub fn from_type(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "KEEP_ALIVE_TIMED_OUT" => Self::KeepAliveTimedOut,
            "SERVER_SHUTDOWN" => Self::ServerShutdown,
            "SLOW_CONSUMER" => Self::SlowConsumer,
            "WS_ERROR" => Self::WsError,
            "ACCESS_DENIED" => Self::AccessDenied,
            "INTERNAL_SERVER_ERROR" => Self::InternalServerError,
            "NOT_CONNECTED" => Self::NotConnected,
            "SESSION_REPLACED" | "REPLACED" => Self::SessionReplaced,
            "SERIALIZATION_FAILED" => Self::SerializationFailed,
            "CONNECT_TIMEOUT" => Self::ConnectTimeout,
            "INVALID_CREDENTIALS" => Self::InvalidCredentials,
            "INVALID_REQUEST" => Self::InvalidRequest,
            "SESSION_TIMEOUT" => Self::SessionTimeout,
            _ => Self::UnknownError,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KeepAliveTimedOut => "KEEP_ALIVE_TIMED_OUT",
            Self::ServerShutdown => "SERVER_SHUTDOWN",
            Self::SlowConsumer => "SLOW_CONSUMER",
            Self::WsError => "WS_ERROR",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::InternalServerError => "INTERNAL_SERVER_ERROR",
            Self::NotConnected => "NOT_CONNECTED",
            Self::SessionReplaced => "SESSION_REPLACED",
            Self::SerializationFailed => "SERIALIZATION_FAILED",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::ConnectTimeout => "CONNECT_TIMEOUT",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::SessionTimeout => "SESSION_TIMEOUT",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::KeepAliveTimedOut | Self::ServerShutdown | Self::SlowConsumer | Self::WsError
        )
    }
}

impl fmt::Display for PresenceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol error reported by (or about) the presence service
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}")]
pub struct PresenceError {
    pub kind: PresenceErrorKind,
    /// Server marked the condition as transient (session continues via handover)
    pub is_transient: bool,
}

impl PresenceError {
    pub fn new(kind: PresenceErrorKind) -> Self {
        Self {
            kind,
            is_transient: false,
        }
    }

    /// Build from an error frame payload: `{ "type": "...", "is_transient": bool }`
    pub fn from_payload(payload: &Value) -> Self {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(PresenceErrorKind::from_type)
            .unwrap_or(PresenceErrorKind::UnknownError);
        let is_transient = payload
            .get("is_transient")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self { kind, is_transient }
    }

    /// Whether the session may survive this error through a handover
    pub fn is_recoverable(&self) -> bool {
        self.is_transient || self.kind.is_recoverable()
    }
}

/// Why a WebSocket transport or a presence session ended
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CloseReason {
    /// Socket closed by the peer or the network
    #[error("socket closed (code {code}, clean: {was_clean})")]
    Socket { code: u16, was_clean: bool },

    /// Transport-level error observed before the close
    #[error("transport error: {0}")]
    TransportError(String),

    /// Protocol error from the presence service
    #[error("protocol error: {0}")]
    Protocol(PresenceError),

    /// No keep-alive ping within the idle timeout
    #[error("keep-alive timed out")]
    KeepAliveTimedOut,

    /// No token could be obtained for the handshake
    #[error("token unavailable: {0}")]
    Token(crate::token::TokenError),

    /// Closed locally on request
    #[error("closed on request")]
    Requested,
}

impl CloseReason {
    pub fn protocol(kind: PresenceErrorKind) -> Self {
        Self::Protocol(PresenceError::new(kind))
    }

    /// The presence error kind this reason corresponds to
    pub fn kind(&self) -> Option<PresenceErrorKind> {
        match self {
            Self::Protocol(error) => Some(error.kind),
            Self::KeepAliveTimedOut => Some(PresenceErrorKind::KeepAliveTimedOut),
            Self::TransportError(_) => Some(PresenceErrorKind::WsError),
            Self::Socket { .. } | Self::Token(_) | Self::Requested => None,
        }
    }
}

/// Caller-layer timeout
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{context}Service or another peer not responding more than {timeout_ms} ms")]
pub struct TimeoutError {
    context: String,
    pub timeout_ms: u64,
}

impl TimeoutError {
    pub fn new(context: Option<&str>, timeout_ms: u64) -> Self {
        Self {
            context: context.map(|c| format!("[{c}] ")).unwrap_or_default(),
            timeout_ms,
        }
    }
}

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum SdkError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] crate::transport::mqtt::MqttError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Token error: {0}")]
    Token(#[from] crate::token::TokenError),

    #[error("Presence session ended: {0}")]
    Presence(#[from] CloseReason),

    #[error("Timeout: {0}")]
    Timeout(#[from] TimeoutError),
}

/// Result type for SDK operations
pub type SdkResult<T> = Result<T, SdkError>;

#[allow(clippy::unwrap_used)]
static SECRET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").unwrap());

const MAX_LOGGED_ERROR_LEN: usize = 500;

/// Redact credentials and truncate before error text reaches the logs
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_LOGGED_ERROR_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_LOGGED_ERROR_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
