//! Error types for mcplink
//!
//! This module defines every error surfaced by the session, client, and
//! transport layers, using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for mcplink operations
///
/// Failures are returned as [`anyhow::Error`] values wrapping one of these
/// variants, so callers can classify them with
/// `err.downcast_ref::<McpError>()`.
#[derive(Error, Debug)]
pub enum McpError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The transport could not be established or an I/O operation failed
    #[error("MCP transport error: {0}")]
    Transport(String),

    /// The transport was closed while the operation was outstanding
    #[error("MCP transport closed")]
    TransportClosed,

    /// Protocol-level failure detected on the client side
    #[error("MCP protocol error: {0}")]
    Protocol(String),

    /// The server answered a request with a JSON-RPC error object
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Human-readable message from the server
        message: String,
        /// Optional structured error payload
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the configured window
    #[error("MCP timeout: no response to `{method}` within {timeout_ms}ms")]
    Timeout {
        /// The request method that timed out
        method: String,
        /// The timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// The server selected a protocol version this client does not speak
    #[error("MCP protocol version mismatch: supported {supported:?}, server chose {got}")]
    ProtocolVersion {
        /// Versions the client advertised
        supported: Vec<String>,
        /// Version the server selected
        got: String,
    },

    /// An operation was attempted before the initialize handshake completed
    #[error("client must be initialized before {0}")]
    NotInitialized(String),

    /// The server did not advertise the capability an operation requires
    #[error("server does not support `{capability}`, required by {action}")]
    CapabilityNotSupported {
        /// Capability name (tools, resources, ...)
        capability: String,
        /// The client operation that required it
        action: String,
    },

    /// The client or transport is in a state that forbids the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A tool call completed but flagged its result as an error
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl McpError {
    /// Returns `true` for [`McpError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }

    /// Returns `true` for errors raised by the transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McpError::Transport(_) | McpError::TransportClosed | McpError::Http(_)
        )
    }

    /// The JSON-RPC error code, when this error came from a server response.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            McpError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Result type alias for mcplink operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
