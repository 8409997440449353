//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all MCP transport
//! implementations must satisfy. Concrete implementations live in
//! submodules:
//!
//! - [`stdio::StdioTransport`] -- spawns a child process and communicates
//!   over its stdin/stdout pipes (newline-delimited JSON).
//! - [`sse::SseTransport`] -- HTTP+SSE transport: inbound messages arrive on
//!   a long-lived event stream, outbound messages are POSTed to the endpoint
//!   the server announces.
//! - [`fake::FakeTransport`] -- in-process channel pair for tests.
//!
//! # Design
//!
//! A transport only moves whole [`JsonRpcMessage`] values. `connect` is
//! handed the sender half of the session's inbound queue; the transport
//! pushes every decoded inbound message into it and drops it when the
//! underlying channel ends. Request/response correlation is the session's
//! job.

use std::fmt;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::error::{McpError, Result};
use crate::types::JsonRpcMessage;

pub mod fake;
pub mod sse;
pub mod stdio;

/// Sender half of a session's inbound message queue.
pub type InboundSender = mpsc::UnboundedSender<JsonRpcMessage>;

/// Connection lifecycle of a transport.
///
/// Transitions only move forward:
/// `Disconnected -> Connecting -> Connected -> Closing -> Closed`.
/// A failed `connect` goes straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// `connect` has not been called.
    Disconnected,
    /// `connect` is establishing the channel.
    Connecting,
    /// Messages can be sent.
    Connected,
    /// A graceful close is in progress.
    Closing,
    /// Resources are released; no further sends are accepted.
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Abstraction over MCP transport implementations.
///
/// Implementations are used polymorphically through `Arc<dyn Transport>`.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use mcplink::transport::fake::FakeTransport;
/// use mcplink::transport::{Transport, TransportState};
///
/// let (transport, _handle) = FakeTransport::new();
/// let transport: Arc<dyn Transport> = Arc::new(transport);
/// assert_eq!(transport.state(), TransportState::Disconnected);
/// ```
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Establish the channel and start delivering inbound messages to
    /// `inbound`.
    ///
    /// Resolves once the transport is ready to send: for stdio, when the
    /// child process is running and its reader tasks are spawned; for SSE,
    /// when the server has announced its POST endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Transport`] if the process cannot be spawned or
    /// the connection cannot be established, and
    /// [`McpError::InvalidState`] if the transport was already connected.
    async fn connect(&self, inbound: InboundSender) -> Result<()>;

    /// Transmit one JSON-RPC message.
    ///
    /// Concurrent calls never interleave on the wire. Completion means the
    /// message was handed to the medium, not that a response arrived.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportClosed`] after close, and
    /// [`McpError::Transport`] if the underlying write or POST fails.
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;

    /// Stop accepting sends, let queued output flush, then release the
    /// underlying resources. Calling it again is a no-op.
    async fn close_gracefully(&self) -> Result<()>;

    /// Tear the channel down without waiting: pending output is dropped and
    /// a child process is killed outright. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;

    /// Fast, transport-specific liveness check that does not touch the
    /// protocol.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Transport`] describing why the transport is not
    /// usable.
    async fn check_health(&self) -> Result<()>;

    /// Current connection state.
    fn state(&self) -> TransportState;
}

/// Decode an inbound payload fragment into the caller's expected type.
///
/// # Errors
///
/// Returns [`McpError::Serialization`] if `value` does not match `T`.
///
/// # Examples
///
/// ```
/// use mcplink::transport::unmarshal;
/// use mcplink::types::ListToolsResponse;
///
/// let page: ListToolsResponse = unmarshal(serde_json::json!({"tools": []})).unwrap();
/// assert!(page.tools.is_empty());
/// ```
pub fn unmarshal<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| McpError::Serialization(e).into())
}

/// Error returned by `send` once a transport is closing or closed.
pub(crate) fn closed_error() -> anyhow::Error {
    McpError::TransportClosed.into()
}
