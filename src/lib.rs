//! mcplink - Model Context Protocol client library
//!
//! This library implements the client side of the Model Context Protocol:
//! a JSON-RPC 2.0 session engine that correlates requests with responses
//! over a pluggable transport, plus a stateful client that negotiates the
//! protocol version and capabilities and exposes typed MCP operations.
//!
//! # Architecture
//!
//! - `types`: JSON-RPC message union, error codes, method names and MCP records
//! - `transport`: the `Transport` trait with stdio, HTTP+SSE and in-process
//!   implementations
//! - `session`: request ID generation, pending-request table, handler
//!   dispatch and the read loop
//! - `client`: lifecycle state machine, capability gating and built-in
//!   notification routing
//! - `tool_provider`: one tool registry over several servers
//! - `config`, `logging`, `cli`, `commands`: the `mcplink` binary
//! - `error`: error taxonomy and result alias
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcplink::{ClientHandlers, McpClient, McpClientConfig};
//! use mcplink::transport::stdio::{StdioServerParameters, StdioTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let params = StdioServerParameters::new("mcp-server-everything");
//!     let client = McpClient::connect(
//!         Arc::new(StdioTransport::new(params)),
//!         McpClientConfig::default(),
//!         ClientHandlers::default(),
//!     )
//!     .await?;
//!     client.initialize().await?;
//!     println!("{:?}", client.server_info());
//!     client.close_gracefully().await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod tool_provider;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use client::{ClientHandlers, ClientState, McpClient, McpClientConfig, ServerCapabilityFlag};
pub use config::Config;
pub use error::{McpError, Result};
pub use session::McpSession;
pub use tool_provider::McpToolProvider;
pub use transport::{Transport, TransportState};
