//! Command-line interface definition for mcplink
//!
//! This module defines the CLI structure using clap's derive API. Every
//! command connects to one configured MCP server, performs the handshake,
//! runs a single operation and closes the session.

use clap::{Parser, Subcommand};

/// mcplink - Model Context Protocol client
///
/// Connect to MCP servers over stdio or HTTP+SSE and inspect or invoke
/// their tools, resources and prompts.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mcplink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/mcplink.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Override the per-request timeout (seconds)
    #[arg(long)]
    pub request_timeout: Option<u64>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for mcplink
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// List configured servers
    Servers,

    /// Show server identity and negotiated capabilities
    Info {
        /// Configured server name
        server: String,
    },

    /// List the tools a server offers
    Tools {
        /// Configured server name
        server: String,
    },

    /// Invoke a tool
    Call {
        /// Configured server name
        server: String,

        /// Tool name
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
    },

    /// List the resources a server offers
    Resources {
        /// Configured server name
        server: String,
    },

    /// Read one resource
    Read {
        /// Configured server name
        server: String,

        /// Resource URI
        uri: String,
    },

    /// List resource templates
    Templates {
        /// Configured server name
        server: String,
    },

    /// List the prompts a server offers
    Prompts {
        /// Configured server name
        server: String,
    },

    /// Render a prompt
    Prompt {
        /// Configured server name
        server: String,

        /// Prompt name
        name: String,

        /// Template argument as key=value (repeatable)
        #[arg(short, long = "arg", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },

    /// Check that a server answers `ping`
    Ping {
        /// Configured server name
        server: String,
    },
}

/// Parse a `key=value` pair.
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got `{s}`")),
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
