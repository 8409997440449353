//! Configuration management for mcplink
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//!
//! ```yaml
//! client:
//!   request_timeout_seconds: 30
//!   roots:
//!     - uri: file:///home/me/project
//!       name: project
//! logging:
//!   level: info
//!   json_format: false
//! servers:
//!   files:
//!     transport: stdio
//!     command: mcp-server-filesystem
//!     args: ["/home/me/project"]
//!   search:
//!     transport: sse
//!     url: http://localhost:8080/sse
//!     headers:
//!       Authorization: Bearer token
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::client::McpClientConfig;
use crate::error::{McpError, Result};
use crate::transport::sse::{SseTransport, SseTransportConfig};
use crate::transport::stdio::{StdioServerParameters, StdioTransport};
use crate::transport::Transport;
use crate::types::{Implementation, Root};

/// Main configuration structure for mcplink
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client identity, timeouts and roots
    #[serde(default)]
    pub client: ClientConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named MCP servers
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

/// Client identity and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Name sent as `clientInfo.name`
    #[serde(default = "default_client_name")]
    pub name: String,
    /// Version sent as `clientInfo.version`
    #[serde(default = "default_client_version")]
    pub version: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// How long operations wait for an in-flight handshake, in seconds
    #[serde(default = "default_initialization_timeout")]
    pub initialization_timeout_seconds: u64,
    /// How long a graceful close waits for pending requests, in seconds
    #[serde(default = "default_close_timeout")]
    pub close_timeout_seconds: u64,
    /// Roots exposed to servers through `roots/list`
    #[serde(default)]
    pub roots: Vec<Root>,
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_initialization_timeout() -> u64 {
    30
}

fn default_close_timeout() -> u64 {
    5
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            version: default_client_version(),
            request_timeout_seconds: default_request_timeout(),
            initialization_timeout_seconds: default_initialization_timeout(),
            close_timeout_seconds: default_close_timeout(),
            roots: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Runtime client settings derived from this section.
    pub fn to_client_config(&self) -> McpClientConfig {
        McpClientConfig {
            client_info: Implementation {
                name: self.name.clone(),
                version: self.version.clone(),
            },
            request_timeout: Duration::from_secs(self.request_timeout_seconds),
            initialization_timeout: Duration::from_secs(self.initialization_timeout_seconds),
            close_timeout: Duration::from_secs(self.close_timeout_seconds),
            roots: self.roots.clone(),
            ..McpClientConfig::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON records instead of human-readable lines
    #[serde(default)]
    pub json_format: bool,
    /// Also append records to this file
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            file_path: None,
        }
    }
}

/// How to reach one MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerConfig {
    /// Spawn a child process and talk over its stdin/stdout
    Stdio {
        /// Executable to run
        command: String,
        /// Arguments for the executable
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory for the child
        #[serde(default)]
        working_dir: Option<PathBuf>,
        /// Keep the parent's environment
        #[serde(default = "default_inherit_env")]
        inherit_env: bool,
    },
    /// Connect to an HTTP+SSE endpoint
    Sse {
        /// URL of the SSE stream
        url: String,
        /// Headers sent with every HTTP request
        #[serde(default)]
        headers: HashMap<String, String>,
        /// How long to wait for the `endpoint` event, in seconds
        #[serde(default = "default_endpoint_timeout")]
        endpoint_timeout_seconds: u64,
    },
}

fn default_inherit_env() -> bool {
    true
}

fn default_endpoint_timeout() -> u64 {
    30
}

impl ServerConfig {
    /// Short transport name (`stdio` or `sse`)
    pub fn transport_name(&self) -> &'static str {
        match self {
            ServerConfig::Stdio { .. } => "stdio",
            ServerConfig::Sse { .. } => "sse",
        }
    }

    /// Command line or URL, for display
    pub fn target(&self) -> String {
        match self {
            ServerConfig::Stdio { command, args, .. } => {
                if args.is_empty() {
                    command.clone()
                } else {
                    format!("{} {}", command, args.join(" "))
                }
            }
            ServerConfig::Sse { url, .. } => url.clone(),
        }
    }

    /// Create the transport described by this entry. The transport is not
    /// connected yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the SSE URL does not parse or the HTTP client
    /// cannot be built.
    pub fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        match self {
            ServerConfig::Stdio {
                command,
                args,
                env,
                working_dir,
                inherit_env,
            } => {
                let params = StdioServerParameters {
                    command: PathBuf::from(command),
                    args: args.clone(),
                    env: env.clone(),
                    working_dir: working_dir.clone(),
                    inherit_env: *inherit_env,
                };
                Ok(Arc::new(StdioTransport::new(params)))
            }
            ServerConfig::Sse {
                url,
                headers,
                endpoint_timeout_seconds,
            } => {
                let mut config = SseTransportConfig::new(Url::parse(url).map_err(McpError::from)?);
                config.headers = headers.clone();
                config.endpoint_timeout = Duration::from_secs(*endpoint_timeout_seconds);
                Ok(Arc::new(SseTransport::new(config)?))
            }
        }
    }

    fn validate(&self, name: &str) -> Result<()> {
        match self {
            ServerConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::Config(format!(
                        "servers.{name}.command cannot be empty"
                    ))
                    .into());
                }
            }
            ServerConfig::Sse {
                url,
                endpoint_timeout_seconds,
                ..
            } => {
                let parsed = Url::parse(url).map_err(|e| {
                    McpError::Config(format!("servers.{name}.url is invalid: {e}"))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(McpError::Config(format!(
                        "servers.{name}.url must use http or https, got {}",
                        parsed.scheme()
                    ))
                    .into());
                }
                if *endpoint_timeout_seconds == 0 {
                    return Err(McpError::Config(format!(
                        "servers.{name}.endpoint_timeout_seconds must be greater than 0"
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| McpError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| McpError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(timeout) = std::env::var("MCPLINK_REQUEST_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.client.request_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCPLINK_REQUEST_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(timeout) = std::env::var("MCPLINK_INITIALIZATION_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.client.initialization_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid MCPLINK_INITIALIZATION_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(level) = std::env::var("MCPLINK_LOG_LEVEL") {
            tracing::debug!(level = %level, "Env override: MCPLINK_LOG_LEVEL");
            self.logging.level = level;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if let Some(timeout) = cli.request_timeout {
            self.client.request_timeout_seconds = timeout;
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        } else if cli.verbose {
            self.logging.level = "debug".to_string();
        }
    }

    /// Look up a configured server by name.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Config`] naming the known servers if `name` is
    /// not configured.
    pub fn server(&self, name: &str) -> Result<&ServerConfig> {
        self.servers.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.servers.keys().map(String::as_str).collect();
            McpError::Config(format!(
                "Unknown server: {}. Configured servers: {}",
                name,
                if known.is_empty() {
                    "(none)".to_string()
                } else {
                    known.join(", ")
                }
            ))
            .into()
        })
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.client.name.trim().is_empty() {
            return Err(McpError::Config("client.name cannot be empty".to_string()).into());
        }

        for (field, value) in [
            ("request_timeout_seconds", self.client.request_timeout_seconds),
            (
                "initialization_timeout_seconds",
                self.client.initialization_timeout_seconds,
            ),
            ("close_timeout_seconds", self.client.close_timeout_seconds),
        ] {
            if value == 0 {
                return Err(
                    McpError::Config(format!("client.{field} must be greater than 0")).into(),
                );
            }
        }

        for (name, server) in &self.servers {
            server.validate(name)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.client.name, "mcplink");
        assert_eq!(config.client.request_timeout_seconds, 30);
        assert_eq!(config.logging.level, "warn");
        assert!(config.servers.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_servers() {
        let yaml = r#"
servers:
  files:
    transport: stdio
    command: mcp-files
    args: ["--root", "/tmp"]
  remote:
    transport: sse
    url: http://localhost:9000/sse
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers.len(), 2);
        match &config.servers["files"] {
            ServerConfig::Stdio {
                command,
                args,
                inherit_env,
                ..
            } => {
                assert_eq!(command, "mcp-files");
                assert_eq!(args, &vec!["--root".to_string(), "/tmp".to_string()]);
                assert!(*inherit_env);
            }
            other => panic!("expected stdio, got {:?}", other),
        }
        assert_eq!(config.servers["remote"].transport_name(), "sse");
        assert_eq!(config.client.close_timeout_seconds, 5);
    }

    #[test]
    fn test_validation_zero_timeout() {
        let mut config = Config::default();
        config.client.request_timeout_seconds = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_seconds"));
    }

    #[test]
    fn test_validation_empty_command() {
        let mut config = Config::default();
        config.servers.insert(
            "bad".to_string(),
            ServerConfig::Stdio {
                command: "  ".to_string(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
                inherit_env: true,
            },
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_sse_scheme() {
        let mut config = Config::default();
        config.servers.insert(
            "ftp".to_string(),
            ServerConfig::Sse {
                url: "ftp://example.com/sse".to_string(),
                headers: HashMap::new(),
                endpoint_timeout_seconds: 10,
            },
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("http or https"));
    }

    #[test]
    fn test_unknown_server_lists_known() {
        let mut config = Config::default();
        config.servers.insert(
            "files".to_string(),
            ServerConfig::Stdio {
                command: "x".to_string(),
                args: vec![],
                env: HashMap::new(),
                working_dir: None,
                inherit_env: true,
            },
        );
        let err = config.server("nope").unwrap_err();
        assert!(err.to_string().contains("Configured servers: files"));
    }

    #[test]
    fn test_to_client_config_carries_timeouts_and_roots() {
        let mut section = ClientConfig::default();
        section.request_timeout_seconds = 3;
        section.roots.push(Root {
            uri: "file:///work".to_string(),
            name: Some("work".to_string()),
        });
        let runtime = section.to_client_config();
        assert_eq!(runtime.request_timeout, Duration::from_secs(3));
        assert_eq!(runtime.roots.len(), 1);
        assert_eq!(runtime.client_info.name, "mcplink");
        assert!(runtime.capabilities.roots.is_some());
    }

    #[test]
    fn test_cli_overrides() {
        let mut config = Config::default();
        let cli = crate::cli::Cli {
            verbose: true,
            request_timeout: Some(9),
            ..Default::default()
        };
        config.apply_cli_overrides(&cli);
        assert_eq!(config.client.request_timeout_seconds, 9);
        assert_eq!(config.logging.level, "debug");
    }
}
