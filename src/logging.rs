//! Structured logging setup
//!
//! Provides JSON-formatted and human-readable logging with optional file
//! output. Log records go to stderr so command output on stdout stays
//! clean; this matters for stdio MCP servers too, where stdout is the
//! protocol channel.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{McpError, Result};

/// Build the filter: `RUST_LOG` wins, otherwise `level`.
///
/// # Errors
///
/// Returns [`McpError::Config`] if `level` is not a valid filter directive.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            McpError::Config(format!("Invalid log level `{}`: {}", level, e)).into()
        }),
    }
}

/// Level used before the configured subscriber is installed.
const BOOTSTRAP_LEVEL: &str = "warn";

fn bootstrap_subscriber<W>(writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = build_filter(BOOTSTRAP_LEVEL).unwrap_or_else(|_| EnvFilter::new(BOOTSTRAP_LEVEL));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .finish()
}

/// Run `f` with a temporary stderr subscriber at `warn`, so events emitted
/// while the configuration itself is loaded are not lost.
///
/// # Examples
///
/// ```no_run
/// use mcplink::cli::Cli;
/// use mcplink::config::Config;
/// use mcplink::logging::with_bootstrap_logging;
///
/// let config = with_bootstrap_logging(|| Config::load("config/mcplink.yaml", &Cli::default()));
/// ```
pub fn with_bootstrap_logging<T>(f: impl FnOnce() -> T) -> T {
    tracing::subscriber::with_default(bootstrap_subscriber(std::io::stderr), f)
}

/// Install the global tracing subscriber described by `config`.
///
/// # Errors
///
/// Returns an error if the filter is invalid, the log file cannot be
/// opened, or a global subscriber is already installed.
///
/// # Examples
///
/// ```no_run
/// use mcplink::config::LoggingConfig;
/// use mcplink::logging::init_logging;
///
/// let config = LoggingConfig {
///     level: "info".to_string(),
///     json_format: true,
///     file_path: None,
/// };
///
/// init_logging(&config).unwrap();
/// ```
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_filter(&config.level)?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            OpenOptions::new().create(true).append(true).open(path)?,
        )),
        None => None,
    };

    let installed = if config.json_format {
        let stderr_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr);
        let file_layer = file.map(|f| {
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(f)
        });
        registry.with(stderr_layer).with(file_layer).try_init()
    } else {
        let stderr_layer = fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_writer(std::io::stderr);
        let file_layer = file.map(|f| {
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(f)
        });
        registry.with(stderr_layer).with(file_layer).try_init()
    };

    installed.map_err(|e| McpError::Config(format!("Failed to install logger: {}", e)).into())
}
