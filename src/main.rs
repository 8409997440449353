//! mcplink - Model Context Protocol client CLI
//!
//! Main entry point for the mcplink command-line tool.

use anyhow::Result;
use clap::CommandFactory;

use mcplink::cli::Cli;
use mcplink::commands;
use mcplink::config::Config;
use mcplink::logging::{init_logging, with_bootstrap_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let config_path = cli.config.as_deref().unwrap_or("config/mcplink.yaml");
    let config = with_bootstrap_logging(|| Config::load(config_path, &cli))?;
    config.validate()?;

    init_logging(&config.logging)?;
    tracing::debug!(config = config_path, "configuration loaded");

    let Some(command) = cli.command.clone() else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    commands::run(config, command, cli.json).await
}
