//! Command handlers for the CLI
//!
//! Each handler connects to one configured server, performs the
//! handshake, runs a single MCP operation and closes the session
//! gracefully. Output is either a `prettytable` table or pretty JSON.

use std::collections::HashMap;

use colored::Colorize;
use prettytable::{row, Table};
use serde::Serialize;

use crate::cli::Commands;
use crate::client::{ClientHandlers, McpClient, ServerCapabilityFlag};
use crate::config::Config;
use crate::error::{McpError, Result};
use crate::tool_provider::McpToolProvider;
use crate::types::{
    CallToolResponse, MessageContent, ResourceContents, Role, ToolResponseContent,
};

/// Dispatch a parsed command.
pub async fn run(config: Config, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Servers => list_servers(&config, json),
        Commands::Info { server } => with_client(&config, &server, |c| show_info(c, json)).await,
        Commands::Tools { server } => with_client(&config, &server, |c| list_tools(c, json)).await,
        Commands::Call { server, tool, args } => {
            let arguments = parse_arguments(args.as_deref())?;
            with_client(&config, &server, |c| call_tool(c, &server, &tool, arguments, json)).await
        }
        Commands::Resources { server } => {
            with_client(&config, &server, |c| list_resources(c, json)).await
        }
        Commands::Read { server, uri } => {
            with_client(&config, &server, |c| read_resource(c, &uri, json)).await
        }
        Commands::Templates { server } => {
            with_client(&config, &server, |c| list_templates(c, json)).await
        }
        Commands::Prompts { server } => {
            with_client(&config, &server, |c| list_prompts(c, json)).await
        }
        Commands::Prompt { server, name, args } => {
            let arguments: HashMap<String, String> = args.into_iter().collect();
            with_client(&config, &server, |c| get_prompt(c, &name, arguments, json)).await
        }
        Commands::Ping { server } => with_client(&config, &server, |c| ping(c, &server)).await,
    }
}

/// Connect to `name` and complete the handshake.
///
/// # Errors
///
/// Returns an error if the server is not configured, the transport fails
/// to connect, or initialization fails. The session is closed on failure.
pub async fn connect_server(config: &Config, name: &str) -> Result<McpClient> {
    let server = config.server(name)?;
    tracing::info!(server = name, transport = server.transport_name(), "connecting");
    let transport = server.build_transport()?;
    let client = McpClient::connect(
        transport,
        config.client.to_client_config(),
        ClientHandlers::default(),
    )
    .await?;
    if let Err(e) = client.initialize().await {
        let _ = client.close().await;
        return Err(e);
    }
    Ok(client)
}

async fn with_client<F, Fut>(config: &Config, name: &str, op: F) -> Result<()>
where
    F: FnOnce(McpClient) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let client = connect_server(config, name).await?;
    let outcome = op(client.clone()).await;
    if let Err(e) = client.close_gracefully().await {
        tracing::warn!(error = %e, "error while closing MCP session");
    }
    outcome
}

fn parse_arguments(raw: Option<&str>) -> Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Null),
        Some(text) => {
            let value: serde_json::Value =
                serde_json::from_str(text).map_err(McpError::Serialization)?;
            if !value.is_object() {
                return Err(McpError::Config("--args must be a JSON object".to_string()).into());
            }
            Ok(value)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).map_err(McpError::Serialization)?;
    println!("{}", text);
    Ok(())
}

fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

fn list_servers(config: &Config, json: bool) -> Result<()> {
    if json {
        return print_json(&config.servers);
    }
    if config.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }
    let mut table = Table::new();
    table.add_row(row!["Name", "Transport", "Target"]);
    for (name, server) in &config.servers {
        table.add_row(row![name, server.transport_name(), server.target()]);
    }
    table.printstd();
    Ok(())
}

async fn show_info(client: McpClient, json: bool) -> Result<()> {
    let response = client
        .initialize_response()
        .ok_or_else(|| McpError::InvalidState("client is not initialized".to_string()))?;
    if json {
        return print_json(response);
    }
    println!(
        "{} {} (protocol {})",
        response.server_info.name.bold(),
        response.server_info.version,
        response.protocol_version
    );
    let mut table = Table::new();
    table.add_row(row!["Capability", "Advertised"]);
    for flag in [
        ServerCapabilityFlag::Tools,
        ServerCapabilityFlag::Resources,
        ServerCapabilityFlag::Prompts,
        ServerCapabilityFlag::Logging,
        ServerCapabilityFlag::Experimental,
    ] {
        let mark = if client.capable(flag) {
            "yes".green()
        } else {
            "no".dimmed()
        };
        table.add_row(row![flag.as_str(), mark]);
    }
    table.printstd();
    if let Some(instructions) = &response.instructions {
        println!("\n{}", instructions);
    }
    Ok(())
}

async fn list_tools(client: McpClient, json: bool) -> Result<()> {
    let tools = client.list_all_tools().await?;
    if json {
        return print_json(&tools);
    }
    let mut table = Table::new();
    table.add_row(row!["Name", "Description"]);
    for tool in &tools {
        table.add_row(row![tool.name, or_dash(tool.description.as_deref())]);
    }
    table.printstd();
    Ok(())
}

async fn call_tool(
    client: McpClient,
    server: &str,
    tool: &str,
    arguments: serde_json::Value,
    json: bool,
) -> Result<()> {
    let mut provider = McpToolProvider::new();
    provider.add_client(server, client);
    let response = provider.call(tool, arguments).await?;
    if json {
        return print_json(&response);
    }
    print_tool_response(&response);
    if response.is_error.unwrap_or(false) {
        return Err(McpError::ToolExecution(response.text()).into());
    }
    Ok(())
}

fn print_tool_response(response: &CallToolResponse) {
    for item in &response.content {
        match item {
            ToolResponseContent::Text { text } => println!("{}", text),
            ToolResponseContent::Image { mime_type, data } => {
                println!("{}", format!("[image {}, {} bytes base64]", mime_type, data.len()).dimmed())
            }
            ToolResponseContent::Resource { resource } => print_resource_contents(resource),
        }
    }
}

fn print_resource_contents(contents: &ResourceContents) {
    match contents {
        ResourceContents::Text(t) => println!("{}", t.text),
        ResourceContents::Blob(b) => println!(
            "{}",
            format!(
                "[blob {} ({}), {} bytes base64]",
                b.uri,
                b.mime_type.as_deref().unwrap_or("application/octet-stream"),
                b.blob.len()
            )
            .dimmed()
        ),
    }
}

async fn list_resources(client: McpClient, json: bool) -> Result<()> {
    let resources = client.list_all_resources().await?;
    if json {
        return print_json(&resources);
    }
    let mut table = Table::new();
    table.add_row(row!["URI", "Name", "MIME Type"]);
    for r in &resources {
        table.add_row(row![r.uri, r.name, or_dash(r.mime_type.as_deref())]);
    }
    table.printstd();
    Ok(())
}

async fn read_resource(client: McpClient, uri: &str, json: bool) -> Result<()> {
    let response = client.read_resource(uri).await?;
    if json {
        return print_json(&response);
    }
    for contents in &response.contents {
        print_resource_contents(contents);
    }
    Ok(())
}

async fn list_templates(client: McpClient, json: bool) -> Result<()> {
    let templates = client.list_all_resource_templates().await?;
    if json {
        return print_json(&templates);
    }
    let mut table = Table::new();
    table.add_row(row!["URI Template", "Name", "Description"]);
    for t in &templates {
        table.add_row(row![t.uri_template, t.name, or_dash(t.description.as_deref())]);
    }
    table.printstd();
    Ok(())
}

async fn list_prompts(client: McpClient, json: bool) -> Result<()> {
    let prompts = client.list_all_prompts().await?;
    if json {
        return print_json(&prompts);
    }
    let mut table = Table::new();
    table.add_row(row!["Name", "Arguments", "Description"]);
    for p in &prompts {
        let args = p
            .arguments
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|a| {
                if a.required.unwrap_or(false) {
                    format!("{}*", a.name)
                } else {
                    a.name.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(row![p.name, args, or_dash(p.description.as_deref())]);
    }
    table.printstd();
    Ok(())
}

async fn get_prompt(
    client: McpClient,
    name: &str,
    arguments: HashMap<String, String>,
    json: bool,
) -> Result<()> {
    let arguments = (!arguments.is_empty()).then_some(arguments);
    let response = client.get_prompt(name, arguments).await?;
    if json {
        return print_json(&response);
    }
    if let Some(description) = &response.description {
        println!("{}\n", description.italic());
    }
    for message in &response.messages {
        let role = match message.role {
            Role::User => "user".cyan().bold(),
            Role::Assistant => "assistant".magenta().bold(),
        };
        match &message.content {
            MessageContent::Text { text } => println!("{}: {}", role, text),
            MessageContent::Image { mime_type, .. } => {
                println!("{}: {}", role, format!("[image {}]", mime_type).dimmed())
            }
            MessageContent::Resource { resource } => {
                print!("{}: ", role);
                print_resource_contents(resource);
            }
        }
    }
    Ok(())
}

async fn ping(client: McpClient, server: &str) -> Result<()> {
    let started = std::time::Instant::now();
    client.ping().await?;
    println!(
        "{} {} answered in {} ms",
        "ok".green().bold(),
        server,
        started.elapsed().as_millis()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arguments() {
        assert!(parse_arguments(None).unwrap().is_null());
        let value = parse_arguments(Some(r#"{"a": 1}"#)).unwrap();
        assert_eq!(value["a"], 1);
        assert!(parse_arguments(Some("[1]")).is_err());
        assert!(parse_arguments(Some("{not json")).is_err());
    }

    #[test]
    fn test_or_dash() {
        assert_eq!(or_dash(None), "-");
        assert_eq!(or_dash(Some("x")), "x");
    }

    #[tokio::test]
    async fn test_connect_unknown_server() {
        let err = connect_server(&Config::default(), "missing")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unknown server: missing"));
    }
}
