//! Tool aggregation across several MCP servers
//!
//! [`McpToolProvider`] keeps a set of named, initialized [`McpClient`]s and
//! presents their tools as one flat registry. A tool is exposed under its
//! bare name unless two servers offer the same name, in which case each copy
//! is exposed as `server.tool`.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::client::{McpClient, ServerCapabilityFlag};
use crate::error::{McpError, Result};
use crate::types::{CallToolParams, CallToolResponse, McpTool};

/// A tool offered by one of the provider's servers.
#[derive(Debug, Clone)]
pub struct ProvidedTool {
    /// Name the tool is registered under in the provider.
    pub key: String,
    /// Name of the server that owns the tool.
    pub server: String,
    /// The server's description of the tool.
    pub tool: McpTool,
}

impl ProvidedTool {
    /// Function-calling definition (`name`, `description`, `parameters`).
    pub fn definition(&self) -> Value {
        serde_json::json!({
            "name": self.key,
            "description": self.tool.description.clone().unwrap_or_default(),
            "parameters": self.tool.input_schema,
        })
    }
}

#[derive(Debug, Clone)]
struct Route {
    server: String,
    tool: String,
}

/// Flat tool registry over several named clients.
#[derive(Debug, Default)]
pub struct McpToolProvider {
    clients: Vec<(String, McpClient)>,
    routes: RwLock<HashMap<String, Route>>,
}

impl McpToolProvider {
    /// Create an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initialized client under `name`. Replaces an existing
    /// client of the same name.
    pub fn add_client(&mut self, name: impl Into<String>, client: McpClient) {
        let name = name.into();
        self.clients.retain(|(n, _)| *n != name);
        self.clients.push((name, client));
    }

    /// Names of registered servers, in registration order.
    pub fn server_names(&self) -> Vec<&str> {
        self.clients.iter().map(|(n, _)| n.as_str()).collect()
    }

    fn client(&self, server: &str) -> Option<&McpClient> {
        self.clients
            .iter()
            .find(|(n, _)| n == server)
            .map(|(_, c)| c)
    }

    /// List every tool from every server that advertises the `tools`
    /// capability and refresh the routing table.
    ///
    /// A server whose listing fails is logged and skipped.
    pub async fn list_tools(&self) -> Result<Vec<ProvidedTool>> {
        let mut collected: Vec<(String, McpTool)> = Vec::new();
        for (server, client) in &self.clients {
            if !client.capable(ServerCapabilityFlag::Tools) {
                continue;
            }
            match client.list_all_tools().await {
                Ok(tools) => collected.extend(tools.into_iter().map(|t| (server.clone(), t))),
                Err(e) => tracing::warn!(server = %server, error = %e, "failed to list tools"),
            }
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, tool) in &collected {
            *counts.entry(tool.name.as_str()).or_default() += 1;
        }
        let provided: Vec<ProvidedTool> = collected
            .iter()
            .map(|(server, tool)| {
                let key = if counts.get(tool.name.as_str()).copied().unwrap_or(0) > 1 {
                    format!("{}.{}", server, tool.name)
                } else {
                    tool.name.clone()
                };
                ProvidedTool {
                    key,
                    server: server.clone(),
                    tool: tool.clone(),
                }
            })
            .collect();

        let mut routes = self.routes.write().await;
        routes.clear();
        for p in &provided {
            routes.insert(
                p.key.clone(),
                Route {
                    server: p.server.clone(),
                    tool: p.tool.name.clone(),
                },
            );
        }
        tracing::debug!(count = provided.len(), "refreshed MCP tool routes");
        Ok(provided)
    }

    async fn resolve(&self, key: &str) -> Option<Route> {
        if let Some(route) = self.routes.read().await.get(key) {
            return Some(route.clone());
        }
        let (server, tool) = key.split_once('.')?;
        self.client(server).map(|_| Route {
            server: server.to_string(),
            tool: tool.to_string(),
        })
    }

    /// Call the tool registered as `key` and return its raw response.
    ///
    /// Unknown keys trigger one refresh of the routing table.
    pub async fn call(&self, key: &str, arguments: Value) -> Result<CallToolResponse> {
        let route = match self.resolve(key).await {
            Some(route) => route,
            None => {
                self.list_tools().await?;
                self.resolve(key)
                    .await
                    .ok_or_else(|| McpError::ToolExecution(format!("unknown tool `{key}`")))?
            }
        };
        let client = self.client(&route.server).ok_or_else(|| {
            McpError::ToolExecution(format!("server `{}` is not registered", route.server))
        })?;

        let arguments = match arguments {
            Value::Null => None,
            object @ Value::Object(_) => Some(object),
            other => {
                return Err(McpError::ToolExecution(format!(
                    "arguments for `{key}` must be a JSON object, got {other}"
                ))
                .into())
            }
        };
        let params = CallToolParams {
            name: route.tool.clone(),
            arguments,
        };
        tracing::debug!(server = %route.server, tool = %route.tool, "calling MCP tool");
        client.execute_tool(params).await
    }

    /// Call a tool and return its text content.
    ///
    /// # Errors
    ///
    /// A response flagged `isError` becomes [`McpError::ToolExecution`]
    /// carrying the joined text content.
    pub async fn execute(&self, key: &str, arguments: Value) -> Result<String> {
        let response = self.call(key, arguments).await?;
        let text = response.text();
        if response.is_error.unwrap_or(false) {
            return Err(McpError::ToolExecution(text).into());
        }
        Ok(text)
    }
}
