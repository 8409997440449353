//! MCP client lifecycle and typed operations
//!
//! [`McpClient`] wraps an [`McpSession`] and exposes the MCP surface. It
//! enforces the lifecycle
//!
//! ```text
//! Uninitialized --initialize()--> Initializing --version ok--> Initialized
//!                                      |
//!                                      +--version rejected / error--> Failed
//! any state --close()--> Closed
//! ```
//!
//! Every operation other than [`McpClient::initialize`] first passes the
//! initialization gate: if a handshake is in flight it waits for it (bounded
//! by `initialization_timeout`), otherwise it fails with
//! [`McpError::NotInitialized`] unless the client is initialized. Operations
//! that need a server capability check it locally and fail with
//! [`McpError::CapabilityNotSupported`] without touching the network.
//!
//! The client pre-wires handlers for the three `list_changed` notifications
//! (re-fetch the list and fan it out to consumers), `notifications/message`
//! (forward to one log handler), and the `roots/list` and `ping` requests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{McpError, Result};
use crate::session::{McpSession, DEFAULT_CLOSE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::transport::{unmarshal, Transport};
use crate::types::{
    CallToolParams, CallToolResponse, ClientCapabilities, GetPromptParams, GetPromptResponse,
    Implementation, InitializeParams, InitializeResponse, ListPromptsResponse,
    ListResourceTemplatesResponse, ListResourcesResponse, ListRootsResult, ListToolsResponse,
    LoggingLevel, LoggingMessageParams, McpTool, PaginatedParams, Prompt, ReadResourceParams,
    ReadResourceResponse, Resource, ResourceTemplate, Root, RootsCapability, ServerCapabilities,
    LATEST_PROTOCOL_VERSION, METHOD_INITIALIZE, METHOD_INITIALIZED, METHOD_PING,
    METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_RESOURCES_TEMPLATES_LIST, METHOD_ROOTS_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
    NOTIF_MESSAGE, NOTIF_PROMPTS_LIST_CHANGED, NOTIF_RESOURCES_LIST_CHANGED,
    NOTIF_TOOLS_LIST_CHANGED, SUPPORTED_PROTOCOL_VERSIONS,
};

/// Default bound on waiting for an in-flight handshake.
pub const DEFAULT_INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Capability flags and lifecycle state
// ---------------------------------------------------------------------------

/// Identifies a top-level capability a server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCapabilityFlag {
    /// `tools/list` and `tools/call`.
    Tools,
    /// `resources/list`, `resources/read`, `resources/templates/list`.
    Resources,
    /// `prompts/list` and `prompts/get`.
    Prompts,
    /// `notifications/message` log records.
    Logging,
    /// Experimental extensions.
    Experimental,
}

impl ServerCapabilityFlag {
    /// The capability's key in the `capabilities` object.
    pub fn as_str(self) -> &'static str {
        match self {
            ServerCapabilityFlag::Tools => "tools",
            ServerCapabilityFlag::Resources => "resources",
            ServerCapabilityFlag::Prompts => "prompts",
            ServerCapabilityFlag::Logging => "logging",
            ServerCapabilityFlag::Experimental => "experimental",
        }
    }

    fn advertised_in(self, caps: &ServerCapabilities) -> bool {
        match self {
            ServerCapabilityFlag::Tools => caps.tools.is_some(),
            ServerCapabilityFlag::Resources => caps.resources.is_some(),
            ServerCapabilityFlag::Prompts => caps.prompts.is_some(),
            ServerCapabilityFlag::Logging => caps.logging.is_some(),
            ServerCapabilityFlag::Experimental => caps.experimental.is_some(),
        }
    }
}

/// Lifecycle state of an [`McpClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// `initialize` has not been called.
    Uninitialized,
    /// The handshake is in flight.
    Initializing,
    /// The handshake completed; operations are allowed.
    Initialized,
    /// The last handshake failed; `initialize` may be retried.
    Failed,
    /// The client was closed.
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::Initializing => "initializing",
            ClientState::Initialized => "initialized",
            ClientState::Failed => "failed",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Configuration and handlers
// ---------------------------------------------------------------------------

/// Identity, capabilities and timeouts of an [`McpClient`].
#[derive(Debug, Clone)]
pub struct McpClientConfig {
    /// Sent as `clientInfo` in `initialize`.
    pub client_info: Implementation,
    /// Sent as `capabilities` in `initialize`.
    pub capabilities: ClientCapabilities,
    /// Default timeout for each request.
    pub request_timeout: Duration,
    /// How long the initialization gate waits for an in-flight handshake.
    pub initialization_timeout: Duration,
    /// How long a graceful close waits for in-flight requests.
    pub close_timeout: Duration,
    /// Roots returned to the server's `roots/list` requests.
    pub roots: Vec<Root>,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: ClientCapabilities {
                roots: Some(RootsCapability {
                    list_changed: Some(false),
                }),
                ..Default::default()
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initialization_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            roots: Vec::new(),
        }
    }
}

/// Consumer of a freshly fetched list after a `list_changed` notification.
pub type ListConsumer<T> = Arc<dyn Fn(Vec<T>) -> Result<()> + Send + Sync>;

/// Receiver of decoded `notifications/message` payloads.
pub type LogMessageHandler = Arc<dyn Fn(LoggingMessageParams) -> Result<()> + Send + Sync>;

/// Callbacks for server notifications.
///
/// Consumer failures are logged and never stop the remaining consumers.
///
/// # Examples
///
/// ```
/// use mcplink::client::ClientHandlers;
///
/// let handlers = ClientHandlers::default()
///     .on_tools_changed(|tools| {
///         println!("server now has {} tools", tools.len());
///         Ok(())
///     });
/// ```
#[derive(Clone)]
pub struct ClientHandlers {
    tools_changed: Vec<ListConsumer<McpTool>>,
    resources_changed: Vec<ListConsumer<Resource>>,
    prompts_changed: Vec<ListConsumer<Prompt>>,
    log_message: LogMessageHandler,
}

impl Default for ClientHandlers {
    fn default() -> Self {
        Self {
            tools_changed: Vec::new(),
            resources_changed: Vec::new(),
            prompts_changed: Vec::new(),
            log_message: Arc::new(log_to_tracing),
        }
    }
}

impl fmt::Debug for ClientHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandlers")
            .field("tools_changed", &self.tools_changed.len())
            .field("resources_changed", &self.resources_changed.len())
            .field("prompts_changed", &self.prompts_changed.len())
            .finish_non_exhaustive()
    }
}

impl ClientHandlers {
    /// Add a consumer for the tool list.
    pub fn on_tools_changed<F>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<McpTool>) -> Result<()> + Send + Sync + 'static,
    {
        self.tools_changed.push(Arc::new(consumer));
        self
    }

    /// Add a consumer for the resource list.
    pub fn on_resources_changed<F>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Resource>) -> Result<()> + Send + Sync + 'static,
    {
        self.resources_changed.push(Arc::new(consumer));
        self
    }

    /// Add a consumer for the prompt list.
    pub fn on_prompts_changed<F>(mut self, consumer: F) -> Self
    where
        F: Fn(Vec<Prompt>) -> Result<()> + Send + Sync + 'static,
    {
        self.prompts_changed.push(Arc::new(consumer));
        self
    }

    /// Replace the log-message handler. The default re-emits each record as
    /// a `tracing` event.
    pub fn on_log_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(LoggingMessageParams) -> Result<()> + Send + Sync + 'static,
    {
        self.log_message = Arc::new(handler);
        self
    }
}

fn log_to_tracing(record: LoggingMessageParams) -> Result<()> {
    let logger = record.logger.as_deref().unwrap_or("server");
    let data = &record.data;
    match record.level {
        LoggingLevel::Debug => tracing::debug!(target: "mcplink::server", logger, %data),
        LoggingLevel::Info | LoggingLevel::Notice => {
            tracing::info!(target: "mcplink::server", logger, %data)
        }
        LoggingLevel::Warning => tracing::warn!(target: "mcplink::server", logger, %data),
        LoggingLevel::Error
        | LoggingLevel::Critical
        | LoggingLevel::Alert
        | LoggingLevel::Emergency => tracing::error!(target: "mcplink::server", logger, %data),
    }
    Ok(())
}

fn fan_out<T: Clone>(kind: &str, consumers: &[ListConsumer<T>], items: Vec<T>) {
    for consumer in consumers {
        if let Err(e) = consumer(items.clone()) {
            tracing::warn!(kind, error = %e, "list-changed consumer failed");
        }
    }
}

type ClientSlot = Arc<OnceLock<Weak<ClientInner>>>;

fn upgrade(slot: &ClientSlot) -> Option<McpClient> {
    slot.get()
        .and_then(Weak::upgrade)
        .map(|inner| McpClient { inner })
}

async fn refresh_tools(slot: ClientSlot, consumers: Vec<ListConsumer<McpTool>>) -> Result<()> {
    if consumers.is_empty() {
        return Ok(());
    }
    let Some(client) = upgrade(&slot) else {
        return Ok(());
    };
    let tools = client.list_all_tools().await?;
    tracing::debug!(count = tools.len(), "tool list changed");
    fan_out("tools", &consumers, tools);
    Ok(())
}

async fn refresh_resources(slot: ClientSlot, consumers: Vec<ListConsumer<Resource>>) -> Result<()> {
    if consumers.is_empty() {
        return Ok(());
    }
    let Some(client) = upgrade(&slot) else {
        return Ok(());
    };
    let resources = client.list_all_resources().await?;
    tracing::debug!(count = resources.len(), "resource list changed");
    fan_out("resources", &consumers, resources);
    Ok(())
}

async fn refresh_prompts(slot: ClientSlot, consumers: Vec<ListConsumer<Prompt>>) -> Result<()> {
    if consumers.is_empty() {
        return Ok(());
    }
    let Some(client) = upgrade(&slot) else {
        return Ok(());
    };
    let prompts = client.list_all_prompts().await?;
    tracing::debug!(count = prompts.len(), "prompt list changed");
    fan_out("prompts", &consumers, prompts);
    Ok(())
}

async fn deliver_log(handler: LogMessageHandler, params: serde_json::Value) -> Result<()> {
    let record: LoggingMessageParams = unmarshal(params)?;
    handler(record)
}

async fn answer_roots(roots: Vec<Root>) -> Result<serde_json::Value> {
    serde_json::to_value(ListRootsResult { roots }).map_err(|e| McpError::Serialization(e).into())
}

/// Upper bound on pages fetched by one `list_all_*` call.
pub const MAX_PAGES: usize = 1000;

/// Follow `nextCursor` until the server stops returning one. A cursor seen
/// before, or more than [`MAX_PAGES`] pages, is a protocol error.
async fn collect_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<(Vec<T>, Option<String>)>>,
{
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut cursor: Option<String> = None;
    for _ in 0..MAX_PAGES {
        let (page, next) = fetch(cursor.take()).await?;
        items.extend(page);
        match next {
            Some(c) if !c.is_empty() => {
                if !seen.insert(c.clone()) {
                    return Err(McpError::Protocol(format!("server repeated pagination cursor `{c}`")).into());
                }
                cursor = Some(c);
            }
            _ => return Ok(items),
        }
    }
    Err(McpError::Protocol(format!("server returned more than {MAX_PAGES} pages")).into())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

struct ClientInner {
    session: McpSession,
    config: McpClientConfig,
    state: watch::Sender<ClientState>,
    negotiated: OnceLock<InitializeResponse>,
}

/// A stateful MCP client over one transport.
///
/// Cheap to clone; clones share the session.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use mcplink::client::{ClientHandlers, McpClient, McpClientConfig};
/// use mcplink::transport::stdio::{StdioServerParameters, StdioTransport};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = StdioTransport::new(StdioServerParameters::new("my-mcp-server"));
/// let client = McpClient::connect(
///     Arc::new(transport),
///     McpClientConfig::default(),
///     ClientHandlers::default(),
/// )
/// .await?;
/// client.initialize().await?;
/// for tool in client.list_all_tools().await? {
///     println!("{}", tool.name);
/// }
/// client.close_gracefully().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for McpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpClient")
            .field("state", &self.state())
            .field("session", &self.inner.session)
            .finish()
    }
}

impl McpClient {
    /// Connect `transport` and wire the built-in handlers. The client starts
    /// [`ClientState::Uninitialized`].
    ///
    /// # Errors
    ///
    /// Propagates the transport's `connect` failure.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: McpClientConfig,
        handlers: ClientHandlers,
    ) -> Result<Self> {
        let slot: ClientSlot = Arc::new(OnceLock::new());
        let roots = config.roots.clone();

        let tools_slot = Arc::clone(&slot);
        let tools_consumers = handlers.tools_changed;
        let resources_slot = Arc::clone(&slot);
        let resources_consumers = handlers.resources_changed;
        let prompts_slot = Arc::clone(&slot);
        let prompts_consumers = handlers.prompts_changed;
        let log_handler = handlers.log_message;

        let session = McpSession::builder(transport)
            .request_timeout(config.request_timeout)
            .close_timeout(config.close_timeout)
            .on_request(METHOD_ROOTS_LIST, move |_| answer_roots(roots.clone()))
            .on_request(METHOD_PING, |_| async { Ok::<_, anyhow::Error>(serde_json::json!({})) })
            .on_notification(NOTIF_TOOLS_LIST_CHANGED, move |_| {
                refresh_tools(Arc::clone(&tools_slot), tools_consumers.clone())
            })
            .on_notification(NOTIF_RESOURCES_LIST_CHANGED, move |_| {
                refresh_resources(Arc::clone(&resources_slot), resources_consumers.clone())
            })
            .on_notification(NOTIF_PROMPTS_LIST_CHANGED, move |_| {
                refresh_prompts(Arc::clone(&prompts_slot), prompts_consumers.clone())
            })
            .on_notification(NOTIF_MESSAGE, move |params| {
                deliver_log(Arc::clone(&log_handler), params)
            })
            .connect()
            .await?;

        let (state, _) = watch::channel(ClientState::Uninitialized);
        let inner = Arc::new(ClientInner {
            session,
            config,
            state,
            negotiated: OnceLock::new(),
        });
        let _ = slot.set(Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    /// Perform the `initialize` handshake.
    ///
    /// Offers [`LATEST_PROTOCOL_VERSION`] and accepts any version in
    /// [`SUPPORTED_PROTOCOL_VERSIONS`]. On success the negotiated
    /// capabilities and server info are stored, `notifications/initialized`
    /// is sent, and the client becomes [`ClientState::Initialized`].
    ///
    /// # Errors
    ///
    /// - [`McpError::InvalidState`] if a handshake is in flight or already
    ///   completed.
    /// - [`McpError::TransportClosed`] if the client is closed.
    /// - [`McpError::ProtocolVersion`] if the server chose an unsupported
    ///   version; the client moves to [`ClientState::Failed`] and may retry.
    /// - Any error from the request itself, which also leaves the client
    ///   [`ClientState::Failed`].
    pub async fn initialize(&self) -> Result<InitializeResponse> {
        let mut refused = None;
        self.inner.state.send_if_modified(|s| match s {
            ClientState::Uninitialized | ClientState::Failed => {
                *s = ClientState::Initializing;
                true
            }
            other => {
                refused = Some(*other);
                false
            }
        });
        if let Some(state) = refused {
            return Err(match state {
                ClientState::Closed => McpError::TransportClosed,
                _ => McpError::InvalidState(format!("initialize called while client is {state}")),
            }
            .into());
        }

        tracing::info!(protocol_version = LATEST_PROTOCOL_VERSION, "initializing MCP client");
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: self.inner.config.capabilities.clone(),
            client_info: self.inner.config.client_info.clone(),
        };

        let response: InitializeResponse = match self
            .inner
            .session
            .send_request(METHOD_INITIALIZE, params, None)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.leave_initializing(ClientState::Failed);
                return Err(e);
            }
        };

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&response.protocol_version.as_str()) {
            tracing::warn!(got = %response.protocol_version, "server chose unsupported protocol version");
            self.leave_initializing(ClientState::Failed);
            return Err(McpError::ProtocolVersion {
                supported: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                got: response.protocol_version,
            }
            .into());
        }

        let _ = self.inner.negotiated.set(response.clone());

        if let Err(e) = self
            .inner
            .session
            .send_notification(METHOD_INITIALIZED, ())
            .await
        {
            tracing::warn!(error = %e, "failed to send initialized notification");
        }

        self.leave_initializing(ClientState::Initialized);
        tracing::info!(
            server = %response.server_info.name,
            version = %response.server_info.version,
            protocol_version = %response.protocol_version,
            "MCP client initialized"
        );
        Ok(response)
    }

    /// Move out of `Initializing` unless a close got there first.
    fn leave_initializing(&self, next: ClientState) {
        self.inner.state.send_if_modified(|s| {
            if *s == ClientState::Initializing {
                *s = next;
                true
            } else {
                false
            }
        });
    }

    /// Wait out an in-flight handshake, then require `Initialized`.
    async fn ensure_initialized(&self, action: &str) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = match tokio::time::timeout(
            self.inner.config.initialization_timeout,
            rx.wait_for(|s| *s != ClientState::Initializing),
        )
        .await
        {
            Ok(Ok(state)) => *state,
            _ => ClientState::Initializing,
        };
        match state {
            ClientState::Initialized => Ok(()),
            ClientState::Closed => Err(McpError::TransportClosed.into()),
            _ => Err(McpError::NotInitialized(action.to_string()).into()),
        }
    }

    fn require_capability(&self, flag: ServerCapabilityFlag, action: &str) -> Result<()> {
        if self.capable(flag) {
            Ok(())
        } else {
            Err(McpError::CapabilityNotSupported {
                capability: flag.as_str().to_string(),
                action: action.to_string(),
            }
            .into())
        }
    }

    async fn gate(&self, action: &str, capability: Option<ServerCapabilityFlag>) -> Result<()> {
        self.ensure_initialized(action).await?;
        if let Some(flag) = capability {
            self.require_capability(flag, action)?;
        }
        Ok(())
    }

    /// Fetch one page of tools.
    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResponse> {
        self.gate("listing tools", Some(ServerCapabilityFlag::Tools))
            .await?;
        self.inner
            .session
            .send_request(METHOD_TOOLS_LIST, PaginatedParams { cursor }, None)
            .await
    }

    /// Fetch every tool, following pagination.
    pub async fn list_all_tools(&self) -> Result<Vec<McpTool>> {
        collect_pages(|cursor| async move {
            let page = self.list_tools(cursor).await?;
            Ok((page.tools, page.next_cursor))
        })
        .await
    }

    /// Invoke a tool. The raw result is returned; an `isError` result is not
    /// turned into an `Err` here.
    pub async fn execute_tool(&self, params: CallToolParams) -> Result<CallToolResponse> {
        self.gate("calling tools", Some(ServerCapabilityFlag::Tools))
            .await?;
        self.inner
            .session
            .send_request(METHOD_TOOLS_CALL, params, None)
            .await
    }

    /// Fetch one page of resources.
    pub async fn list_resources(&self, cursor: Option<String>) -> Result<ListResourcesResponse> {
        self.gate("listing resources", Some(ServerCapabilityFlag::Resources))
            .await?;
        self.inner
            .session
            .send_request(METHOD_RESOURCES_LIST, PaginatedParams { cursor }, None)
            .await
    }

    /// Fetch every resource, following pagination.
    pub async fn list_all_resources(&self) -> Result<Vec<Resource>> {
        collect_pages(|cursor| async move {
            let page = self.list_resources(cursor).await?;
            Ok((page.resources, page.next_cursor))
        })
        .await
    }

    /// Read the contents of the resource at `uri`.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResponse> {
        self.gate("reading resources", Some(ServerCapabilityFlag::Resources))
            .await?;
        self.inner
            .session
            .send_request(
                METHOD_RESOURCES_READ,
                ReadResourceParams {
                    uri: uri.to_string(),
                },
                None,
            )
            .await
    }

    /// Fetch one page of resource templates.
    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResponse> {
        self.gate(
            "listing resource templates",
            Some(ServerCapabilityFlag::Resources),
        )
        .await?;
        self.inner
            .session
            .send_request(METHOD_RESOURCES_TEMPLATES_LIST, PaginatedParams { cursor }, None)
            .await
    }

    /// Fetch every resource template, following pagination.
    pub async fn list_all_resource_templates(&self) -> Result<Vec<ResourceTemplate>> {
        collect_pages(|cursor| async move {
            let page = self.list_resource_templates(cursor).await?;
            Ok((page.resource_templates, page.next_cursor))
        })
        .await
    }

    /// Fetch one page of prompts. No capability is required.
    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResponse> {
        self.gate("listing prompts", None).await?;
        self.inner
            .session
            .send_request(METHOD_PROMPTS_LIST, PaginatedParams { cursor }, None)
            .await
    }

    /// Fetch every prompt, following pagination.
    pub async fn list_all_prompts(&self) -> Result<Vec<Prompt>> {
        collect_pages(|cursor| async move {
            let page = self.list_prompts(cursor).await?;
            Ok((page.prompts, page.next_cursor))
        })
        .await
    }

    /// Render the prompt `name` with optional template arguments.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResponse> {
        self.gate("getting prompts", None).await?;
        self.inner
            .session
            .send_request(
                METHOD_PROMPTS_GET,
                GetPromptParams {
                    name: name.to_string(),
                    arguments,
                },
                None,
            )
            .await
    }

    /// Send a protocol-level `ping` and wait for the reply.
    pub async fn ping(&self) -> Result<()> {
        self.gate("pinging", None).await?;
        self.inner
            .session
            .send_request::<_, serde_json::Value>(METHOD_PING, (), None)
            .await?;
        Ok(())
    }

    /// Check the transport's liveness, then pass the initialization gate and
    /// `ping` the server.
    pub async fn check_health(&self) -> Result<()> {
        self.inner.session.transport().check_health().await?;
        self.ping().await
    }

    /// Whether the negotiated server advertised `flag`. `false` before
    /// initialization.
    pub fn capable(&self, flag: ServerCapabilityFlag) -> bool {
        self.inner
            .negotiated
            .get()
            .map(|r| flag.advertised_in(&r.capabilities))
            .unwrap_or(false)
    }

    /// The full `initialize` response, once negotiated.
    pub fn initialize_response(&self) -> Option<&InitializeResponse> {
        self.inner.negotiated.get()
    }

    /// Negotiated server identity.
    pub fn server_info(&self) -> Option<&Implementation> {
        self.initialize_response().map(|r| &r.server_info)
    }

    /// Negotiated server capabilities.
    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.initialize_response().map(|r| &r.capabilities)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// The underlying session.
    pub fn session(&self) -> &McpSession {
        &self.inner.session
    }

    /// Let in-flight requests finish (bounded), then close the session.
    pub async fn close_gracefully(&self) -> Result<()> {
        self.inner.state.send_replace(ClientState::Closed);
        self.inner.session.close_gracefully().await
    }

    /// Close the session immediately; pending requests fail.
    pub async fn close(&self) -> Result<()> {
        self.inner.state.send_replace(ClientState::Closed);
        self.inner.session.close().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
