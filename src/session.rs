//! Transport-agnostic JSON-RPC 2.0 session
//!
//! [`McpSession`] sits on top of a [`Transport`] and owns everything about
//! JSON-RPC that is not MCP-specific:
//!
//! - Request IDs are `"{prefix}-{n}"`: a random per-session prefix plus a
//!   monotonic counter, so no two requests from one session ever share an ID.
//! - In-flight requests live in a pending table keyed by ID. An entry is
//!   inserted before the request is sent and removed exactly once: by the
//!   matching response, a send failure, a timeout, or session teardown.
//!   A response whose ID has no entry is logged and dropped.
//! - Inbound requests and notifications are routed to handlers registered
//!   on the [`McpSessionBuilder`]. The registries are frozen once the session
//!   is connected. Handlers run on their own tasks so a slow handler never
//!   stalls the read loop.
//! - When the session closes, or the transport's inbound stream ends, every
//!   pending request fails with [`McpError::TransportClosed`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::transport::{unmarshal, Transport};
use crate::types::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId, INTERNAL_ERROR, METHOD_NOT_FOUND,
};

/// Default timeout applied to every request when the caller does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time `close_gracefully` waits for in-flight requests.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Convenience alias for a boxed, `Send`-safe async future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handler for a peer-initiated request: receives `params` (or `null`) and
/// produces the `result` value. An error becomes an `INTERNAL_ERROR` response.
pub type RequestHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Handler for a peer notification. Errors are logged and swallowed.
pub type NotificationHandler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

type ResponseSink = oneshot::Sender<std::result::Result<serde_json::Value, JsonRpcError>>;
type PendingMap = HashMap<String, ResponseSink>;

/// State shared between the session handle and its read loop.
struct SessionCore {
    transport: Arc<dyn Transport>,
    pending: Mutex<PendingMap>,
    request_handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
    drained: Notify,
}

impl SessionCore {
    async fn take_pending(&self, id: &str) -> Option<ResponseSink> {
        let mut pending = self.pending.lock().await;
        let sink = pending.remove(id);
        if pending.is_empty() {
            self.drained.notify_waiters();
        }
        sink
    }

    /// Drop every pending sink; awaiting callers observe `TransportClosed`.
    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "failing pending requests");
        }
        pending.clear();
        self.drained.notify_waiters();
    }

    async fn dispatch(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.handle_response(response).await,
            JsonRpcMessage::Request(request) => {
                let core = Arc::clone(self);
                tokio::spawn(async move { core.handle_request(request).await });
            }
            JsonRpcMessage::Notification(notification) => self.handle_notification(notification),
        }
    }

    async fn handle_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id else {
            tracing::warn!(error = ?response.error, "received error response without id");
            return;
        };
        let key = id.to_string();

        let Some(sink) = self.take_pending(&key).await else {
            tracing::debug!("received response for unknown id {key}; ignoring");
            return;
        };

        let outcome = match response.error {
            Some(error) => Err(error),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        };
        // The caller may have given up already.
        let _ = sink.send(outcome);
    }

    async fn handle_request(&self, request: JsonRpcRequest) {
        let params = request.params.unwrap_or(serde_json::Value::Null);
        let response = match self.request_handlers.get(&request.method) {
            Some(handler) => match handler(params).await {
                Ok(result) => JsonRpcResponse::success(request.id, result),
                Err(e) => {
                    tracing::warn!(method = %request.method, error = %e, "request handler failed");
                    JsonRpcResponse::failure(
                        Some(request.id),
                        JsonRpcError::new(INTERNAL_ERROR, e.to_string()),
                    )
                }
            },
            None => {
                tracing::debug!(method = %request.method, "no handler for inbound request");
                JsonRpcResponse::failure(
                    Some(request.id),
                    JsonRpcError::new(
                        METHOD_NOT_FOUND,
                        format!("Method not found: {}", request.method),
                    ),
                )
            }
        };

        if let Err(e) = self.transport.send(response.into()).await {
            tracing::warn!(method = %request.method, error = %e, "failed to send response");
        }
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        let Some(handler) = self.notification_handlers.get(&notification.method) else {
            tracing::debug!(method = %notification.method, "no handler for notification; ignoring");
            return;
        };
        let future = handler(notification.params.unwrap_or(serde_json::Value::Null));
        let method = notification.method;
        tokio::spawn(async move {
            if let Err(e) = future.await {
                tracing::warn!(%method, error = %e, "notification handler failed");
            }
        });
    }
}

async fn run_read_loop(
    core: Arc<SessionCore>,
    mut inbound_rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            message = inbound_rx.recv() => match message {
                Some(message) => core.dispatch(message).await,
                None => {
                    tracing::info!("transport inbound stream ended");
                    break;
                }
            }
        }
    }
    cancel.cancel();
    core.fail_pending().await;
}

/// Collects handlers and timeouts, then connects an [`McpSession`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use mcplink::session::McpSession;
/// use mcplink::transport::fake::FakeTransport;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let (transport, _handle) = FakeTransport::new();
/// let session = McpSession::builder(Arc::new(transport))
///     .on_request("ping", |_params| async { Ok::<_, anyhow::Error>(serde_json::json!({})) })
///     .connect()
///     .await?;
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct McpSessionBuilder {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
    close_timeout: Duration,
    request_handlers: HashMap<String, RequestHandler>,
    notification_handlers: HashMap<String, NotificationHandler>,
}

impl McpSessionBuilder {
    /// Default timeout for [`McpSession::send_request`].
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How long [`McpSession::close_gracefully`] waits for in-flight requests.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Register a handler for inbound requests named `method`.
    pub fn on_request<F, Fut>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let handler: RequestHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.request_handler(method, handler)
    }

    /// Register a handler for inbound notifications named `method`.
    pub fn on_notification<F, Fut>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: NotificationHandler = Arc::new(move |params| Box::pin(handler(params)));
        self.notification_handler(method, handler)
    }

    /// Register an already boxed request handler. A later registration for
    /// the same method replaces the earlier one.
    pub fn request_handler(mut self, method: impl Into<String>, handler: RequestHandler) -> Self {
        self.request_handlers.insert(method.into(), handler);
        self
    }

    /// Register an already boxed notification handler.
    pub fn notification_handler(
        mut self,
        method: impl Into<String>,
        handler: NotificationHandler,
    ) -> Self {
        self.notification_handlers.insert(method.into(), handler);
        self
    }

    /// Connect the transport and start the read loop.
    ///
    /// # Errors
    ///
    /// Propagates the transport's `connect` failure.
    pub async fn connect(self) -> Result<McpSession> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.transport.connect(inbound_tx).await?;

        let core = Arc::new(SessionCore {
            transport: self.transport,
            pending: Mutex::new(HashMap::new()),
            request_handlers: self.request_handlers,
            notification_handlers: self.notification_handlers,
            drained: Notify::new(),
        });
        let cancel = CancellationToken::new();
        let read_loop = tokio::spawn(run_read_loop(
            Arc::clone(&core),
            inbound_rx,
            cancel.clone(),
        ));

        let session = McpSession {
            id_prefix: new_id_prefix(),
            next_id: AtomicU64::new(1),
            core,
            request_timeout: self.request_timeout,
            close_timeout: self.close_timeout,
            cancel,
            read_loop: StdMutex::new(Some(read_loop)),
        };
        tracing::debug!(prefix = %session.id_prefix, "MCP session started");
        Ok(session)
    }
}

fn new_id_prefix() -> String {
    let mut prefix = uuid::Uuid::new_v4().simple().to_string();
    prefix.truncate(8);
    prefix
}

/// A connected JSON-RPC session.
pub struct McpSession {
    id_prefix: String,
    next_id: AtomicU64,
    core: Arc<SessionCore>,
    request_timeout: Duration,
    close_timeout: Duration,
    cancel: CancellationToken,
    read_loop: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("id_prefix", &self.id_prefix)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("transport", &self.core.transport)
            .finish_non_exhaustive()
    }
}

impl McpSession {
    /// Start building a session over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> McpSessionBuilder {
        McpSessionBuilder {
            transport,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            request_handlers: HashMap::new(),
            notification_handlers: HashMap::new(),
        }
    }

    fn next_request_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.id_prefix, n)
    }

    /// Send a request and wait for its response.
    ///
    /// `params` that serialize to `null` are omitted. `timeout` falls back
    /// to the session's request timeout.
    ///
    /// # Errors
    ///
    /// - [`McpError::Rpc`] if the peer answered with an error object.
    /// - [`McpError::Timeout`] if no response arrived in time; the pending
    ///   entry is removed, so a late response is dropped as unknown.
    /// - [`McpError::TransportClosed`] if the session closed first.
    /// - [`McpError::Serialization`] if `result` does not decode as `R`.
    /// - Whatever the transport's `send` returned.
    pub async fn send_request<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if self.cancel.is_cancelled() {
            return Err(McpError::TransportClosed.into());
        }

        let params = serde_json::to_value(params).map_err(McpError::Serialization)?;
        let params = (!params.is_null()).then_some(params);
        let id = self.next_request_id();

        let (tx, rx) = oneshot::channel();
        self.core.pending.lock().await.insert(id.clone(), tx);
        if self.cancel.is_cancelled() {
            self.core.take_pending(&id).await;
            return Err(McpError::TransportClosed.into());
        }

        tracing::debug!(%id, method, "sending request");
        let request = JsonRpcRequest::new(RequestId::String(id.clone()), method, params);
        if let Err(e) = self.core.transport.send(request.into()).await {
            self.core.take_pending(&id).await;
            return Err(e);
        }

        let deadline = timeout.unwrap_or(self.request_timeout);
        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.core.take_pending(&id).await;
                return Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                }
                .into());
            }
        };

        let value = outcome
            .map_err(|_| McpError::TransportClosed)?
            .map_err(McpError::from)?;
        unmarshal(value)
    }

    /// Send a notification. Completion means the transport accepted it.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportClosed`] after close, or the transport's
    /// send error.
    pub async fn send_notification<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(McpError::TransportClosed.into());
        }
        let params = serde_json::to_value(params).map_err(McpError::Serialization)?;
        let params = (!params.is_null()).then_some(params);
        tracing::debug!(method, "sending notification");
        self.core
            .transport
            .send(JsonRpcNotification::new(method, params).into())
            .await
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.core.transport
    }

    /// Number of requests awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.core.pending.lock().await.len()
    }

    /// `true` once the session was closed or its inbound stream ended.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait up to the close timeout for in-flight requests, then fail the
    /// rest, stop the read loop, and close the transport gracefully.
    pub async fn close_gracefully(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let drained = async move {
            loop {
                let notified = core.drained.notified();
                if core.pending.lock().await.is_empty() {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(self.close_timeout, drained).await.is_err() {
            let pending = self.pending_count().await;
            tracing::warn!(
                pending,
                "closing session with requests still in flight"
            );
        }
        self.shutdown().await;
        self.core.transport.close_gracefully().await
    }

    /// Stop the read loop, fail pending requests, and close the transport
    /// without waiting for in-flight work.
    pub async fn close(&self) -> Result<()> {
        self.shutdown().await;
        self.core.transport.close().await
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let read_loop = self.read_loop.lock().ok().and_then(|mut slot| slot.take());
        if let Some(read_loop) = read_loop {
            if let Err(e) = read_loop.await {
                tracing::warn!(error = %e, "session read loop failed");
            }
        }
        self.core.fail_pending().await;
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
