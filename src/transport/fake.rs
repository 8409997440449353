//! In-process fake transport for unit and integration tests
//!
//! [`FakeTransport::new`] returns a `(FakeTransport, FakeTransportHandle)`
//! pair. Hand the [`FakeTransport`] to the code under test and drive the
//! "server" side from the handle:
//!
//! - Read what the client sent: `handle.outbound_rx.recv().await`
//! - Inject server traffic: `handle.inject(json!({...}))` or
//!   `handle.inbound_tx.send(message)`
//! - Simulate the server going away: drop the handle.
//!
//! ```text
//! client send() ---------> outbound_tx ---> outbound_rx (handle reads)
//! handle inbound_tx -----> forwarder ------> session inbound queue
//! ```
//!
//! # Example
//!
//! ```
//! use mcplink::transport::fake::FakeTransport;
//! use mcplink::transport::Transport;
//! use mcplink::types::{JsonRpcMessage, JsonRpcNotification};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let (transport, mut handle) = FakeTransport::new();
//! let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::unbounded_channel();
//! transport.connect(inbound_tx).await.unwrap();
//!
//! transport.send(JsonRpcNotification::new("notifications/initialized", None).into()).await.unwrap();
//! let sent = handle.outbound_rx.recv().await.unwrap();
//! assert_eq!(sent.method(), Some("notifications/initialized"));
//!
//! handle.inject(serde_json::json!({"jsonrpc": "2.0", "id": "x-1", "result": {}}));
//! assert!(matches!(inbound_rx.recv().await, Some(JsonRpcMessage::Response(_))));
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{McpError, Result};
use crate::transport::{closed_error, InboundSender, Transport, TransportState};
use crate::types::{JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};

/// In-process fake transport.
#[derive(Debug)]
pub struct FakeTransport {
    outbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    inbound_rx: StdMutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    state: watch::Sender<TransportState>,
    cancel: CancellationToken,
    fail_sends: Arc<AtomicBool>,
    unhealthy: Arc<AtomicBool>,
}

/// The test-side handle for a [`FakeTransport`].
#[derive(Debug)]
pub struct FakeTransportHandle {
    /// Every message the client sent, in order.
    pub outbound_rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
    /// Messages pushed here are delivered to the client as inbound traffic.
    pub inbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    fail_sends: Arc<AtomicBool>,
    unhealthy: Arc<AtomicBool>,
}

impl FakeTransport {
    /// Create a new `(FakeTransport, FakeTransportHandle)` pair.
    pub fn new() -> (Self, FakeTransportHandle) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TransportState::Disconnected);
        let fail_sends = Arc::new(AtomicBool::new(false));
        let unhealthy = Arc::new(AtomicBool::new(false));

        let transport = Self {
            outbound_tx,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            state,
            cancel: CancellationToken::new(),
            fail_sends: Arc::clone(&fail_sends),
            unhealthy: Arc::clone(&unhealthy),
        };
        let handle = FakeTransportHandle {
            outbound_rx,
            inbound_tx,
            fail_sends,
            unhealthy,
        };
        (transport, handle)
    }
}

impl FakeTransportHandle {
    /// Decode `value` as a JSON-RPC message and deliver it to the client.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a JSON-RPC message or the transport is gone.
    pub fn inject(&self, value: serde_json::Value) {
        let message = JsonRpcMessage::from_value(value).expect("FakeTransport: not a JSON-RPC message");
        self.inbound_tx
            .send(message)
            .expect("FakeTransport: inbound channel closed");
    }

    /// Make subsequent `send` calls fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make `check_health` report failure.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Answer every outbound request with `responder` on a background task.
    ///
    /// Every message the client sends is recorded on the returned
    /// [`ScriptedServer`].
    pub fn serve<F>(self, responder: F) -> ScriptedServer
    where
        F: Fn(&JsonRpcRequest) -> Reply + Send + Sync + 'static,
    {
        let FakeTransportHandle {
            mut outbound_rx,
            inbound_tx,
            fail_sends,
            unhealthy,
        } = self;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let reply_tx = inbound_tx.clone();

        let task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Ok(mut seen) = seen_clone.lock() {
                    seen.push(message.clone());
                }
                let JsonRpcMessage::Request(request) = message else {
                    continue;
                };
                let id = request.id.clone();
                let response = match responder(&request) {
                    Reply::Result(result) => JsonRpcResponse::success(id, result),
                    Reply::Error(error) => JsonRpcResponse::failure(Some(id), error),
                    Reply::Delayed(delay, result) => {
                        let tx = reply_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(JsonRpcResponse::success(id, result).into());
                        });
                        continue;
                    }
                    Reply::Silent => continue,
                };
                if reply_tx.send(response.into()).is_err() {
                    break;
                }
            }
        });

        ScriptedServer {
            seen,
            inbound_tx,
            fail_sends,
            unhealthy,
            task,
        }
    }
}

/// How a [`ScriptedServer`] answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Respond immediately with `result`.
    Result(serde_json::Value),
    /// Respond immediately with an error object.
    Error(JsonRpcError),
    /// Respond with `result` after a delay.
    Delayed(Duration, serde_json::Value),
    /// Never respond.
    Silent,
}

/// A canned `initialize` result advertising `capabilities`.
pub fn initialize_result(protocol_version: &str, capabilities: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": protocol_version,
        "capabilities": capabilities,
        "serverInfo": {"name": "scripted-server", "version": "1.0.0"}
    })
}

/// Server side of a [`FakeTransport`] driven by a responder closure.
#[derive(Debug)]
pub struct ScriptedServer {
    seen: Arc<StdMutex<Vec<JsonRpcMessage>>>,
    inbound_tx: mpsc::UnboundedSender<JsonRpcMessage>,
    fail_sends: Arc<AtomicBool>,
    unhealthy: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ScriptedServer {
    /// Every message the client sent so far, in order.
    pub fn received(&self) -> Vec<JsonRpcMessage> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }

    /// Requests and notifications the client sent for `method`.
    pub fn received_method(&self, method: &str) -> Vec<JsonRpcMessage> {
        self.received()
            .into_iter()
            .filter(|m| m.method() == Some(method))
            .collect()
    }

    /// Poll until the client has sent `count` messages for `method`.
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_for_method(&self, method: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.received_method(method).len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Push a server-initiated message to the client.
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a JSON-RPC message.
    pub fn inject(&self, value: serde_json::Value) {
        let message = JsonRpcMessage::from_value(value).expect("ScriptedServer: not a JSON-RPC message");
        let _ = self.inbound_tx.send(message);
    }

    /// Make subsequent client sends fail with a transport error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Make the transport's health check fail.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Stop answering and end the client's inbound stream.
    pub fn disconnect(self) {
        self.task.abort();
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, inbound: InboundSender) -> Result<()> {
        let rx = self.inbound_rx.lock().ok().and_then(|mut slot| slot.take());
        let mut rx = rx.ok_or_else(|| {
            anyhow::Error::from(McpError::InvalidState("fake transport already connected".into()))
        })?;
        self.state.send_replace(TransportState::Connected);

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if inbound.send(msg).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.state() != TransportState::Connected {
            return Err(closed_error());
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(McpError::Transport("injected send failure".into()).into());
        }
        self.outbound_tx
            .send(message)
            .map_err(|_| McpError::Transport("FakeTransport outbound channel closed".into()).into())
    }

    async fn close_gracefully(&self) -> Result<()> {
        self.close().await
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.state.send_replace(TransportState::Closed);
        Ok(())
    }

    async fn check_health(&self) -> Result<()> {
        if self.state() != TransportState::Connected || self.unhealthy.load(Ordering::SeqCst) {
            return Err(McpError::Transport("fake transport unhealthy".into()).into());
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }
}
