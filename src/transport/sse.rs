//! HTTP+SSE transport for remote MCP servers
//!
//! The client opens one long-lived `GET` with `Accept: text/event-stream`.
//! The server first emits an `endpoint` event whose data is the URL (absolute
//! or relative to the SSE URL) that every client-to-server message must be
//! POSTed to, then zero or more `message` events, each carrying one JSON-RPC
//! message.
//!
//! [`Transport::connect`] resolves only after the endpoint is known. A
//! [`Transport::send`] issued earlier waits for discovery, bounded by
//! [`SseTransportConfig::endpoint_timeout`], and fails with
//! [`McpError::Protocol`] if the bound elapses.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{McpError, Result};
use crate::transport::{closed_error, InboundSender, Transport, TransportState};
use crate::types::JsonRpcMessage;

/// Default bound on waiting for the `endpoint` event.
pub const DEFAULT_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for [`SseTransport`].
#[derive(Debug, Clone)]
pub struct SseTransportConfig {
    /// URL of the server's SSE stream.
    pub url: Url,
    /// Extra headers sent with the stream request and every POST
    /// (e.g. `Authorization`).
    pub headers: HashMap<String, String>,
    /// How long to wait for the `endpoint` event.
    pub endpoint_timeout: Duration,
    /// Timeout applied to each POST. The event stream itself is unbounded.
    pub request_timeout: Option<Duration>,
}

impl SseTransportConfig {
    /// Settings for `url` with no extra headers and default timeouts.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            endpoint_timeout: DEFAULT_ENDPOINT_TIMEOUT,
            request_timeout: None,
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// Value of the `id:` field, if any.
    pub id: Option<String>,
}

/// Incremental decoder turning byte chunks into [`SseEvent`]s.
///
/// Events are separated by a blank line. `\r\n` and a lone `\r` are both
/// line terminators and are normalized to `\n` as bytes arrive, including a
/// `\r\n` pair split across chunks. Bytes are buffered until an event is
/// complete, so multi-byte characters split across chunks survive. Scanning
/// resumes where the previous chunk stopped.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    scanned: usize,
    after_cr: bool,
}

impl SseDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.reserve(chunk.len());
        for &byte in chunk {
            if std::mem::take(&mut self.after_cr) && byte == b'\n' {
                continue;
            }
            if byte == b'\r' {
                self.after_cr = true;
                self.buffer.push(b'\n');
            } else {
                self.buffer.push(byte);
            }
        }

        let mut events = Vec::new();
        let mut start = 0;
        let mut pos = self.scanned.max(1);
        while pos < self.buffer.len() {
            if self.buffer[pos] == b'\n' && self.buffer[pos - 1] == b'\n' {
                let block = String::from_utf8_lossy(&self.buffer[start..pos - 1]);
                if let Some(event) = parse_event_block(&block) {
                    events.push(event);
                }
                start = pos + 1;
                pos = start + 1;
            } else {
                pos += 1;
            }
        }
        self.buffer.drain(..start);
        self.scanned = pos - start;
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let block = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.after_cr = false;
        parse_event_block(&String::from_utf8_lossy(&block))
    }
}

fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data_lines: Vec<&str> = Vec::new();
    let mut has_field = false;

    for line in block.lines() {
        // Comment lines start with ':'.
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "data" => {
                data_lines.push(value);
                has_field = true;
            }
            "event" => {
                event.event = Some(value.to_string());
                has_field = true;
            }
            "id" => {
                event.id = Some(value.to_string());
                has_field = true;
            }
            // retry: reconnection timing is not used.
            _ => {}
        }
    }

    if !has_field {
        return None;
    }
    event.data = data_lines.join("\n");
    Some(event)
}

/// HTTP+SSE MCP transport.
///
/// # Examples
///
/// ```no_run
/// use mcplink::transport::sse::{SseTransport, SseTransportConfig};
///
/// # fn main() -> anyhow::Result<()> {
/// let url = url::Url::parse("http://localhost:8080/sse")?;
/// let transport = SseTransport::new(SseTransportConfig::new(url))?;
/// # Ok(())
/// # }
/// ```
pub struct SseTransport {
    config: SseTransportConfig,
    http_client: reqwest::Client,
    state: watch::Sender<TransportState>,
    endpoint: watch::Sender<Option<Url>>,
    cancel: CancellationToken,
    stream_done: CancellationToken,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SseTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseTransport")
            .field("url", &self.config.url.as_str())
            .field("endpoint", &*self.endpoint.borrow())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SseTransport {
    /// Create a transport. No network I/O happens until
    /// [`Transport::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Http`] if the HTTP client cannot be built.
    pub fn new(config: SseTransportConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .build()
            .map_err(McpError::Http)?;
        let (state, _) = watch::channel(TransportState::Disconnected);
        let (endpoint, _) = watch::channel(None);
        Ok(Self {
            config,
            http_client,
            state,
            endpoint,
            cancel: CancellationToken::new(),
            stream_done: CancellationToken::new(),
            reader: StdMutex::new(None),
        })
    }

    /// The discovered POST endpoint, once the `endpoint` event arrived.
    pub fn endpoint(&self) -> Option<Url> {
        self.endpoint.borrow().clone()
    }

    fn with_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }

    /// Wait for the endpoint, bounded by the endpoint timeout.
    async fn endpoint_url(&self) -> Result<Url> {
        let mut rx = self.endpoint.subscribe();
        let discovered = async move {
            rx.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|url| (*url).clone())
        };

        tokio::select! {
            biased;
            url = discovered => url.ok_or_else(closed_error),
            _ = self.stream_done.cancelled() => Err(McpError::Transport(
                "SSE stream ended before the `endpoint` event".into(),
            )
            .into()),
            _ = tokio::time::sleep(self.config.endpoint_timeout) => Err(McpError::Protocol(format!(
                "no `endpoint` event from {} within {}ms",
                self.config.url,
                self.config.endpoint_timeout.as_millis()
            ))
            .into()),
        }
    }
}

/// Route one decoded event. Returns `false` once the inbound queue is gone.
fn dispatch_event(
    event: SseEvent,
    base: &Url,
    endpoint: &watch::Sender<Option<Url>>,
    inbound: &InboundSender,
) -> bool {
    match event.event.as_deref() {
        Some("endpoint") => {
            if endpoint.borrow().is_some() {
                tracing::warn!(data = %event.data, "ignoring repeated SSE endpoint event");
                return true;
            }
            match base.join(event.data.trim()) {
                Ok(url) => {
                    tracing::info!(endpoint = %url, "discovered MCP message endpoint");
                    endpoint.send_replace(Some(url));
                }
                Err(e) => {
                    tracing::warn!(error = %e, data = %event.data, "invalid SSE endpoint URL");
                }
            }
            true
        }
        Some("message") | None => {
            if event.data.trim().is_empty() {
                return true;
            }
            match JsonRpcMessage::parse(&event.data) {
                Ok(message) => inbound.send(message).is_ok(),
                Err(e) => {
                    tracing::warn!(error = %e, data = %event.data, "skipping malformed SSE message");
                    true
                }
            }
        }
        Some(other) => {
            tracing::debug!(event = other, "ignoring SSE event");
            true
        }
    }
}

/// Drive the event stream until it ends, errors, or `cancel` fires.
pub async fn read_event_stream<S>(
    byte_stream: S,
    base: Url,
    endpoint: watch::Sender<Option<Url>>,
    inbound: InboundSender,
    cancel: CancellationToken,
) where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    let mut decoder = SseDecoder::new();
    tokio::pin!(byte_stream);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            chunk = byte_stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    for event in decoder.push(&bytes) {
                        if !dispatch_event(event, &base, &endpoint, &inbound) {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "SSE stream failed");
                    return;
                }
                None => break,
            }
        }
    }

    if let Some(event) = decoder.finish() {
        dispatch_event(event, &base, &endpoint, &inbound);
    }
    tracing::debug!("SSE stream ended");
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Transport`] if the request fails, the server
    /// answers with a non-2xx status, or the stream ends before the
    /// endpoint arrives; [`McpError::Protocol`] if the endpoint timeout
    /// elapses.
    async fn connect(&self, inbound: InboundSender) -> Result<()> {
        let started = self.state.send_if_modified(|s| {
            if *s == TransportState::Disconnected {
                *s = TransportState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(McpError::InvalidState(format!(
                "SSE transport is already {}",
                self.state()
            ))
            .into());
        }

        let req = self
            .http_client
            .get(self.config.url.clone())
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        let response = match self.with_headers(req).send().await {
            Ok(response) => response,
            Err(e) => {
                self.state.send_replace(TransportState::Closed);
                return Err(McpError::Transport(format!(
                    "SSE connection to {} failed: {}",
                    self.config.url, e
                ))
                .into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.state.send_replace(TransportState::Closed);
            return Err(McpError::Transport(format!(
                "SSE endpoint {} returned HTTP {}",
                self.config.url, status
            ))
            .into());
        }

        let base = self.config.url.clone();
        let endpoint = self.endpoint.clone();
        let cancel = self.cancel.clone();
        let done = self.stream_done.clone();
        let reader = tokio::spawn(async move {
            let _done = done.drop_guard();
            read_event_stream(response.bytes_stream(), base, endpoint, inbound, cancel).await;
        });
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }

        match self.endpoint_url().await {
            Ok(url) => {
                tracing::info!(url = %self.config.url, endpoint = %url, "SSE transport connected");
                self.state.send_replace(TransportState::Connected);
                Ok(())
            }
            Err(e) => {
                self.cancel.cancel();
                self.state.send_replace(TransportState::Closed);
                Err(e)
            }
        }
    }

    /// POST one message to the discovered endpoint, waiting for discovery
    /// first if needed.
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if matches!(
            self.state(),
            TransportState::Closing | TransportState::Closed
        ) {
            return Err(closed_error());
        }
        let url = self.endpoint_url().await?;
        let body = serde_json::to_string(&message).map_err(McpError::Serialization)?;

        let mut req = self
            .http_client
            .post(url.clone())
            .header("Content-Type", "application/json")
            .body(body);
        if let Some(timeout) = self.config.request_timeout {
            req = req.timeout(timeout);
        }

        let response = self.with_headers(req).send().await.map_err(|e| {
            McpError::Transport(format!("POST to {url} failed: {e}"))
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!("POST to {url} returned HTTP {status}")).into());
        }
        tracing::trace!(endpoint = %url, "sse ->");
        Ok(())
    }

    /// Cancel the event stream and join the reader task.
    async fn close_gracefully(&self) -> Result<()> {
        let mut proceed = false;
        self.state.send_if_modified(|s| match s {
            TransportState::Closing | TransportState::Closed => false,
            _ => {
                *s = TransportState::Closing;
                proceed = true;
                true
            }
        });
        if !proceed {
            return Ok(());
        }

        self.cancel.cancel();
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                tracing::warn!(error = %e, "SSE reader task failed");
            }
        }

        self.state.send_replace(TransportState::Closed);
        tracing::info!(url = %self.config.url, "SSE transport closed");
        Ok(())
    }

    /// Cancel the event stream without joining the reader task.
    async fn close(&self) -> Result<()> {
        let previous = self.state.send_replace(TransportState::Closed);
        if previous == TransportState::Closed {
            return Ok(());
        }
        self.cancel.cancel();
        if let Some(reader) = self.reader.lock().ok().and_then(|mut slot| slot.take()) {
            reader.abort();
        }
        tracing::info!(url = %self.config.url, "SSE transport closed");
        Ok(())
    }

    /// Healthy while connected and the event stream is still open.
    async fn check_health(&self) -> Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(McpError::Transport(format!("SSE transport is {state}")).into());
        }
        if self.stream_done.is_cancelled() {
            return Err(McpError::Transport("SSE event stream has ended".into()).into());
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
