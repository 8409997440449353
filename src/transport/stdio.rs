//! Stdio transport for MCP child-process servers
//!
//! This module implements [`StdioTransport`], which spawns a child process
//! and communicates with it over its stdin/stdout pipes using
//! newline-delimited JSON framing. This is the standard transport for
//! locally-installed MCP servers.
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin as one compact JSON
//!   object followed by `\n`. Compact serialization escapes any newline
//!   inside string values, so a line is always exactly one message.
//! - Inbound messages are read from the child's stdout, one JSON object per
//!   line. A line that does not decode is logged and skipped.
//! - The child's stderr is forwarded line by line to a diagnostic handler.
//!   Stderr output is never treated as an error condition.
//!
//! # Lifecycle
//!
//! [`Transport::connect`] spawns the process and three background tasks
//! (stdout reader, stdin writer, stderr reader). [`Transport::close_gracefully`]
//! closes the outbound queue, lets the writer flush, sends SIGTERM (Unix) or
//! `start_kill` (non-Unix), waits for the child to exit, then joins the
//! reader tasks. [`Transport::close`] skips the grace period: it aborts the
//! worker tasks and kills the child. When the child closes stdout the
//! transport moves to [`TransportState::Closed`]; a later close still reaps
//! the process. Dropping the transport sends a best-effort SIGTERM.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{McpError, Result};
use crate::transport::{closed_error, InboundSender, Transport, TransportState};
use crate::types::JsonRpcMessage;

/// Default time allowed for each step of the close sequence.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Callback receiving each line the child writes to stderr.
pub type DiagnosticHandler = Arc<dyn Fn(String) + Send + Sync>;

type OutboundItem = (String, oneshot::Sender<std::io::Result<()>>);

/// How to launch a stdio MCP server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StdioServerParameters {
    /// Executable to run.
    pub command: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,
    /// Keep the parent's environment instead of starting from an empty one.
    pub inherit_env: bool,
}

impl StdioServerParameters {
    /// Parameters for `command` with no arguments and an empty environment.
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Set the argument list.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add one environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Inherit the parent's environment.
    pub fn inherit_env(mut self, inherit: bool) -> Self {
        self.inherit_env = inherit;
        self
    }
}

#[derive(Default)]
struct Workers {
    writer: Option<JoinHandle<()>>,
    readers: Vec<JoinHandle<()>>,
}

/// Stdio-based MCP transport that drives a child process.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use mcplink::transport::stdio::{StdioServerParameters, StdioTransport};
/// use mcplink::transport::Transport;
///
/// let params = StdioServerParameters::new("npx")
///     .args(["-y", "@modelcontextprotocol/server-filesystem", "/tmp"])
///     .inherit_env(true);
/// let transport: Arc<dyn Transport> = Arc::new(StdioTransport::new(params));
/// ```
pub struct StdioTransport {
    params: StdioServerParameters,
    diagnostics: DiagnosticHandler,
    close_timeout: Duration,
    state: watch::Sender<TransportState>,
    outbound_tx: StdMutex<Option<mpsc::UnboundedSender<OutboundItem>>>,
    child: Mutex<Option<Child>>,
    workers: StdMutex<Workers>,
    released: AtomicBool,
}

impl fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.params.command)
            .field("args", &self.params.args)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl StdioTransport {
    /// Create a transport for `params`. Nothing is spawned until
    /// [`Transport::connect`].
    pub fn new(params: StdioServerParameters) -> Self {
        let (state, _) = watch::channel(TransportState::Disconnected);
        Self {
            params,
            diagnostics: Arc::new(|line: String| {
                tracing::debug!(
                    target: "mcplink::transport::stdio",
                    "mcp server stderr: {}",
                    line
                );
            }),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            state,
            outbound_tx: StdMutex::new(None),
            child: Mutex::new(None),
            workers: StdMutex::new(Workers::default()),
            released: AtomicBool::new(false),
        }
    }

    /// Replace the stderr diagnostic handler.
    pub fn with_diagnostic_handler(mut self, handler: DiagnosticHandler) -> Self {
        self.diagnostics = handler;
        self
    }

    /// Bound each step of the close sequence.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    fn spawn_child(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.params.command);
        cmd.args(&self.params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !self.params.inherit_env {
            cmd.env_clear();
        }
        cmd.envs(&self.params.env);
        if let Some(dir) = &self.params.working_dir {
            cmd.current_dir(dir);
        }

        cmd.spawn().map_err(|e| {
            McpError::Transport(format!(
                "failed to spawn MCP server `{}`: {}",
                self.params.command.display(),
                e
            ))
            .into()
        })
    }

    fn set_state(&self, state: TransportState) {
        self.state.send_replace(state);
    }

    /// Claim the teardown. Only the first close proceeds, and only if
    /// `connect` got as far as starting.
    fn begin_close(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut started = false;
        self.state.send_modify(|s| {
            started = *s != TransportState::Disconnected;
            *s = if started {
                TransportState::Closing
            } else {
                TransportState::Closed
            };
        });
        started
    }

    /// Drop the outbound queue and hand back the worker tasks.
    fn take_workers(&self) -> (Option<JoinHandle<()>>, Vec<JoinHandle<()>>) {
        if let Ok(mut slot) = self.outbound_tx.lock() {
            slot.take();
        }
        match self.workers.lock() {
            Ok(mut workers) => (workers.writer.take(), std::mem::take(&mut workers.readers)),
            Err(_) => (None, Vec::new()),
        }
    }
}

/// Frame one message as a single stdio line, trailing `\n` included.
///
/// # Errors
///
/// Returns [`McpError::Serialization`] if the message cannot be encoded.
///
/// # Examples
///
/// ```
/// use mcplink::transport::stdio::encode_line;
/// use mcplink::types::{JsonRpcMessage, JsonRpcNotification};
///
/// let msg: JsonRpcMessage =
///     JsonRpcNotification::new("notifications/message", Some(serde_json::json!({"data": "a\nb"}))).into();
/// let line = encode_line(&msg).unwrap();
/// assert_eq!(line.matches('\n').count(), 1);
/// assert!(line.ends_with('\n'));
/// ```
pub fn encode_line(message: &JsonRpcMessage) -> Result<String> {
    let mut line = serde_json::to_string(message).map_err(McpError::Serialization)?;
    debug_assert!(!line.contains('\n'));
    line.push('\n');
    Ok(line)
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Read newline-delimited JSON-RPC messages until EOF, skipping lines that
/// do not decode. A connected transport is marked closed once stdout ends.
async fn read_messages<R>(stream: R, inbound: InboundSender, state: watch::Sender<TransportState>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!("MCP server stdout closed");
                break;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match JsonRpcMessage::parse(line) {
                    Ok(message) => {
                        tracing::trace!(line = %line, "stdio <-");
                        if inbound.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, line = %line, "skipping malformed line from MCP server");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read MCP server stdout");
                break;
            }
        }
    }
    state.send_if_modified(|s| {
        if *s == TransportState::Connected {
            *s = TransportState::Closed;
            true
        } else {
            false
        }
    });
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    /// Spawn the child process and start the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::Transport`] if the process cannot be spawned or
    /// its pipes are unavailable, and [`McpError::InvalidState`] if the
    /// transport was connected before.
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
                "stdio transport is already {}",
                self.state()
            ))
            .into());
        }

        let mut child = match self.spawn_child() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(TransportState::Closed);
                return Err(e);
            }
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (stdin, stdout, stderr) = match pipes {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                self.set_state(TransportState::Closed);
                return Err(McpError::Transport("child stdio unavailable after spawn".into()).into());
            }
        };

        tracing::info!(
            command = %self.params.command.display(),
            pid = ?child.id(),
            "spawned MCP server"
        );

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundItem>();

        let writer = tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some((line, ack)) = outbound_rx.recv().await {
                let result = write_line(&mut stdin, &line).await;
                let failed = result.is_err();
                let _ = ack.send(result);
                if failed {
                    break;
                }
            }
            let _ = stdin.shutdown().await;
        });

        let stdout_reader = tokio::spawn(read_messages(stdout, inbound, self.state.clone()));

        let diagnostics = Arc::clone(&self.diagnostics);
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                diagnostics(line);
            }
        });

        *self.child.lock().await = Some(child);
        if let Ok(mut slot) = self.outbound_tx.lock() {
            *slot = Some(outbound_tx);
        }
        if let Ok(mut workers) = self.workers.lock() {
            workers.writer = Some(writer);
            workers.readers = vec![stdout_reader, stderr_reader];
        }

        self.set_state(TransportState::Connected);
        Ok(())
    }

    /// Queue one message for the writer task and wait until it is flushed.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::TransportClosed`] when the transport is not
    /// connected, and [`McpError::Transport`] if the write fails.
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        let line = encode_line(&message)?;
        let sender = match self.outbound_tx.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        let sender = sender.ok_or_else(closed_error)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        sender.send((line, ack_tx)).map_err(|_| closed_error())?;
        match ack_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(McpError::Transport(format!("failed to write to MCP server stdin: {e}")).into()),
            Err(_) => Err(closed_error()),
        }
    }

    /// Flush queued output, terminate the child, and join the worker tasks.
    async fn close_gracefully(&self) -> Result<()> {
        if !self.begin_close() {
            return Ok(());
        }
        let (writer, readers) = self.take_workers();

        if let Some(writer) = writer {
            if tokio::time::timeout(self.close_timeout, writer).await.is_err() {
                tracing::warn!("stdin writer did not finish before close timeout");
            }
        }

        if let Some(mut child) = self.child.lock().await.take() {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }

            match tokio::time::timeout(self.close_timeout, child.wait()).await {
                Ok(Ok(status)) => tracing::info!(%status, "MCP server exited"),
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to wait for MCP server"),
                Err(_) => {
                    tracing::warn!("MCP server ignored SIGTERM, killing");
                    let _ = child.kill().await;
                }
            }
        }

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(self.close_timeout, reader).await.is_err() {
                abort.abort();
            }
        }

        self.set_state(TransportState::Closed);
        Ok(())
    }

    /// Abort the worker tasks and kill the child without a grace period.
    async fn close(&self) -> Result<()> {
        if !self.begin_close() {
            return Ok(());
        }
        let (writer, readers) = self.take_workers();
        for task in writer.into_iter().chain(readers) {
            task.abort();
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match child.kill().await {
                Ok(()) => tracing::info!("MCP server killed"),
                Err(e) => tracing::warn!(error = %e, "failed to kill MCP server"),
            }
        }

        self.set_state(TransportState::Closed);
        Ok(())
    }

    /// Healthy while connected and the child has not exited.
    async fn check_health(&self) -> Result<()> {
        let state = self.state();
        if state != TransportState::Connected {
            return Err(McpError::Transport(format!("stdio transport is {state}")).into());
        }
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("no MCP server process".into()))?;
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                Err(McpError::Transport(format!("MCP server process exited with {status}")).into())
            }
            Err(e) => Err(McpError::Transport(format!("failed to poll MCP server process: {e}")).into()),
        }
    }

    fn state(&self) -> TransportState {
        *self.state.borrow()
    }
}

impl Drop for StdioTransport {
    /// Best-effort termination of the child process. Never blocks.
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                #[cfg(unix)]
                {
                    if let Some(pid) = child.id() {
                        // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                        unsafe {
                            libc::kill(pid as libc::pid_t, libc::SIGTERM);
                        }
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = child.start_kill();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{JsonRpcRequest, RequestId};

    fn sh(script: &str) -> StdioServerParameters {
        StdioServerParameters::new("sh")
            .args(["-c", script])
            .inherit_env(true)
    }

    #[tokio::test]
    async fn test_connect_nonexistent_executable_returns_error() {
        let transport = StdioTransport::new(StdioServerParameters::new(
            "/nonexistent/binary/that/does/not/exist",
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.connect(tx).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"), "unexpected: {err}");
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_cat_echoes_message_back_as_inbound() {
        let transport = StdioTransport::new(StdioServerParameters::new("cat"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        if transport.connect(tx).await.is_err() {
            return;
        }
        assert_eq!(transport.state(), TransportState::Connected);

        let sent: JsonRpcMessage = JsonRpcRequest::new(
            RequestId::from("t-1"),
            "ping",
            Some(serde_json::json!({"note": "multi\nline"})),
        )
        .into();
        transport.send(sent.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for echo")
            .expect("inbound closed");
        assert_eq!(received, sent);

        transport.close_gracefully().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let transport = StdioTransport::new(sh(
            r#"echo 'this is not json'; echo '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info","data":"ok"}}'; sleep 5"#,
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        if transport.connect(tx).await.is_err() {
            return;
        }

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("inbound closed");
        assert_eq!(received.method(), Some("notifications/message"));

        transport.close_gracefully().await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_goes_to_diagnostic_handler() {
        let (diag_tx, mut diag_rx) = mpsc::unbounded_channel::<String>();
        let transport = StdioTransport::new(sh("echo 'warming up' >&2; sleep 5"))
            .with_diagnostic_handler(Arc::new(move |line| {
                let _ = diag_tx.send(line);
            }));
        let (tx, _rx) = mpsc::unbounded_channel();
        if transport.connect(tx).await.is_err() {
            return;
        }

        let line = tokio::time::timeout(Duration::from_secs(5), diag_rx.recv())
            .await
            .expect("timed out")
            .expect("handler dropped");
        assert_eq!(line, "warming up");
        assert!(transport.check_health().await.is_ok());

        transport.close_gracefully().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_sends() {
        let transport = StdioTransport::new(StdioServerParameters::new("cat"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        if transport.connect(tx).await.is_err() {
            return;
        }

        transport.close_gracefully().await.unwrap();
        transport.close_gracefully().await.unwrap();
        assert_eq!(transport.state(), TransportState::Closed);

        // Reader exit drops the inbound sender.
        assert!(rx.recv().await.is_none());

        let err = transport
            .send(JsonRpcRequest::new(RequestId::from(1), "ping", None).into())
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<McpError>(),
            Some(McpError::TransportClosed)
        ));
        assert!(transport.check_health().await.is_err());
    }

    #[tokio::test]
    async fn test_stdout_eof_marks_transport_closed() {
        let transport = StdioTransport::new(sh("exit 0"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        if transport.connect(tx).await.is_err() {
            return;
        }
        // The reader updates the state before it drops the inbound sender.
        assert!(rx.recv().await.is_none());
        assert_eq!(transport.state(), TransportState::Closed);

        let err = transport.check_health().await.unwrap_err();
        assert!(err.to_string().contains("closed"), "unexpected: {err}");

        // The exited child is still reaped.
        transport.close_gracefully().await.unwrap();
        assert!(transport.child.lock().await.is_none());
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_close_kills_child_that_ignores_sigterm() {
        let transport = StdioTransport::new(sh("trap '' TERM; while true; do sleep 0.1; done"))
            .with_close_timeout(Duration::from_secs(10));
        let (tx, mut rx) = mpsc::unbounded_channel();
        if transport.connect(tx).await.is_err() {
            return;
        }

        let started = std::time::Instant::now();
        transport.close().await.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "close took {:?}",
            started.elapsed()
        );
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(transport.child.lock().await.is_none());

        let next = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("inbound stream still open after close");
        assert!(next.is_none());

        transport.close_gracefully().await.unwrap();
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_connect_rejected() {
        let transport = StdioTransport::new(StdioServerParameters::new("cat"));
        let (tx, _rx) = mpsc::unbounded_channel();
        if transport.connect(tx.clone()).await.is_err() {
            return;
        }
        let err = transport.connect(tx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<McpError>(),
            Some(McpError::InvalidState(_))
        ));
        transport.close_gracefully().await.unwrap();
    }
}
