//! Transports to tool servers.
//!
//! A transport moves newline-terminated JSON messages to a server and feeds
//! everything it receives into the shared [`RequestCorrelator`]. Only the
//! process (stdio) transport exists today; HTTP and WebSocket descriptors are
//! recognized but refused.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use super::correlator::RequestCorrelator;
use super::errors::McpError;
use super::framing::{Frame, InboundMessage, LineFramer, ResponseFailure};
use super::lifecycle::SharedLinkState;
use super::types::{ConnectionStatus, JsonRpcNotification, ServerDescriptor, TransportKind};

/// Stderr lines kept for init-failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Longest line echoed into a log record.
const LOG_LINE_LIMIT: usize = 200;

// ─── Transport Trait ─────────────────────────────────────────────────────────

/// A message channel to one tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one message. `line` must not contain a newline.
    async fn send_line(&self, line: String) -> Result<(), McpError>;

    /// Stop the channel, giving the server `grace` to exit on its own.
    async fn close(&self, grace: Duration);

    fn kind(&self) -> TransportKind;

    /// Recent diagnostic output from the server, if the transport has any.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Serialize a message as a single JSON line.
pub fn encode_line<T: Serialize>(server: &str, message: &T) -> Result<String, McpError> {
    serde_json::to_string(message).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })
}

/// Open a transport for `descriptor`.
pub fn open(
    descriptor: &ServerDescriptor,
    correlator: Arc<RequestCorrelator>,
    state: SharedLinkState,
) -> Result<Arc<dyn Transport>, McpError> {
    match descriptor.transport {
        TransportKind::Process => Ok(Arc::new(StdioTransport::spawn(
            descriptor, correlator, state,
        )?)),
        kind @ (TransportKind::Http | TransportKind::Websocket) => {
            Err(McpError::UnsupportedTransport {
                name: descriptor.name.clone(),
                transport: kind.to_string(),
            })
        }
    }
}

// ─── StdioTransport ──────────────────────────────────────────────────────────

/// Child process speaking line-delimited JSON over stdin/stdout.
///
/// Three background tasks run per process: a stdout reader that dispatches
/// frames, a stderr logger, and a supervisor that owns the `Child` and
/// reports its exit.
pub struct StdioTransport {
    server: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl StdioTransport {
    /// Spawn the descriptor's command and start the I/O tasks.
    pub fn spawn(
        descriptor: &ServerDescriptor,
        correlator: Arc<RequestCorrelator>,
        state: SharedLinkState,
    ) -> Result<Self, McpError> {
        let name = descriptor.name.clone();
        let (program, args) = descriptor
            .command_line()
            .ok_or_else(|| McpError::SpawnFailed {
                name: name.clone(),
                reason: "no command configured".into(),
            })?;

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        for (key, value) in &descriptor.env {
            cmd.env(key, value);
        }
        if let Some(dir) = descriptor.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.clone(),
            reason: format!("{program}: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            name: name.clone(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        tracing::info!(server = %name, pid = ?child.id(), command = %program, "spawned tool server");

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);

        tokio::spawn(read_stdout(name.clone(), stdout, Arc::clone(&correlator)));
        if let Some(stderr) = stderr {
            tokio::spawn(read_stderr(name.clone(), stderr, Arc::clone(&stderr_tail)));
        }
        tokio::spawn(supervise(
            name.clone(),
            child,
            kill_rx,
            exited_tx,
            state,
            correlator,
        ));

        Ok(Self {
            server: name,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            kill_tx: Mutex::new(Some(kill_tx)),
            exited: exited_rx,
            stderr_tail,
        })
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn kill(&self) {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        let mut exited = self.exited.clone();
        let done = matches!(
            tokio::time::timeout(limit, exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        done
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server.clone(),
            reason,
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_line(&self, line: String) -> Result<(), McpError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin is closed".into()))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;
        Ok(())
    }

    async fn close(&self, grace: Duration) {
        if !self.has_exited() {
            if let Ok(line) = encode_line(&self.server, &JsonRpcNotification::new("shutdown", None))
            {
                let _ = self.send_line(line).await;
            }
        }
        // Dropping stdin sends EOF.
        self.stdin.lock().await.take();

        if self.wait_exit(grace).await {
            return;
        }
        tracing::warn!(
            server = %self.server,
            grace_ms = grace.as_millis() as u64,
            "tool server did not exit in time, killing"
        );
        self.kill();
        self.wait_exit(Duration::from_secs(1)).await;
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn diagnostics(&self) -> Option<String> {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.is_empty() {
            None
        } else {
            Some(tail.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn read_stdout(server: String, mut stdout: ChildStdout, correlator: Arc<RequestCorrelator>) {
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; 8192];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for frame in framer.push(&buf[..n]) {
                    dispatch(&server, &correlator, frame);
                }
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stdout read failed");
                break;
            }
        }
    }
    let leftover = framer.pending_len();
    if leftover > 0 {
        tracing::warn!(server = %server, leftover, "stdout closed mid-message, dropping partial line");
    } else {
        tracing::debug!(server = %server, "stdout closed");
    }
}

fn dispatch(server: &str, correlator: &RequestCorrelator, frame: Frame) {
    match frame {
        Frame::Message(InboundMessage::Response { id, outcome }) => {
            let outcome = outcome.map_err(ResponseFailure::into_error);
            if !correlator.complete(&id, outcome) {
                tracing::debug!(server, id = %id, "response for unknown or expired request");
            }
        }
        Frame::Message(InboundMessage::Notification { method, params }) => match method.as_str() {
            "mcp/log" | "notifications/message" => {
                let text = params
                    .get("message")
                    .or_else(|| params.get("data"))
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_else(|| params.to_string());
                let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
                tracing::info!(server, level, text = %text, "server log");
            }
            _ => {
                tracing::debug!(server, method = %method, params = %params, "server notification");
            }
        },
        Frame::Message(InboundMessage::Request { id, method }) => {
            tracing::warn!(server, id = %id, method = %method, "ignoring server-initiated request");
        }
        Frame::Malformed { line, reason } => {
            tracing::warn!(
                server,
                reason = %reason,
                line = %truncate(&line, LOG_LINE_LIMIT),
                "dropping malformed line"
            );
        }
    }
}

async fn read_stderr(server: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::warn!(server = %server, line = %truncate(&line, LOG_LINE_LIMIT), "server stderr");
        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Own the child until it exits, then report the exit to the connection and
/// fail every request still waiting on it.
async fn supervise(
    server: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    state: SharedLinkState,
    correlator: Arc<RequestCorrelator>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let detail = match &status {
        Ok(status) => match status.code() {
            Some(code) => format!("code: {code}"),
            None => status.to_string(),
        },
        Err(e) => format!("wait failed: {e}"),
    };

    let closing = {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.closing {
            state.set_status(ConnectionStatus::Error);
            state.last_error = Some(format!("process exited ({detail})"));
        }
        state.closing
    };

    if closing {
        tracing::info!(server = %server, detail = %detail, "tool server stopped");
    } else {
        tracing::warn!(server = %server, detail = %detail, "tool server exited unexpectedly");
    }

    let rejected = correlator.reject_server(&server, || McpError::ServerExited {
        name: server.clone(),
        detail: detail.clone(),
    });
    if rejected > 0 {
        tracing::warn!(server = %server, rejected, "rejected pending requests after exit");
    }

    let _ = exited_tx.send(true);
}

fn truncate(line: &str, limit: usize) -> String {
    if line.chars().count() <= limit {
        return line.to_string();
    }
    let mut s: String = line.chars().take(limit).collect();
    s.push_str("...(truncated)");
    s
}

// ─── Tests ───────────────────────────────────────────────────────────────────
