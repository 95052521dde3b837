//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with backend child processes:
//! - Writing JSON-RPC messages to stdin, one JSON object per line
//! - A reader task that routes responses to their waiters by id
//! - Draining stderr into the log

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{dispatch_incoming, CloseSignal, OpenedTransport, PendingRequests, Transport};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{parse_incoming, JsonRpcRequest, JsonRpcResponse};

/// Time a process gets to exit after stdin closes before it is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound line queue depth.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer_tx: mpsc::Sender<String>,
    pending: PendingRequests,
    close: Arc<CloseSignal>,
    child: Mutex<Option<Child>>,
    writer_handle: JoinHandle<()>,
    reader_handle: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn a backend process and wire its stdio to a new transport.
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<OpenedTransport, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::connection(name, format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connection(name, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connection(name, "failed to capture stdout"))?;

        if let Some(stderr) = child.stderr.take() {
            let server = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        tracing::debug!(server = %server, stderr = %trimmed, "server stderr");
                    }
                }
            });
        }

        tracing::info!(server = name, command, "spawned backend process");
        Ok(Self::from_io(name, stdout, stdin, Some(child)))
    }

    /// Build a transport over arbitrary byte streams (used for pipes and tests).
    pub fn from_io<R, W>(name: &str, reader: R, writer: W, child: Option<Child>) -> OpenedTransport
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let close = Arc::new(CloseSignal::new(events_tx));
        let pending = PendingRequests::default();
        let (writer_tx, writer_rx) = mpsc::channel::<String>(WRITE_QUEUE_DEPTH);

        let writer_handle = tokio::spawn(write_loop(
            name.to_string(),
            writer,
            writer_rx,
            Arc::clone(&close),
        ));
        let reader_handle = tokio::spawn(read_loop(
            name.to_string(),
            reader,
            pending.clone(),
            writer_tx.clone(),
            Arc::clone(&close),
        ));

        let transport = Self {
            server_name: name.to_string(),
            writer_tx,
            pending,
            close,
            child: Mutex::new(child),
            writer_handle,
            reader_handle,
        };

        OpenedTransport {
            transport: Arc::new(transport),
            events: events_rx,
        }
    }

    async fn send_line(&self, value: &impl serde::Serialize) -> Result<(), McpError> {
        let json = serde_json::to_string(value).map_err(|e| {
            McpError::connection(&self.server_name, format!("failed to serialize message: {e}"))
        })?;
        self.writer_tx
            .send(json)
            .await
            .map_err(|_| McpError::connection(&self.server_name, "transport writer closed"))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.close.is_closed() {
            return Err(McpError::connection(&self.server_name, "transport is closed"));
        }

        let mut waiter = self.pending.register(id);
        self.send_line(&JsonRpcRequest::new(id, method, params)).await?;

        tokio::select! {
            resp = waiter.recv() => resp.ok_or_else(|| {
                McpError::connection(
                    &self.server_name,
                    "server stdout closed (process may have exited)",
                )
            }),
            _ = self.close.token().cancelled() => Err(McpError::connection(
                &self.server_name,
                "server stdout closed (process may have exited)",
            )),
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        self.send_line(&notification).await
    }

    async fn close(&self) {
        self.close.silence();
        self.pending.fail_all();
        // Dropping the writer closes stdin, which asks the server to exit.
        self.writer_handle.abort();
        self.reader_handle.abort();

        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_name, %status, "backend process exited");
                }
                _ => {
                    tracing::warn!(server = %self.server_name, "backend did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}

async fn write_loop<W>(
    server: String,
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    close: Arc<CloseSignal>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let result = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(server = %server, error = %e, "failed to write to stdin");
            close.fire(&format!("stdin write failed: {e}"));
            break;
        }
    }
}

async fn read_loop<R>(
    server: String,
    reader: R,
    pending: PendingRequests,
    writer_tx: mpsc::Sender<String>,
    close: Arc<CloseSignal>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                // Anything that is not JSON-RPC is treated as log output.
                let Some(incoming) = parse_incoming(trimmed) else {
                    tracing::trace!(server = %server, line = %trimmed, "non-protocol stdout line");
                    continue;
                };
                if let Some(reply) = dispatch_incoming(&server, incoming, &pending, close.events()) {
                    let _ = writer_tx.send(reply.to_string()).await;
                }
            }
            Ok(None) => break "server stdout closed (process exited)".to_string(),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::info!(server = %server, reason = %reason, "stdio transport reader finished");
    pending.fail_all();
    close.fire(&reason);
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::transport::TransportEvent;
    use tokio::io::{duplex, AsyncBufReadExt};

    #[tokio::test]
    async fn test_request_round_trip_over_pipes() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);

        let opened = StdioTransport::from_io("echo", client_read, client_write, None);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                if req.get("id").is_none() {
                    continue;
                }
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": {"echo": req["method"]},
                });
                server_write
                    .write_all(format!("server log line\n{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        let resp = opened
            .transport
            .request(42, "tools/list", None)
            .await
            .unwrap();
        assert_eq!(resp.id, 42);
        assert_eq!(resp.result.unwrap()["echo"], "tools/list");
    }

    #[tokio::test]
    async fn test_eof_raises_closed_event_and_fails_request() {
        let (client_io, server_io) = duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut opened = StdioTransport::from_io("gone", client_read, client_write, None);

        drop(server_io);

        let err = opened.transport.request(1, "ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));

        match opened.events.recv().await {
            Some(TransportEvent::Closed { .. }) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_notification_forwarded_as_event() {
        let (client_io, server_io) = duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (_server_read, mut server_write) = tokio::io::split(server_io);
        let mut opened = StdioTransport::from_io("notify", client_read, client_write, None);

        server_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/tools/list_changed\"}\n")
            .await
            .unwrap();

        match opened.events.recv().await {
            Some(TransportEvent::Notification { method, .. }) => {
                assert_eq!(method, "notifications/tools/list_changed")
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_is_silent() {
        let (client_io, _server_io) = duplex(1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let mut opened = StdioTransport::from_io("quiet", client_read, client_write, None);

        opened.transport.close().await;
        assert!(opened.transport.request(2, "ping", None).await.is_err());
        assert!(opened.events.try_recv().is_err());
    }
}
