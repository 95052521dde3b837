//! Transport adapters.
//!
//! A transport opens one physical channel to a backend and exchanges raw
//! JSON-RPC messages over it. Three kinds exist:
//! - `stdio`: spawned process, newline-delimited JSON over its pipes
//! - `http`: streamable HTTP (POST per message, optional push over GET)
//! - `sse`: legacy server-push event stream with a POST side channel
//!
//! Inbound notifications and channel loss are reported through the
//! `TransportEvent` receiver returned when the transport is opened.

pub mod http;
pub mod sse;
pub mod stdio;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::types::{error_codes, Incoming, JsonRpcResponse, ServerDescriptor, TransportConfig};

pub use http::HttpStreamTransport;
pub use sse::{PushStreamTransport, SseDecoder, SseEvent};
pub use stdio::StdioTransport;

// ─── Request ID Generator ───────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Traits ─────────────────────────────────────────────────────────────────

/// Out-of-band events raised by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The backend sent a notification.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// The channel went away without being asked to.
    Closed { reason: String },
}

/// One open channel to a backend.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request with a caller-allocated id and wait for its response.
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError>;

    /// Called once the initialize handshake has completed.
    async fn on_ready(&self) {}

    /// Release the channel. Must not raise a `Closed` event.
    async fn close(&self);
}

/// A freshly opened transport plus its event stream.
pub struct OpenedTransport {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports for descriptors. Swappable for tests.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
        credential: Option<String>,
    ) -> Result<OpenedTransport, McpError>;
}

/// Factory dispatching on the descriptor's transport kind.
#[derive(Clone, Default)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
}

impl DefaultTransportFactory {
    /// Create a factory sharing one HTTP client across connections.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(
        &self,
        descriptor: &ServerDescriptor,
        credential: Option<String>,
    ) -> Result<OpenedTransport, McpError> {
        match &descriptor.transport {
            TransportConfig::LocalProcess {
                command,
                args,
                env,
                cwd,
            } => StdioTransport::spawn(&descriptor.name, command, args, env, cwd.as_deref()),
            TransportConfig::HttpStream { url, headers, .. } => {
                HttpStreamTransport::open(&descriptor.name, self.http.clone(), url, headers, credential)
            }
            TransportConfig::PushStream { url, headers, .. } => {
                PushStreamTransport::open(&descriptor.name, self.http.clone(), url, headers, credential)
                    .await
            }
        }
    }
}

// ─── Pending Requests ───────────────────────────────────────────────────────

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// Requests awaiting a response, keyed by JSON-RPC id.
#[derive(Clone, Default)]
pub(crate) struct PendingRequests {
    inner: Arc<Mutex<PendingMap>>,
}

impl PendingRequests {
    /// Register an id; the returned guard removes it again when dropped.
    pub(crate) fn register(&self, id: u64) -> PendingGuard {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id, tx);
        }
        PendingGuard {
            id,
            pending: self.clone(),
            rx,
        }
    }

    /// Hand a response to its waiter. Returns false for unknown ids.
    pub(crate) fn complete(&self, response: JsonRpcResponse) -> bool {
        let sender = self
            .inner
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&response.id));
        match sender {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub(crate) fn fail_all(&self) {
        if let Ok(mut map) = self.inner.lock() {
            map.clear();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Waiter for one response.
pub(crate) struct PendingGuard {
    id: u64,
    pending: PendingRequests,
    rx: oneshot::Receiver<JsonRpcResponse>,
}

impl PendingGuard {
    /// Wait for the response; `None` if the transport dropped the waiter.
    pub(crate) async fn recv(&mut self) -> Option<JsonRpcResponse> {
        (&mut self.rx).await.ok()
    }

    /// Take the response if it has already arrived.
    pub(crate) fn try_take(&mut self) -> Option<JsonRpcResponse> {
        self.rx.try_recv().ok()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.inner.lock() {
            map.remove(&self.id);
        }
    }
}

// ─── Close Signal ───────────────────────────────────────────────────────────

/// Fires the `Closed` event at most once and wakes every waiter.
pub(crate) struct CloseSignal {
    fired: AtomicBool,
    token: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl CloseSignal {
    pub(crate) fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            token: CancellationToken::new(),
            events,
        }
    }

    /// Unexpected loss of the channel.
    pub(crate) fn fire(&self, reason: &str) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
        self.token.cancel();
    }

    /// Deliberate shutdown: wake waiters without reporting a loss.
    pub(crate) fn silence(&self) {
        self.fired.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn events(&self) -> &mpsc::UnboundedSender<TransportEvent> {
        &self.events
    }
}

// ─── Inbound Dispatch ───────────────────────────────────────────────────────

/// Route one inbound message. Returns a serialized reply when the backend
/// sent us a request that needs answering.
pub(crate) fn dispatch_incoming(
    server: &str,
    incoming: Incoming,
    pending: &PendingRequests,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> Option<serde_json::Value> {
    match incoming {
        Incoming::Response(resp) => {
            let id = resp.id;
            if !pending.complete(resp) {
                tracing::debug!(server, id, "response for unknown request id, ignoring");
            }
            None
        }
        Incoming::Notification { method, params } => {
            tracing::trace!(server, method = %method, "notification received");
            let _ = events.send(TransportEvent::Notification { method, params });
            None
        }
        Incoming::Request { id, method } => {
            if method == "ping" {
                Some(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}}))
            } else {
                tracing::debug!(server, method = %method, "unsupported server request");
                Some(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": error_codes::METHOD_NOT_FOUND,
                        "message": format!("method '{method}' not supported by client"),
                    },
                }))
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
