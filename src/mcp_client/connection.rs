//! One backend connection and its state machine.
//!
//! A `Connection` owns a transport, drives `Disconnected → Connecting →
//! Connected`, publishes its capability snapshot into the shared registry,
//! reconnects with backoff when the transport drops, and forwards calls.
//!
//! All state sits behind a `std::sync::Mutex` that is never held across an
//! `.await`. Background work (retry timers, the transport watcher) is tagged
//! with a generation number; anything that finishes after the generation
//! moved on is ignored.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::auth::CredentialProvider;
use super::errors::McpError;
use super::lifecycle::{BackoffPolicy, ConnectionState, Lifecycle};
use super::registry::CapabilityRegistry;
use super::transport::{next_request_id, Transport, TransportEvent, TransportFactory};
use super::types::{
    extract_result, CallOptions, CapabilityDescriptor, InitializeResult, JsonRpcResponse,
    PromptDefinition, ResourceDefinition, ServerDescriptor, ServerInfo, ToolCallResult,
    ToolDefinition, TransportKind, PROTOCOL_VERSION,
};
use crate::config::ConnectionSettings;
use crate::events::{CapabilitiesChanged, EventSink, StateChange};

/// Stop following `nextCursor` after this many pages.
const MAX_LIST_PAGES: usize = 100;

// ─── Shared Context ──────────────────────────────────────────────────────────

/// Collaborators every connection needs. Cloned into each connection.
#[derive(Clone)]
pub struct ConnectionContext {
    pub registry: Arc<CapabilityRegistry>,
    pub events: Arc<dyn EventSink>,
    pub factory: Arc<dyn TransportFactory>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub settings: ConnectionSettings,
    pub lifecycle: Lifecycle,
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Point-in-time view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub server: String,
    pub transport: TransportKind,
    pub state: ConnectionState,
    /// Automatic reconnect attempts since the last success or explicit connect.
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub capability_count: usize,
    pub server_info: Option<ServerInfo>,
    pub connected_since: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

// ─── Internal State ──────────────────────────────────────────────────────────

/// Which capability families the backend offers.
#[derive(Debug, Clone, Copy, Default)]
struct Advertised {
    tools: bool,
    resources: bool,
    prompts: bool,
}

impl Advertised {
    fn from_init(init: &InitializeResult) -> Self {
        // Servers that advertise nothing at all still get asked for tools.
        let nothing = init
            .capabilities
            .as_object()
            .map_or(true, |caps| caps.is_empty());
        Self {
            tools: nothing || init.advertises("tools") || !init.tools.is_empty(),
            resources: init.advertises("resources"),
            prompts: init.advertises("prompts"),
        }
    }
}

struct ConnState {
    state: ConnectionState,
    generation: u64,
    transport: Option<Arc<dyn Transport>>,
    advertised: Advertised,
    capabilities: usize,
    server_info: Option<ServerInfo>,
    attempts: u32,
    last_error: Option<String>,
    connected_since: Option<DateTime<Utc>>,
    retry: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

/// Events collected under the lock and published after it is released.
#[derive(Default)]
struct Outbox {
    states: Vec<StateChange>,
    capabilities: Vec<CapabilitiesChanged>,
}

struct Inner {
    descriptor: ServerDescriptor,
    ctx: ConnectionContext,
    backoff: BackoffPolicy,
    lifecycle: Lifecycle,
    in_flight: Arc<Semaphore>,
    state: Mutex<ConnState>,
}

/// Result of a successful open + handshake + capability fetch.
struct Established {
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    advertised: Advertised,
    server_info: Option<ServerInfo>,
    capabilities: Vec<CapabilityDescriptor>,
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// Handle to one backend connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a connection for `descriptor`. Disabled descriptors start in
    /// `Disabled`, everything else in `Disconnected`.
    pub fn new(descriptor: ServerDescriptor, ctx: &ConnectionContext) -> Self {
        let initial = if descriptor.enabled {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Disabled
        };
        let inner = Inner {
            backoff: ctx.settings.backoff(),
            lifecycle: ctx.lifecycle.child(),
            in_flight: Arc::new(Semaphore::new(ctx.settings.max_in_flight.max(1))),
            ctx: ctx.clone(),
            descriptor,
            state: Mutex::new(ConnState {
                state: initial,
                generation: 0,
                transport: None,
                advertised: Advertised::default(),
                capabilities: 0,
                server_info: None,
                attempts: 0,
                last_error: None,
                connected_since: None,
                retry: None,
                watcher: None,
            }),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.inner.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn status(&self) -> ConnectionStatus {
        let st = self.lock();
        ConnectionStatus {
            server: self.name().to_string(),
            transport: self.inner.descriptor.kind(),
            state: st.state,
            reconnect_attempts: st.attempts,
            last_error: st.last_error.clone(),
            capability_count: st.capabilities,
            server_info: st.server_info.clone(),
            connected_since: st.connected_since,
            in_flight: self.inner.ctx.settings.max_in_flight.max(1)
                - self.inner.in_flight.available_permits(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect if not already connected or connecting.
    ///
    /// Never fails: errors move the connection to `Failed` (with a retry
    /// scheduled) or `AuthRequired`. An explicit connect resets the retry
    /// budget.
    pub async fn connect(&self) {
        let generation = {
            let mut outbox = Outbox::default();
            let mut st = self.lock();
            if !st.state.accepts_connect() {
                tracing::debug!(server = %self.name(), state = %st.state, "connect ignored");
                return;
            }
            if let Some(retry) = st.retry.take() {
                retry.abort();
            }
            st.attempts = 0;
            st.generation += 1;
            self.transition(&mut st, ConnectionState::Connecting, None, &mut outbox);
            let generation = st.generation;
            drop(st);
            self.publish(outbox);
            generation
        };
        self.attempt(generation).await;
    }

    /// Close the transport and return to `Disconnected`.
    pub async fn disconnect(&self) {
        self.release(ConnectionState::Disconnected).await;
    }

    /// Close the transport, drop capabilities, cancel timers and in-flight
    /// calls. Terminal: re-enabling means building a new connection.
    pub async fn disable(&self) {
        self.release(ConnectionState::Disabled).await;
        self.inner.lifecycle.shutdown();
    }

    /// Re-fetch the capability lists and republish them.
    pub async fn refresh_capabilities(&self) -> Result<usize, McpError> {
        let (transport, advertised, generation) = {
            let st = self.lock();
            match (&st.transport, st.state) {
                (Some(t), ConnectionState::Connected) => (Arc::clone(t), st.advertised, st.generation),
                _ => return Err(self.unavailable(st.state)),
            }
        };

        let capabilities = fetch_capabilities(self.name(), &transport, advertised, Vec::new()).await?;

        let mut outbox = Outbox::default();
        let mut st = self.lock();
        if st.generation != generation || st.state != ConnectionState::Connected {
            return Err(self.unavailable(st.state));
        }
        let count = self.publish_capabilities(&mut st, capabilities, &mut outbox);
        drop(st);
        self.publish(outbox);
        tracing::info!(server = %self.name(), count, "capabilities refreshed");
        Ok(count)
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    /// Call a tool by its original (un-namespaced) name.
    ///
    /// Never retried here. A remote failure is `McpError::Tool`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        opts: CallOptions,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();
        let params = json!({ "name": tool, "arguments": arguments });
        let response = self.request("tools/call", params, &opts).await?;
        let elapsed = start.elapsed().as_millis() as u64;

        if let Some(err) = response.error {
            return Err(McpError::Tool {
                server: self.name().to_string(),
                tool: tool.to_string(),
                code: Some(err.code),
                message: err.message,
                data: err.data,
            });
        }

        let result = response.result.unwrap_or(Value::Null);
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(McpError::Tool {
                server: self.name().to_string(),
                tool: tool.to_string(),
                code: None,
                message: first_text(&result).unwrap_or_else(|| "tool reported an error".into()),
                data: Some(result),
            });
        }

        tracing::debug!(server = %self.name(), tool, elapsed_ms = elapsed, "tool call completed");
        Ok(ToolCallResult {
            server: self.name().to_string(),
            tool: tool.to_string(),
            content: result.get("content").cloned().unwrap_or_else(|| json!([])),
            structured: result.get("structuredContent").cloned(),
            execution_time_ms: elapsed,
        })
    }

    /// `resources/read`.
    pub async fn read_resource(&self, uri: &str, opts: CallOptions) -> Result<Value, McpError> {
        let response = self.request("resources/read", json!({ "uri": uri }), &opts).await?;
        extract_result(self.name(), response)
    }

    /// `prompts/get`.
    pub async fn get_prompt(&self, name: &str, arguments: Value, opts: CallOptions) -> Result<Value, McpError> {
        let params = json!({ "name": name, "arguments": arguments });
        let response = self.request("prompts/get", params, &opts).await?;
        extract_result(self.name(), response)
    }

    /// Send one request on the live transport under backpressure, timeout
    /// and cancellation rules.
    async fn request(&self, method: &str, params: Value, opts: &CallOptions) -> Result<JsonRpcResponse, McpError> {
        let transport = self.live_transport()?;
        let _permit = self.try_permit()?;

        let timeout = opts.timeout.unwrap_or_else(|| self.inner.ctx.settings.call_timeout());
        let cancel = opts.cancel.clone().unwrap_or_default();
        let id = next_request_id();
        let mut guard = CancelOnDrop::new(self.name(), Arc::clone(&transport), id);

        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, transport.request(id, method, Some(params))) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => {
                        guard.reason = "timeout";
                        Err(McpError::Timeout {
                            server: self.name().to_string(),
                            operation: method.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    }
                }
            }
            _ = cancel.cancelled() => {
                guard.reason = "cancelled by caller";
                Err(McpError::Cancelled { server: self.name().to_string(), operation: method.to_string() })
            }
            _ = self.inner.lifecycle.stopped() => {
                guard.reason = "client shutting down";
                Err(McpError::Cancelled { server: self.name().to_string(), operation: method.to_string() })
            }
        };

        if !matches!(outcome, Err(McpError::Timeout { .. }) | Err(McpError::Cancelled { .. })) {
            guard.disarm();
        }
        outcome
    }

    fn live_transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        let st = self.lock();
        match (&st.transport, st.state) {
            (Some(t), ConnectionState::Connected) => Ok(Arc::clone(t)),
            _ => Err(self.unavailable(st.state)),
        }
    }

    fn try_permit(&self) -> Result<OwnedSemaphorePermit, McpError> {
        Arc::clone(&self.inner.in_flight)
            .try_acquire_owned()
            .map_err(|_| McpError::ServerBusy {
                server: self.name().to_string(),
                limit: self.inner.ctx.settings.max_in_flight.max(1),
            })
    }

    fn unavailable(&self, state: ConnectionState) -> McpError {
        McpError::ServerUnavailable {
            server: self.name().to_string(),
            state: state.to_string(),
        }
    }

    // ─── Connect Attempt ─────────────────────────────────────────────────

    async fn attempt(&self, generation: u64) {
        let timeout = self.inner.ctx.settings.init_timeout();
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.establish()) => match result {
                Ok(inner) => inner,
                Err(_) => Err(McpError::Timeout {
                    server: self.name().to_string(),
                    operation: "initialize".into(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            },
            _ = self.inner.lifecycle.stopped() => Err(McpError::Cancelled {
                server: self.name().to_string(),
                operation: "connect".into(),
            }),
        };

        match result {
            Ok(established) => self.on_established(generation, established).await,
            Err(e) => self.on_attempt_failed(generation, e),
        }
    }

    async fn establish(&self) -> Result<Established, McpError> {
        let descriptor = &self.inner.descriptor;
        let credential = self.inner.ctx.credentials.get_credential(self.name()).await;
        if descriptor.transport.requires_credential() && credential.is_none() {
            return Err(McpError::AuthRequired {
                server: self.name().to_string(),
                reason: "no credential available".into(),
            });
        }

        let opened = self.inner.ctx.factory.open(descriptor, credential).await?;
        match handshake(self.name(), &opened.transport).await {
            Ok((advertised, server_info, capabilities)) => Ok(Established {
                transport: opened.transport,
                events: opened.events,
                advertised,
                server_info,
                capabilities,
            }),
            Err(e) => {
                opened.transport.close().await;
                Err(e)
            }
        }
    }

    async fn on_established(&self, generation: u64, est: Established) {
        let transport = Arc::clone(&est.transport);
        if self.accept_established(generation, est) {
            transport.on_ready().await;
        } else {
            // Disabled or disconnected while we were connecting.
            transport.close().await;
        }
    }

    fn accept_established(&self, generation: u64, est: Established) -> bool {
        let mut outbox = Outbox::default();
        let mut st = self.lock();
        if st.generation != generation || st.state != ConnectionState::Connecting {
            return false;
        }

        st.transport = Some(est.transport);
        st.advertised = est.advertised;
        st.server_info = est.server_info;
        st.attempts = 0;
        st.last_error = None;
        st.connected_since = Some(Utc::now());
        // Registration and the state flip happen under the same lock, so no
        // observer sees a connected server without capabilities.
        let count = self.publish_capabilities(&mut st, est.capabilities, &mut outbox);
        self.transition(&mut st, ConnectionState::Connected, None, &mut outbox);
        st.watcher = Some(tokio::spawn(watch(
            Arc::downgrade(&self.inner),
            generation,
            est.events,
        )));
        drop(st);
        self.publish(outbox);

        tracing::info!(server = %self.name(), capabilities = count, "connected");
        true
    }

    fn on_attempt_failed(&self, generation: u64, error: McpError) {
        let mut outbox = Outbox::default();
        let mut st = self.lock();
        if st.generation != generation || st.state != ConnectionState::Connecting {
            return;
        }
        let message = error.to_string();
        st.last_error = Some(message.clone());
        if error.is_auth() {
            self.transition(&mut st, ConnectionState::AuthRequired, Some(message), &mut outbox);
        } else {
            self.transition(&mut st, ConnectionState::Failed, Some(message), &mut outbox);
            self.schedule_retry(&mut st);
        }
        drop(st);
        self.publish(outbox);
    }

    /// Transport went away while connected.
    fn on_transport_lost(&self, generation: u64, reason: String) {
        let mut outbox = Outbox::default();
        let mut st = self.lock();
        if st.generation != generation || st.state != ConnectionState::Connected {
            return;
        }
        let transport = st.transport.take();
        st.watcher = None;
        st.connected_since = None;
        st.last_error = Some(reason.clone());
        self.revoke_capabilities(&mut st, &mut outbox);
        self.transition(&mut st, ConnectionState::Failed, Some(reason), &mut outbox);
        self.schedule_retry(&mut st);
        drop(st);
        self.publish(outbox);

        if let Some(transport) = transport {
            // Reap whatever is left (child process, listener tasks).
            tokio::spawn(async move { transport.close().await });
        }
    }

    /// Start the next automatic attempt if the budget allows.
    fn schedule_retry(&self, st: &mut ConnState) {
        if self.inner.lifecycle.is_shutting_down() {
            return;
        }
        if !self.inner.backoff.allows(st.attempts) {
            tracing::warn!(
                server = %self.name(),
                attempts = st.attempts,
                "reconnect attempts exhausted, staying failed"
            );
            return;
        }
        let delay = self.inner.backoff.delay_for(st.attempts);
        st.attempts += 1;
        let generation = st.generation;
        let weak = Arc::downgrade(&self.inner);
        let lifecycle = self.inner.lifecycle.clone();

        tracing::info!(
            server = %self.name(),
            attempt = st.attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        st.retry = Some(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = lifecycle.stopped() => return,
            }
            if let Some(inner) = weak.upgrade() {
                Connection { inner }.retry(generation).await;
            }
        }));
    }

    async fn retry(&self, generation: u64) {
        let generation = {
            let mut outbox = Outbox::default();
            let mut st = self.lock();
            if st.generation != generation || st.state != ConnectionState::Failed {
                return;
            }
            st.retry = None;
            st.generation += 1;
            self.transition(&mut st, ConnectionState::Connecting, None, &mut outbox);
            let generation = st.generation;
            drop(st);
            self.publish(outbox);
            generation
        };
        self.attempt(generation).await;
    }

    async fn release(&self, target: ConnectionState) {
        let transport = {
            let mut outbox = Outbox::default();
            let mut st = self.lock();
            if st.state == ConnectionState::Disabled
                || (st.state == target && st.transport.is_none())
            {
                return;
            }
            st.generation += 1;
            if let Some(retry) = st.retry.take() {
                retry.abort();
            }
            if let Some(watcher) = st.watcher.take() {
                watcher.abort();
            }
            st.connected_since = None;
            st.attempts = 0;
            // Unconditional: a half-registered server must not linger either.
            self.revoke_capabilities(&mut st, &mut outbox);
            self.transition(&mut st, target, None, &mut outbox);
            let transport = st.transport.take();
            drop(st);
            self.publish(outbox);
            transport
        };
        if let Some(transport) = transport {
            transport.close().await;
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(
        &self,
        st: &mut ConnState,
        to: ConnectionState,
        error: Option<String>,
        outbox: &mut Outbox,
    ) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        tracing::debug!(server = %self.name(), %from, %to, "state transition");
        outbox.states.push(StateChange {
            server: self.name().to_string(),
            from,
            to,
            error,
            timestamp: Utc::now(),
        });
    }

    fn publish_capabilities(
        &self,
        st: &mut ConnState,
        capabilities: Vec<CapabilityDescriptor>,
        outbox: &mut Outbox,
    ) -> usize {
        let registry = &self.inner.ctx.registry;
        let count = registry.register_server(self.name(), capabilities);
        st.capabilities = count;
        outbox.capabilities.push(CapabilitiesChanged {
            server: self.name().to_string(),
            count,
            registry_version: registry.snapshot().version(),
            timestamp: Utc::now(),
        });
        count
    }

    fn revoke_capabilities(&self, st: &mut ConnState, outbox: &mut Outbox) {
        let registry = &self.inner.ctx.registry;
        let removed = registry.unregister_server(self.name());
        let had_any = st.capabilities > 0 || removed > 0;
        st.capabilities = 0;
        if had_any {
            outbox.capabilities.push(CapabilitiesChanged {
                server: self.name().to_string(),
                count: 0,
                registry_version: registry.snapshot().version(),
                timestamp: Utc::now(),
            });
        }
    }

    fn publish(&self, outbox: Outbox) {
        let sink = &self.inner.ctx.events;
        for change in outbox.states {
            sink.connection_state_changed(change);
        }
        for change in outbox.capabilities {
            sink.capabilities_changed(change);
        }
    }
}

// ─── Transport Watcher ───────────────────────────────────────────────────────

/// Follow transport events for one connected generation.
///
/// Holds only a weak reference so a forgotten connection can be dropped.
async fn watch(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else { return };
        let conn = Connection { inner };
        match event {
            TransportEvent::Closed { reason } => {
                tracing::warn!(server = %conn.name(), reason = %reason, "transport closed unexpectedly");
                conn.on_transport_lost(generation, reason);
                return;
            }
            TransportEvent::Notification { method, params } => match method.as_str() {
                "notifications/tools/list_changed"
                | "notifications/resources/list_changed"
                | "notifications/prompts/list_changed" => {
                    if let Err(e) = conn.refresh_capabilities().await {
                        tracing::warn!(server = %conn.name(), error = %e, "capability refresh failed");
                    }
                }
                "notifications/message" => {
                    tracing::info!(server = %conn.name(), params = ?params, "server log message");
                }
                other => {
                    tracing::trace!(server = %conn.name(), method = other, "notification ignored");
                }
            },
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

async fn handshake(
    server: &str,
    transport: &Arc<dyn Transport>,
) -> Result<(Advertised, Option<ServerInfo>, Vec<CapabilityDescriptor>), McpError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": { "name": "toolmesh", "version": env!("CARGO_PKG_VERSION") },
    });
    let response = transport
        .request(next_request_id(), "initialize", Some(params))
        .await?;
    let result = extract_result(server, response)?;
    let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
        McpError::connection(server, format!("failed to parse initialize response: {e}"))
    })?;

    if let Some(version) = &init.protocol_version {
        if version != PROTOCOL_VERSION {
            tracing::debug!(server, version = %version, "server negotiated a different protocol version");
        }
    }

    transport.notify("notifications/initialized", None).await?;

    let advertised = Advertised::from_init(&init);
    let capabilities = fetch_capabilities(server, transport, advertised, init.tools).await?;
    Ok((advertised, init.server_info, capabilities))
}

/// Fetch every advertised list, following pagination.
async fn fetch_capabilities(
    server: &str,
    transport: &Arc<dyn Transport>,
    advertised: Advertised,
    inline_tools: Vec<ToolDefinition>,
) -> Result<Vec<CapabilityDescriptor>, McpError> {
    let mut capabilities: Vec<CapabilityDescriptor> = Vec::new();

    if advertised.tools {
        let tools: Vec<ToolDefinition> = if inline_tools.is_empty() {
            list_all(server, transport, "tools/list", "tools").await?
        } else {
            inline_tools
        };
        capabilities.extend(tools.into_iter().map(CapabilityDescriptor::from));
    }
    if advertised.resources {
        let resources: Vec<ResourceDefinition> =
            list_all(server, transport, "resources/list", "resources").await?;
        capabilities.extend(resources.into_iter().map(CapabilityDescriptor::from));
    }
    if advertised.prompts {
        let prompts: Vec<PromptDefinition> =
            list_all(server, transport, "prompts/list", "prompts").await?;
        capabilities.extend(prompts.into_iter().map(CapabilityDescriptor::from));
    }
    Ok(capabilities)
}

async fn list_all<T: serde::de::DeserializeOwned>(
    server: &str,
    transport: &Arc<dyn Transport>,
    method: &str,
    field: &str,
) -> Result<Vec<T>, McpError> {
    let mut items = Vec::new();
    let mut cursor: Option<String> = None;

    for _ in 0..MAX_LIST_PAGES {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let response = transport.request(next_request_id(), method, params).await?;
        let result = match extract_result(server, response) {
            Ok(result) => result,
            // A server that does not implement the list simply has none.
            Err(McpError::Protocol { code, .. })
                if code == super::types::error_codes::METHOD_NOT_FOUND =>
            {
                tracing::debug!(server, method, "list method not implemented");
                return Ok(items);
            }
            Err(e) => return Err(e),
        };

        let page = result.get(field).cloned().unwrap_or_else(|| json!([]));
        let page: Vec<T> = serde_json::from_value(page).map_err(|e| {
            McpError::connection(server, format!("malformed {method} response: {e}"))
        })?;
        items.extend(page);

        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(String::from);
        if cursor.is_none() {
            return Ok(items);
        }
    }

    tracing::warn!(server, method, pages = MAX_LIST_PAGES, "pagination limit reached");
    Ok(items)
}

/// First text block of a tool result, used as the error message.
fn first_text(result: &Value) -> Option<String> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find_map(|block| block.get("text").and_then(Value::as_str))
        .map(String::from)
}

// ─── Cancellation ────────────────────────────────────────────────────────────

/// Tells the backend to stop working on a request we no longer wait for.
///
/// Armed from the moment the request is sent. Disarmed once a response
/// (or a transport failure) arrives; otherwise dropping it sends
/// `notifications/cancelled`.
struct CancelOnDrop {
    server: String,
    transport: Arc<dyn Transport>,
    id: u64,
    armed: bool,
    reason: &'static str,
}

impl CancelOnDrop {
    fn new(server: &str, transport: Arc<dyn Transport>, id: u64) -> Self {
        Self {
            server: server.to_string(),
            transport,
            id,
            armed: true,
            reason: "request abandoned",
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let params = json!({ "requestId": self.id, "reason": self.reason });
        let server = std::mem::take(&mut self.server);
        let id = self.id;
        handle.spawn(async move {
            if let Err(e) = transport.notify("notifications/cancelled", Some(params)).await {
                tracing::debug!(server = %server, id, error = %e, "cancel notification failed");
            }
        });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
