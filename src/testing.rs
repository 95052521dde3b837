//! In-memory backends for exercising the gateway without processes or
//! sockets.
//!
//! A [`FakeBackend`] answers the protocol methods a connection uses
//! (`initialize`, the three list methods with cursor pagination,
//! `tools/call`, `resources/read`, `prompts/get`). It records what it
//! receives and can be told to fail opens, drop the connection or announce
//! list changes. [`FakeTransportFactory`] hands out transports by server
//! name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::transport::{OpenedTransport, Transport, TransportEvent, TransportFactory};
use crate::mcp_client::types::{
    error_codes, JsonRpcError, JsonRpcResponse, ServerDescriptor, PROTOCOL_VERSION,
};

type CallHandler = Arc<dyn Fn(&str, &Value) -> Result<Value, JsonRpcError> + Send + Sync>;

/// What the next `open` does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenBehavior {
    Succeed,
    AuthRequired,
    Fail(String),
}

/// Scripted backend server.
pub struct FakeBackend {
    name: String,
    tools: Mutex<Vec<String>>,
    resources: Mutex<Vec<String>>,
    prompts: Mutex<Vec<String>>,
    page_size: Mutex<Option<usize>>,
    handler: Mutex<Option<CallHandler>>,
    call_delay: Mutex<Duration>,
    open_delay: Mutex<Duration>,
    open_behavior: Mutex<OpenBehavior>,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    calls: Mutex<Vec<(String, Value)>>,
    notifications: Mutex<Vec<(String, Value)>>,
    opens: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closed: AtomicBool,
}

impl FakeBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            tools: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            page_size: Mutex::new(None),
            handler: Mutex::new(None),
            call_delay: Mutex::new(Duration::ZERO),
            open_delay: Mutex::new(Duration::ZERO),
            open_behavior: Mutex::new(OpenBehavior::Succeed),
            events: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            opens: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Builder form of [`FakeBackend::set_tools`].
    pub fn with_tools(self: Arc<Self>, tools: &[&str]) -> Arc<Self> {
        self.set_tools(tools);
        self
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *lock(&self.tools) = tools.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_resources(&self, uris: &[&str]) {
        *lock(&self.resources) = uris.iter().map(|t| t.to_string()).collect();
    }

    pub fn set_prompts(&self, prompts: &[&str]) {
        *lock(&self.prompts) = prompts.iter().map(|t| t.to_string()).collect();
    }

    /// Split list responses into pages of `size` with `nextCursor`.
    pub fn set_page_size(&self, size: usize) {
        *lock(&self.page_size) = Some(size.max(1));
    }

    /// Answer `tools/call` with `handler(tool, arguments)`. Without a handler
    /// every call succeeds with a text block naming the tool.
    pub fn on_call<F>(&self, handler: F)
    where
        F: Fn(&str, &Value) -> Result<Value, JsonRpcError> + Send + Sync + 'static,
    {
        *lock(&self.handler) = Some(Arc::new(handler));
    }

    pub fn set_call_delay(&self, delay: Duration) {
        *lock(&self.call_delay) = delay;
    }

    /// Hold every open for `delay` before answering.
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.open_delay) = delay;
    }

    pub fn set_open_behavior(&self, behavior: OpenBehavior) {
        *lock(&self.open_behavior) = behavior;
    }

    /// Simulate the backend going away.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(tx) = lock(&self.events).take() {
            let _ = tx.send(TransportEvent::Closed {
                reason: reason.to_string(),
            });
        }
    }

    /// Announce that the tool list changed.
    pub fn notify_list_changed(&self) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(TransportEvent::Notification {
                method: "notifications/tools/list_changed".into(),
                params: None,
            });
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every `tools/call` received, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, tool: &str) -> usize {
        lock(&self.calls).iter().filter(|(t, _)| t == tool).count()
    }

    /// Highest number of `tools/call` requests observed in progress at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Params of received notifications with this method.
    pub fn notifications(&self, method: &str) -> Vec<Value> {
        lock(&self.notifications)
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn list_page(&self, items: Vec<Value>, field: &str, params: &Option<Value>) -> Value {
        let start = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let size = lock(&self.page_size).unwrap_or(usize::MAX);
        let end = start.saturating_add(size).min(items.len());
        let page: Vec<Value> = items.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();
        let mut result = json!({ field: page });
        if end < items.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        result
    }

    async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => {
                let mut capabilities = json!({ "tools": {} });
                if !lock(&self.resources).is_empty() {
                    capabilities["resources"] = json!({});
                }
                if !lock(&self.prompts).is_empty() {
                    capabilities["prompts"] = json!({});
                }
                Ok(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": capabilities,
                    "serverInfo": { "name": self.name, "version": "0.0.0" },
                }))
            }
            "tools/list" => {
                let tools = lock(&self.tools)
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t,
                            "description": format!("{t} on {}", self.name),
                            "inputSchema": { "type": "object" },
                        })
                    })
                    .collect();
                Ok(self.list_page(tools, "tools", &params))
            }
            "resources/list" => {
                let resources = lock(&self.resources)
                    .iter()
                    .map(|uri| json!({ "uri": uri, "name": uri }))
                    .collect();
                Ok(self.list_page(resources, "resources", &params))
            }
            "prompts/list" => {
                let prompts = lock(&self.prompts)
                    .iter()
                    .map(|p| json!({ "name": p, "arguments": [{ "name": "text", "required": true }] }))
                    .collect();
                Ok(self.list_page(prompts, "prompts", &params))
            }
            "tools/call" => {
                let params = params.unwrap_or(Value::Null);
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                lock(&self.calls).push((tool.clone(), arguments.clone()));

                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                let _in_flight = InFlight(&self.in_flight);

                let delay = *lock(&self.call_delay);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let handler = lock(&self.handler).clone();
                match handler {
                    Some(handler) => handler(&tool, &arguments),
                    None => Ok(json!({ "content": [{ "type": "text", "text": format!("{tool} ok") }] })),
                }
            }
            "resources/read" => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(json!({ "contents": [{ "uri": uri, "text": "contents" }] }))
            }
            "prompts/get" => Ok(json!({
                "messages": [{ "role": "user", "content": { "type": "text", "text": params } }]
            })),
            "ping" => Ok(json!({})),
            other => Err(JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("method '{other}' not found"),
                data: None,
            }),
        }
    }
}

/// Decrements the in-flight counter however the call ends.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Transport bound to one open of a [`FakeBackend`].
struct FakeTransport {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, id: u64, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, McpError> {
        match self.backend.handle(method, params).await {
            Ok(result) => Ok(JsonRpcResponse {
                id,
                result: Some(result),
                error: None,
            }),
            Err(error) => Ok(JsonRpcResponse {
                id,
                result: None,
                error: Some(error),
            }),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        lock(&self.backend.notifications).push((method.to_string(), params.unwrap_or(Value::Null)));
        Ok(())
    }

    async fn close(&self) {
        self.backend.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory resolving descriptors to registered fake backends by name.
#[derive(Default)]
pub struct FakeTransportFactory {
    backends: Mutex<HashMap<String, Arc<FakeBackend>>>,
    credentials: Mutex<HashMap<String, Option<String>>>,
}

impl FakeTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, backend: Arc<FakeBackend>) {
        lock(&self.backends).insert(backend.name.clone(), backend);
    }

    pub fn backend(&self, name: &str) -> Option<Arc<FakeBackend>> {
        lock(&self.backends).get(name).cloned()
    }

    /// Credential passed to the most recent open of `server`.
    pub fn last_credential(&self, server: &str) -> Option<String> {
        lock(&self.credentials).get(server).cloned().flatten()
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn open(&self, descriptor: &ServerDescriptor, credential: Option<String>) -> Result<OpenedTransport, McpError> {
        lock(&self.credentials).insert(descriptor.name.clone(), credential);
        let backend = self
            .backend(&descriptor.name)
            .ok_or_else(|| McpError::connection(&descriptor.name, "no such backend"))?;
        backend.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *lock(&backend.open_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let behavior = lock(&backend.open_behavior).clone();
        match behavior {
            OpenBehavior::Succeed => {}
            OpenBehavior::AuthRequired => {
                return Err(McpError::AuthRequired {
                    server: descriptor.name.clone(),
                    reason: "HTTP 401 Unauthorized".into(),
                })
            }
            OpenBehavior::Fail(reason) => return Err(McpError::connection(&descriptor.name, reason)),
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&backend.events) = Some(tx);
        backend.closed.store(false, Ordering::SeqCst);
        Ok(OpenedTransport {
            transport: Arc::new(FakeTransport { backend }),
            events: rx,
        })
    }
}
