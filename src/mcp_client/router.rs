//! Call routing by namespaced capability id.
//!
//! The router never caches connections: every call resolves the id against
//! the current registry snapshot and checks the owner's live state, so a
//! server that dropped a moment ago is reported as unavailable instead of
//! receiving the call.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::connection::Connection;
use super::errors::McpError;
use super::lifecycle::ConnectionState;
use super::registry::{namespaced_id, CapabilityEntry, CapabilityRegistry};
use super::types::{CallOptions, CapabilityKind, ToolCallResult};

/// Suggestions attached to a `NotFound`.
const MAX_SUGGESTIONS: usize = 3;

// ─── Connection Set ──────────────────────────────────────────────────────────

/// Live connections keyed by server name.
#[derive(Default)]
pub struct ConnectionSet {
    connections: RwLock<BTreeMap<String, Connection>>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, server: &str) -> Option<Connection> {
        self.read().get(server).cloned()
    }

    /// Insert a connection, returning the one it replaces.
    pub fn insert(&self, connection: Connection) -> Option<Connection> {
        let mut map = match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(connection.name().to_string(), connection)
    }

    pub fn remove(&self, server: &str) -> Option<Connection> {
        let mut map = match self.connections.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(server)
    }

    /// All connections in name order.
    pub fn all(&self) -> Vec<Connection> {
        self.read().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Connection>> {
        match self.connections.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ─── Dispatch Seam ───────────────────────────────────────────────────────────

/// What the chain engine needs from the outside world: call one tool on one
/// server.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        opts: CallOptions,
    ) -> Result<ToolCallResult, McpError>;
}

// ─── Router ──────────────────────────────────────────────────────────────────

/// A resolved capability and the connection that serves it.
#[derive(Clone)]
pub struct Route {
    pub entry: Arc<CapabilityEntry>,
    pub connection: Connection,
}

/// Resolves namespaced ids to live connections and forwards calls.
#[derive(Clone)]
pub struct Router {
    registry: Arc<CapabilityRegistry>,
    connections: Arc<ConnectionSet>,
}

impl Router {
    pub fn new(registry: Arc<CapabilityRegistry>, connections: Arc<ConnectionSet>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Resolve `id` to its entry and a connected owner.
    ///
    /// `NotFound` (with near-miss suggestions) when the id is not
    /// registered; `ServerUnavailable` when the owner is gone or not
    /// `Connected`.
    pub fn route(&self, id: &str) -> Result<Route, McpError> {
        let snapshot = self.registry.snapshot();
        let Some(entry) = snapshot.get(id).cloned() else {
            return Err(McpError::NotFound {
                id: id.to_string(),
                suggestions: snapshot.find_similar(id, MAX_SUGGESTIONS),
            });
        };

        let Some(connection) = self.connections.get(&entry.server) else {
            return Err(McpError::ServerUnavailable {
                server: entry.server.clone(),
                state: "unknown".into(),
            });
        };

        let state = connection.state();
        if state != ConnectionState::Connected {
            return Err(McpError::ServerUnavailable {
                server: entry.server.clone(),
                state: state.to_string(),
            });
        }

        Ok(Route { entry, connection })
    }

    /// Call a tool by namespaced id. Successful calls count as usage.
    pub async fn call_tool(&self, id: &str, arguments: Value, opts: CallOptions) -> Result<ToolCallResult, McpError> {
        let route = self.route_kind(id, CapabilityKind::Tool)?;
        tracing::debug!(id, server = %route.entry.server, "routing tool call");
        let result = route
            .connection
            .call_tool(&route.entry.original_name, arguments, opts)
            .await?;
        self.registry.record_usage(&route.entry.id);
        Ok(result)
    }

    /// Read a resource by namespaced id.
    pub async fn read_resource(&self, id: &str, opts: CallOptions) -> Result<Value, McpError> {
        let route = self.route_kind(id, CapabilityKind::Resource)?;
        let contents = route.connection.read_resource(&route.entry.original_name, opts).await?;
        self.registry.record_usage(&route.entry.id);
        Ok(contents)
    }

    /// Render a prompt by namespaced id.
    pub async fn get_prompt(&self, id: &str, arguments: Value, opts: CallOptions) -> Result<Value, McpError> {
        let route = self.route_kind(id, CapabilityKind::Prompt)?;
        let prompt = route
            .connection
            .get_prompt(&route.entry.original_name, arguments, opts)
            .await?;
        self.registry.record_usage(&route.entry.id);
        Ok(prompt)
    }

    /// Like `route`, but an entry of another kind counts as not found.
    fn route_kind(&self, id: &str, kind: CapabilityKind) -> Result<Route, McpError> {
        let route = self.route(id)?;
        if route.entry.kind != kind {
            return Err(McpError::NotFound {
                id: id.to_string(),
                suggestions: Vec::new(),
            });
        }
        Ok(route)
    }
}

#[async_trait]
impl ToolDispatch for Router {
    async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        opts: CallOptions,
    ) -> Result<ToolCallResult, McpError> {
        self.call_tool(&namespaced_id(server, tool), arguments, opts).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
