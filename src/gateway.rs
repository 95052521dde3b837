//! Gateway: the public face of the crate.
//!
//! Owns one `Connection` per configured backend, the shared capability
//! registry, the router, and the chain validator/engine. This is the API the
//! outer server layer talks to.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::chain::{ChainEngine, ChainResult, ChainValidator, HardenedChain, RunOptions, ValidationError};
use crate::config::GatewayConfig;
use crate::events::{EventSink, TracingEventSink};
use crate::mcp_client::auth::{CredentialProvider, NoCredentials};
use crate::mcp_client::transport::{DefaultTransportFactory, TransportFactory};
use crate::mcp_client::{
    CallOptions, CapabilityEntry, CapabilityFilter, CapabilityRegistry, Connection, ConnectionContext,
    ConnectionSet, ConnectionState, ConnectionStatus, Lifecycle, McpError, Resolution, Router,
    ServerDescriptor, ToolCallResult,
};

/// Similarity a misspelled tool name needs before `resolve_tool` corrects it.
const MIN_TOOL_SIMILARITY: f64 = 0.8;

/// What `apply_descriptors` changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

pub struct Gateway {
    ctx: ConnectionContext,
    connections: Arc<ConnectionSet>,
    router: Router,
    validator: ChainValidator,
    engine: ChainEngine,
}

impl Gateway {
    /// Build a gateway. Nothing connects until `start_all` or `connect`.
    pub fn new(
        config: GatewayConfig,
        events: Arc<dyn EventSink>,
        credentials: Arc<dyn CredentialProvider>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let ctx = ConnectionContext {
            registry: Arc::clone(&registry),
            events: Arc::clone(&events),
            factory,
            credentials,
            settings: config.connection.clone(),
            lifecycle: Lifecycle::new(),
        };

        let connections = Arc::new(ConnectionSet::new());
        for descriptor in config.descriptors() {
            connections.insert(Connection::new(descriptor, &ctx));
        }

        let router = Router::new(registry, Arc::clone(&connections));
        let engine = ChainEngine::new(Arc::new(router.clone()), events);
        Self {
            ctx,
            connections,
            router,
            validator: ChainValidator::new(config.chain),
            engine,
        }
    }

    /// Gateway with real transports, no credentials and tracing-only events.
    pub fn with_defaults(config: GatewayConfig) -> Self {
        Self::new(
            config,
            Arc::new(TracingEventSink),
            Arc::new(NoCredentials),
            Arc::new(DefaultTransportFactory::new(reqwest::Client::new())),
        )
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.ctx.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every enabled server concurrently.
    ///
    /// Returns the servers that did not reach `Connected` (partial startup
    /// is OK).
    pub async fn start_all(&self) -> Vec<ConnectionStatus> {
        let pending: Vec<Connection> = self
            .connections
            .all()
            .into_iter()
            .filter(|c| c.state() != ConnectionState::Disabled)
            .collect();
        join_all(pending.iter().map(|c| c.connect())).await;

        let failed: Vec<ConnectionStatus> = pending
            .iter()
            .map(Connection::status)
            .filter(|s| s.state != ConnectionState::Connected)
            .collect();
        tracing::info!(
            servers = pending.len(),
            failed = failed.len(),
            capabilities = self.ctx.registry.snapshot().len(),
            "gateway: startup complete"
        );
        failed
    }

    /// Connect one server. Returns the state it ended up in.
    pub async fn connect(&self, server: &str) -> Result<ConnectionState, McpError> {
        let connection = self.connection(server)?;
        connection.connect().await;
        Ok(connection.state())
    }

    /// Switch a server off: transport closed, capabilities gone.
    pub async fn disable(&self, server: &str) -> Result<(), McpError> {
        self.connection(server)?.disable().await;
        tracing::info!(server, "gateway: server disabled");
        Ok(())
    }

    /// Switch a disabled server back on and connect it.
    pub async fn enable(&self, server: &str) -> Result<ConnectionState, McpError> {
        let current = self.connection(server)?;
        if current.state() != ConnectionState::Disabled {
            return self.connect(server).await;
        }
        let mut descriptor = current.descriptor().clone();
        descriptor.enabled = true;
        let fresh = Connection::new(descriptor, &self.ctx);
        self.connections.insert(fresh.clone());
        fresh.connect().await;
        tracing::info!(server, state = %fresh.state(), "gateway: server enabled");
        Ok(fresh.state())
    }

    /// The credential collaborator has fresh credentials for `server`.
    pub async fn on_authorization_granted(&self, server: &str) -> Result<ConnectionState, McpError> {
        let connection = self.connection(server)?;
        if connection.state() == ConnectionState::AuthRequired {
            tracing::info!(server, "gateway: authorization granted, reconnecting");
            connection.connect().await;
        }
        Ok(connection.state())
    }

    /// Reconcile the running set with a new resolved configuration.
    ///
    /// New servers are added and connected, changed ones are rebuilt,
    /// servers missing from `descriptors` are disabled and dropped.
    pub async fn apply_descriptors(&self, descriptors: Vec<ServerDescriptor>) -> Result<ReloadReport, McpError> {
        for descriptor in &descriptors {
            descriptor.validate()?;
        }
        let wanted: BTreeMap<String, ServerDescriptor> =
            descriptors.into_iter().map(|d| (d.name.clone(), d)).collect();
        let mut report = ReloadReport::default();

        for name in self.connections.names() {
            if wanted.contains_key(&name) {
                continue;
            }
            if let Some(old) = self.connections.remove(&name) {
                old.disable().await;
            }
            report.removed.push(name);
        }

        for (name, descriptor) in wanted {
            let existing = self.connections.get(&name);
            match existing {
                Some(old) if *old.descriptor() == descriptor => {
                    report.unchanged.push(name);
                    continue;
                }
                Some(old) => {
                    old.disable().await;
                    report.changed.push(name);
                }
                None => report.added.push(name),
            }
            let fresh = Connection::new(descriptor, &self.ctx);
            self.connections.insert(fresh.clone());
            fresh.connect().await;
        }

        tracing::info!(
            added = report.added.len(),
            changed = report.changed.len(),
            removed = report.removed.len(),
            "gateway: configuration applied"
        );
        Ok(report)
    }

    /// Disable every connection and cancel all background work.
    pub async fn shutdown(&self) {
        let all = self.connections.all();
        join_all(all.iter().map(|c| c.disable())).await;
        self.ctx.lifecycle.shutdown();
        tracing::info!("gateway: shut down");
    }

    pub fn server_statuses(&self) -> Vec<ConnectionStatus> {
        self.connections.all().iter().map(Connection::status).collect()
    }

    // ─── Capabilities ────────────────────────────────────────────────────

    /// Registered capabilities matching `filter`, ordered by namespaced id.
    pub fn list_capabilities(&self, filter: &CapabilityFilter) -> Vec<Arc<CapabilityEntry>> {
        self.ctx.registry.list(filter)
    }

    /// Resolve a possibly unprefixed or misspelled tool name.
    pub fn resolve_tool(&self, name: &str) -> Resolution {
        self.ctx.registry.snapshot().resolve_tool(name, MIN_TOOL_SIMILARITY)
    }

    pub async fn call_tool(&self, id: &str, arguments: Value, opts: CallOptions) -> Result<ToolCallResult, McpError> {
        self.router.call_tool(id, arguments, opts).await
    }

    pub async fn read_resource(&self, id: &str, opts: CallOptions) -> Result<Value, McpError> {
        self.router.read_resource(id, opts).await
    }

    pub async fn get_prompt(&self, id: &str, arguments: Value, opts: CallOptions) -> Result<Value, McpError> {
        self.router.get_prompt(id, arguments, opts).await
    }

    // ─── Chains ──────────────────────────────────────────────────────────

    /// Validate a raw chain document. Nothing runs.
    pub fn validate_chain(&self, raw: &Value) -> Result<HardenedChain, ValidationError> {
        self.validator.validate_value(raw)
    }

    pub async fn execute_chain(&self, chain: &HardenedChain, opts: RunOptions) -> ChainResult {
        self.engine.execute(chain, opts).await
    }

    fn connection(&self, server: &str) -> Result<Connection, McpError> {
        self.connections.get(server).ok_or_else(|| McpError::Config {
            server: server.to_string(),
            reason: "no such server".into(),
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::mcp_client::auth::StaticCredentials;
    use crate::mcp_client::types::TransportConfig;
    use crate::testing::{FakeBackend, FakeTransportFactory, OpenBehavior};
    use serde_json::json;

    fn gateway_with(backends: &[Arc<FakeBackend>]) -> (Gateway, Arc<FakeTransportFactory>) {
        let factory = Arc::new(FakeTransportFactory::new());
        let mut config = GatewayConfig::default();
        for backend in backends {
            factory.add(Arc::clone(backend));
            config.servers.insert(
                backend.name().to_string(),
                ServerDescriptor::local_process(backend.name(), "fake", &[]),
            );
        }
        let gateway = Gateway::new(config, Arc::new(NullEventSink), Arc::new(NoCredentials), factory.clone());
        (gateway, factory)
    }

    #[tokio::test]
    async fn test_start_all_reports_failures() {
        let good = FakeBackend::new("files").with_tools(&["read_file"]);
        let bad = FakeBackend::new("mail").with_tools(&["send"]);
        bad.set_open_behavior(OpenBehavior::Fail("spawn failed".into()));
        let (gateway, _) = gateway_with(&[good, bad]);

        let failed = gateway.start_all().await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].server, "mail");
        assert_eq!(failed[0].state, ConnectionState::Failed);

        let ids: Vec<String> = gateway
            .list_capabilities(&CapabilityFilter::default())
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(ids, vec!["files__read_file"]);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_disable_and_enable_round_trip() {
        let files = FakeBackend::new("files").with_tools(&["read_file"]);
        let (gateway, _) = gateway_with(&[files.clone()]);
        gateway.start_all().await;

        gateway.disable("files").await.unwrap();
        assert!(gateway.list_capabilities(&CapabilityFilter::default()).is_empty());
        let err = gateway
            .call_tool("files__read_file", json!({}), CallOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "routing.not_found");

        assert_eq!(gateway.enable("files").await.unwrap(), ConnectionState::Connected);
        assert_eq!(files.open_count(), 2);
        let result = gateway
            .call_tool("files__read_file", json!({ "path": "/a" }), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.tool, "read_file");
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_server_is_a_config_error() {
        let (gateway, _) = gateway_with(&[]);
        let err = gateway.connect("ghost").await.unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[tokio::test]
    async fn test_apply_descriptors_reconciles() {
        let files = FakeBackend::new("files").with_tools(&["read_file"]);
        let mail = FakeBackend::new("mail").with_tools(&["send"]);
        let notes = FakeBackend::new("notes").with_tools(&["list"]);
        let (gateway, factory) = gateway_with(&[files.clone(), mail]);
        factory.add(notes);
        gateway.start_all().await;

        let files_changed = ServerDescriptor::local_process("files", "fake", &["--v2"]);
        let report = gateway
            .apply_descriptors(vec![files_changed, ServerDescriptor::local_process("notes", "fake", &[])])
            .await
            .unwrap();

        assert_eq!(report.added, vec!["notes"]);
        assert_eq!(report.changed, vec!["files"]);
        assert_eq!(report.removed, vec!["mail"]);
        assert_eq!(files.open_count(), 2);

        let servers: Vec<String> = gateway.server_statuses().into_iter().map(|s| s.server).collect();
        assert_eq!(servers, vec!["files", "notes"]);
        assert!(gateway
            .list_capabilities(&CapabilityFilter::server("mail"))
            .is_empty());
        assert_eq!(gateway.list_capabilities(&CapabilityFilter::default()).len(), 2);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_authorization_granted_reconnects() {
        let api = FakeBackend::new("api").with_tools(&["query"]);
        api.set_open_behavior(OpenBehavior::AuthRequired);
        let factory = Arc::new(FakeTransportFactory::new());
        factory.add(api.clone());
        let mut config = GatewayConfig::default();
        config.servers.insert(
            "api".into(),
            ServerDescriptor {
                name: "api".into(),
                transport: TransportConfig::HttpStream {
                    url: "https://api.example.com/mcp".into(),
                    headers: Default::default(),
                    bearer_auth: true,
                },
                enabled: true,
            },
        );
        let gateway = Gateway::new(
            config,
            Arc::new(NullEventSink),
            Arc::new(StaticCredentials::new().with_token("api", "token-1")),
            factory.clone(),
        );

        assert_eq!(gateway.connect("api").await.unwrap(), ConnectionState::AuthRequired);
        api.set_open_behavior(OpenBehavior::Succeed);
        assert_eq!(
            gateway.on_authorization_granted("api").await.unwrap(),
            ConnectionState::Connected
        );
        assert_eq!(factory.last_credential("api").as_deref(), Some("token-1"));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_resolve_tool_through_gateway() {
        let files = FakeBackend::new("files").with_tools(&["read_file"]);
        let (gateway, _) = gateway_with(&[files]);
        gateway.start_all().await;
        assert_eq!(gateway.resolve_tool("read_file").resolved_id(), Some("files__read_file"));
        assert!(gateway.resolve_tool("nothing_like_it").resolved_id().is_none());
        gateway.shutdown().await;
    }
}
