//! Connection lifecycle, registry and routing through the public gateway API.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use toolmesh::mcp_client::auth::NoCredentials;
use toolmesh::mcp_client::types::CapabilityDescriptor;
use toolmesh::mcp_client::CapabilityRegistry;
use toolmesh::testing::{FakeBackend, FakeTransportFactory};
use toolmesh::{
    CallOptions, CapabilityFilter, ChannelEventSink, ConnectionState, Gateway, GatewayConfig, GatewayEvent,
    McpError, ServerDescriptor,
};

fn gateway(backends: &[Arc<FakeBackend>]) -> (Gateway, UnboundedReceiver<GatewayEvent>) {
    let factory = Arc::new(FakeTransportFactory::new());
    let mut config = GatewayConfig::default();
    // Keep automatic reconnects out of the way.
    config.connection.reconnect_base_delay_ms = 60_000;
    for backend in backends {
        factory.add(Arc::clone(backend));
        config.servers.insert(
            backend.name().to_string(),
            ServerDescriptor::local_process(backend.name(), "fake-server", &[]),
        );
    }
    let (sink, rx) = ChannelEventSink::new();
    let gateway = Gateway::new(config, Arc::new(sink), Arc::new(NoCredentials), factory);
    (gateway, rx)
}

#[tokio::test]
async fn identical_tool_names_get_distinct_ids() {
    let files = FakeBackend::new("files").with_tools(&["search", "read"]);
    let web = FakeBackend::new("web").with_tools(&["search", "fetch"]);
    let (gateway, _rx) = gateway(&[files, web]);
    assert!(gateway.start_all().await.is_empty());

    let entries = gateway.list_capabilities(&CapabilityFilter::default());
    let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["files__read", "files__search", "web__fetch", "web__search"]);
    let unique: HashSet<&str> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(gateway.registry().snapshot().is_consistent());

    gateway.shutdown().await;
}

#[test]
fn unregister_leaves_no_dangling_entries() {
    let registry = CapabilityRegistry::new();
    registry.register_server(
        "a",
        vec![CapabilityDescriptor::tool("search"), CapabilityDescriptor::tool("open")],
    );
    registry.register_server("b", vec![CapabilityDescriptor::tool("search")]);

    assert_eq!(registry.unregister_server("a"), 2);

    let snapshot = registry.snapshot();
    assert!(snapshot.for_server("a").is_empty());
    assert!(registry.list(&CapabilityFilter::server("a")).is_empty());
    assert_eq!(snapshot.by_original_name("search").len(), 1);
    assert!(snapshot.is_consistent());
}

#[tokio::test]
async fn abrupt_close_removes_capabilities_before_failed_is_observable() {
    let files = FakeBackend::new("files").with_tools(&["read"]);
    let (gateway, mut rx) = gateway(&[files.clone()]);
    gateway.start_all().await;
    assert_eq!(gateway.list_capabilities(&CapabilityFilter::server("files")).len(), 1);

    files.drop_connection("process exited");

    let failed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let GatewayEvent::ConnectionState(change) = event {
                if change.to == ConnectionState::Failed {
                    return change;
                }
            }
        }
        panic!("event stream closed");
    })
    .await
    .expect("no Failed transition");

    assert_eq!(failed.from, ConnectionState::Connected);
    assert!(gateway.list_capabilities(&CapabilityFilter::server("files")).is_empty());
    let status = &gateway.server_statuses()[0];
    assert_eq!(status.state, ConnectionState::Failed);
    assert!(status.last_error.as_deref().unwrap_or_default().contains("process exited"));

    gateway.shutdown().await;
}

#[tokio::test]
async fn route_unknown_id_is_not_found_with_suggestions() {
    let files = FakeBackend::new("files").with_tools(&["read_file"]);
    let (gateway, _rx) = gateway(&[files]);
    gateway.start_all().await;

    match gateway.router().route("ghost__tool") {
        Err(McpError::NotFound { id, .. }) => assert_eq!(id, "ghost__tool"),
        other => panic!("expected NotFound, got {:?}", other.map(|r| r.entry.id.clone())),
    }
    match gateway.router().route("files__read_fil") {
        Err(McpError::NotFound { suggestions, .. }) => assert_eq!(suggestions, vec!["files__read_file"]),
        other => panic!("expected NotFound, got {:?}", other.map(|r| r.entry.id.clone())),
    }
    gateway.shutdown().await;
}

#[tokio::test]
async fn route_while_connecting_is_server_unavailable() {
    let real = FakeBackend::new("realserver").with_tools(&["tool"]);
    real.set_open_delay(Duration::from_secs(3600));
    let (gateway, _rx) = gateway(&[real]);
    let gateway = Arc::new(gateway);

    gateway
        .registry()
        .register_server("realserver", vec![CapabilityDescriptor::tool("tool")]);
    let connecting = tokio::spawn({
        let gateway = Arc::clone(&gateway);
        async move {
            let _ = gateway.connect("realserver").await;
        }
    });
    while gateway.server_statuses()[0].state != ConnectionState::Connecting {
        tokio::task::yield_now().await;
    }

    let err = gateway
        .call_tool("realserver__tool", json!({}), CallOptions::default())
        .await
        .unwrap_err();
    match err {
        McpError::ServerUnavailable { server, state } => {
            assert_eq!(server, "realserver");
            assert_eq!(state, "connecting");
        }
        other => panic!("expected ServerUnavailable, got {other}"),
    }
    connecting.abort();
}

#[tokio::test]
async fn list_changed_notification_refreshes_registry() {
    let files = FakeBackend::new("files").with_tools(&["read"]);
    let (gateway, mut rx) = gateway(&[files.clone()]);
    gateway.start_all().await;
    while rx.try_recv().is_ok() {}

    files.set_tools(&["read", "write"]);
    files.notify_list_changed();

    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let GatewayEvent::Capabilities(change) = event {
                if change.server == "files" && change.count == 2 {
                    return;
                }
            }
        }
    })
    .await
    .expect("no capabilities event");

    let ids: Vec<String> = gateway
        .list_capabilities(&CapabilityFilter::server("files"))
        .iter()
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(ids, vec!["files__read", "files__write"]);
    gateway.shutdown().await;
}
