//! Chains validated and executed through the gateway against fake backends.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use toolmesh::chain::{ChainStatus, RiskLevel, StepStatus, ValidationPhase};
use toolmesh::mcp_client::auth::NoCredentials;
use toolmesh::mcp_client::types::JsonRpcError;
use toolmesh::testing::{FakeBackend, FakeTransportFactory};
use toolmesh::{Gateway, GatewayConfig, NullEventSink, RunOptions, ServerDescriptor};

async fn started(backends: &[Arc<FakeBackend>]) -> Gateway {
    let factory = Arc::new(FakeTransportFactory::new());
    let mut config = GatewayConfig::default();
    for backend in backends {
        factory.add(Arc::clone(backend));
        config.servers.insert(
            backend.name().to_string(),
            ServerDescriptor::local_process(backend.name(), "fake-server", &[]),
        );
    }
    let gateway = Gateway::new(config, Arc::new(NullEventSink), Arc::new(NoCredentials), factory);
    assert!(gateway.start_all().await.is_empty());
    gateway
}

#[tokio::test]
async fn write_gating_scenario() {
    let gateway = started(&[]).await;
    let mut raw = json!({
        "steps": [
            { "server": "files", "tool": "read_file" },
            { "server": "files", "tool": "delete_file" }
        ]
    });

    let err = gateway.validate_chain(&raw).unwrap_err();
    assert_eq!(err.phase, ValidationPhase::BusinessRules);
    assert!(err.violations.iter().any(|v| v.contains("delete_file")));

    raw["options"] = json!({ "approved": true });
    let hardened = gateway.validate_chain(&raw).unwrap();
    assert_eq!(hardened.risk_level(), RiskLevel::High);
    assert_eq!(hardened.security().write_operations, vec!["delete_file"]);
}

#[tokio::test]
async fn step_count_ceiling() {
    let gateway = started(&[]).await;
    let chain = |n: usize| json!({ "steps": vec![json!({ "server": "files", "tool": "read_file" }); n] });

    let err = gateway.validate_chain(&chain(51)).unwrap_err();
    assert_eq!(err.code(), "validation.structural.too_many_steps");
    assert!(gateway.validate_chain(&chain(50)).is_ok());
}

#[tokio::test]
async fn results_flow_between_steps() {
    let files = FakeBackend::new("files").with_tools(&["read_file"]);
    files.on_call(|_, args| {
        Ok(json!({
            "content": [{ "type": "text", "text": "{\"title\": \"Q3 notes\", \"lines\": 42}" }],
            "structuredContent": { "path": args["path"], "size": 42 }
        }))
    });
    let docs = FakeBackend::new("docs").with_tools(&["summarize"]);
    let gateway = started(&[files, docs.clone()]).await;

    let raw = json!({
        "variables": { "root": "/srv/notes" },
        "steps": [
            {
                "id": "read",
                "server": "files",
                "tool": "read_file",
                "transformations": [
                    { "type": "template", "template": "{{vars.root}}/q3.md", "output": "args.path" }
                ]
            },
            {
                "id": "summary",
                "server": "docs",
                "tool": "summarize",
                "condition": "steps.read.status == 'succeeded' && steps.read.result.size > 10",
                "input_mapping": { "path": "steps.read.result.path", "missing": "steps.read.result.nope" }
            }
        ]
    });
    let hardened = gateway.validate_chain(&raw).unwrap();
    let result = gateway.execute_chain(&hardened, RunOptions::default()).await;

    assert_eq!(result.status, ChainStatus::Succeeded);
    let calls = docs.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, json!({ "path": "/srv/notes/q3.md", "missing": null }));
    assert_eq!(result.step("read").unwrap().result.as_ref().unwrap()["size"], 42);
}

#[tokio::test]
async fn parallel_group_never_exceeds_bound() {
    let files = FakeBackend::new("files").with_tools(&["read_file"]);
    files.set_call_delay(Duration::from_millis(40));
    let gateway = started(&[files.clone()]).await;

    let steps: Vec<Value> = (0..10)
        .map(|i| {
            json!({
                "id": format!("read-{i}"),
                "server": "files",
                "tool": "read_file",
                "arguments": { "path": format!("/tmp/{i}") },
                "parallel_group": "fanout"
            })
        })
        .collect();
    let raw = json!({ "steps": steps, "options": { "max_parallel": 3 } });
    let hardened = gateway.validate_chain(&raw).unwrap();

    let result = gateway.execute_chain(&hardened, RunOptions::default()).await;
    assert_eq!(result.status, ChainStatus::Succeeded);
    assert_eq!(files.call_count("read_file"), 10);
    assert!(files.max_concurrent_calls() <= 3);
    assert!(files.max_concurrent_calls() >= 2);
}

#[tokio::test]
async fn failing_step_is_retried_with_backoff() {
    let flaky = FakeBackend::new("flaky").with_tools(&["fetch"]);
    let seen: Arc<Mutex<Vec<Instant>>> = Arc::default();
    let record = Arc::clone(&seen);
    flaky.on_call(move |_, _| {
        record.lock().unwrap().push(Instant::now());
        Err(JsonRpcError {
            code: -32000,
            message: "upstream unavailable".into(),
            data: None,
        })
    });
    let gateway = started(&[flaky.clone()]).await;

    let raw = json!({
        "steps": [{
            "id": "fetch",
            "server": "flaky",
            "tool": "fetch",
            "retry": { "max_attempts": 3, "delay_ms": 100, "backoff": 2.0 }
        }]
    });
    let hardened = gateway.validate_chain(&raw).unwrap();
    let result = gateway.execute_chain(&hardened, RunOptions::default()).await;

    let step = result.step("fetch").unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 3);
    assert_eq!(step.error.as_ref().unwrap().code, "tool_error");
    assert_eq!(result.status, ChainStatus::Failed);

    let times = seen.lock().unwrap().clone();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] >= Duration::from_millis(100));
    assert!(times[2] - times[1] >= Duration::from_millis(200));
}

#[tokio::test]
async fn unavailable_server_fails_its_step_only() {
    let files = FakeBackend::new("files").with_tools(&["read_file"]);
    let gateway = started(&[files]).await;

    let raw = json!({
        "steps": [
            { "id": "a", "server": "files", "tool": "read_file" },
            { "id": "b", "server": "ghost", "tool": "read_file" }
        ]
    });
    let hardened = gateway.validate_chain(&raw).unwrap();
    let result = gateway.execute_chain(&hardened, RunOptions::default()).await;

    assert_eq!(result.status, ChainStatus::Partial);
    assert_eq!(result.step("b").unwrap().error.as_ref().unwrap().code, "routing.not_found");
    assert_eq!(result.validation_id, hardened.validation_id());
}
