//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the server
//! descriptors handed to connections.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::errors::McpError;

/// Protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Separator between server name and original capability name.
pub const NAMESPACE_DELIMITER: &str = "__";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Any message a backend may send us, before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// A classified inbound message.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Answer to one of our requests.
    Response(JsonRpcResponse),
    /// Server-initiated notification.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// Server-initiated request (e.g. `ping`).
    Request {
        id: serde_json::Value,
        method: String,
    },
}

impl RawMessage {
    /// Classify the message; `None` for anything that is not valid JSON-RPC
    /// as far as we are concerned (e.g. a response with a non-numeric id).
    pub fn classify(self) -> Option<Incoming> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => Some(Incoming::Request { id, method }),
            (None, Some(method)) => Some(Incoming::Notification {
                method,
                params: self.params,
            }),
            (Some(id), None) => id.as_u64().map(|id| {
                Incoming::Response(JsonRpcResponse {
                    id,
                    result: self.result,
                    error: self.error,
                })
            }),
            (None, None) => None,
        }
    }
}

/// Parse one serialized message and classify it.
pub fn parse_incoming(text: &str) -> Option<Incoming> {
    serde_json::from_str::<RawMessage>(text)
        .ok()
        .and_then(RawMessage::classify)
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(server: &str, response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Protocol {
            server: server.to_string(),
            code: err.code,
            message: err.message,
        });
    }

    response.result.ok_or(McpError::Protocol {
        server: server.to_string(),
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
    })
}

// ─── Server Descriptors ─────────────────────────────────────────────────────

/// Which physical channel a backend is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    LocalProcess,
    HttpStream,
    PushStream,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::LocalProcess => "local-process",
            Self::HttpStream => "http-stream",
            Self::PushStream => "push-stream",
        };
        f.write_str(label)
    }
}

/// Transport-specific connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    /// Spawn a process and exchange newline-delimited JSON over its stdio.
    LocalProcess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    /// POST requests, optional server push over a long-lived GET.
    HttpStream {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, alias = "bearerAuth")]
        bearer_auth: bool,
    },
    /// Pure server-to-client event stream with a POST side channel.
    PushStream {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default, alias = "bearerAuth")]
        bearer_auth: bool,
    },
}

impl TransportConfig {
    /// The kind of transport these parameters describe.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::LocalProcess { .. } => TransportKind::LocalProcess,
            Self::HttpStream { .. } => TransportKind::HttpStream,
            Self::PushStream { .. } => TransportKind::PushStream,
        }
    }

    /// Whether the transport needs a bearer credential.
    pub fn requires_credential(&self) -> bool {
        match self {
            Self::LocalProcess { .. } => false,
            Self::HttpStream { bearer_auth, .. } | Self::PushStream { bearer_auth, .. } => {
                *bearer_auth
            }
        }
    }
}

/// Immutable description of one backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique server name; filled from the config map key when omitted.
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Longest accepted server name.
const MAX_SERVER_NAME_LEN: usize = 64;

impl ServerDescriptor {
    /// Build an enabled local-process descriptor.
    pub fn local_process(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: TransportConfig::LocalProcess {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: HashMap::new(),
                cwd: None,
            },
            enabled: true,
        }
    }

    /// Kind of transport used by this server.
    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Reject descriptors that cannot produce a working connection.
    pub fn validate(&self) -> Result<(), McpError> {
        let fail = |reason: String| McpError::Config {
            server: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(fail("server name is empty".into()));
        }
        if self.name.len() > MAX_SERVER_NAME_LEN {
            return Err(fail(format!(
                "server name longer than {MAX_SERVER_NAME_LEN} characters"
            )));
        }
        let first_ok = self
            .name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric());
        let chars_ok = self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !first_ok || !chars_ok {
            return Err(fail(format!("invalid server name '{}'", self.name)));
        }
        if self.name.contains(NAMESPACE_DELIMITER) {
            return Err(fail(format!(
                "server name must not contain '{NAMESPACE_DELIMITER}'"
            )));
        }

        match &self.transport {
            TransportConfig::LocalProcess { command, .. } => {
                if command.trim().is_empty() {
                    return Err(fail("local-process transport needs a command".into()));
                }
            }
            TransportConfig::HttpStream { url, .. } | TransportConfig::PushStream { url, .. } => {
                let parsed = reqwest::Url::parse(url)
                    .map_err(|e| fail(format!("invalid url '{url}': {e}")))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(fail(format!("unsupported url scheme '{}'", parsed.scheme())));
                }
            }
        }

        Ok(())
    }
}

// ─── MCP Protocol Types ─────────────────────────────────────────────────────

/// Tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub category: Option<String>,
}

/// Resource definition as returned by `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
}

/// Prompt definition as returned by `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One declared prompt argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    /// Some servers return their tools inline instead of via `tools/list`.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

impl InitializeResult {
    /// Whether the server advertised a capability family (`tools`, `resources`, `prompts`).
    pub fn advertises(&self, family: &str) -> bool {
        self.capabilities.get(family).is_some_and(|v| !v.is_null())
    }
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// What kind of thing a capability entry stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Tool,
    Resource,
    Prompt,
}

/// One capability as published by a server, before namespacing.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityDescriptor {
    pub kind: CapabilityKind,
    /// Tool name, prompt name, or resource URI.
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    pub category: Option<String>,
}

impl CapabilityDescriptor {
    /// A tool with no description and an open object schema.
    pub fn tool(name: &str) -> Self {
        Self {
            kind: CapabilityKind::Tool,
            name: name.to_string(),
            description: String::new(),
            input_schema: serde_json::json!({ "type": "object" }),
            category: None,
        }
    }
}

impl From<ToolDefinition> for CapabilityDescriptor {
    fn from(tool: ToolDefinition) -> Self {
        Self {
            kind: CapabilityKind::Tool,
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
            category: tool.category,
        }
    }
}

impl From<ResourceDefinition> for CapabilityDescriptor {
    fn from(resource: ResourceDefinition) -> Self {
        Self {
            kind: CapabilityKind::Resource,
            description: resource
                .description
                .or(resource.name)
                .unwrap_or_default(),
            name: resource.uri,
            input_schema: serde_json::Value::Null,
            category: resource.mime_type,
        }
    }
}

impl From<PromptDefinition> for CapabilityDescriptor {
    fn from(prompt: PromptDefinition) -> Self {
        let properties: serde_json::Map<String, serde_json::Value> = prompt
            .arguments
            .iter()
            .map(|a| (a.name.clone(), serde_json::json!({"type": "string"})))
            .collect();
        let required: Vec<&str> = prompt
            .arguments
            .iter()
            .filter(|a| a.required)
            .map(|a| a.name.as_str())
            .collect();
        Self {
            kind: CapabilityKind::Prompt,
            name: prompt.name,
            description: prompt.description.unwrap_or_default(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
            category: None,
        }
    }
}

/// Result of a successful tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub server: String,
    pub tool: String,
    /// The `content` array returned by the backend.
    pub content: serde_json::Value,
    /// Optional `structuredContent` returned by the backend.
    pub structured: Option<serde_json::Value>,
    pub execution_time_ms: u64,
}

impl ToolCallResult {
    /// The most useful payload: structured content if present, else raw content.
    pub fn payload(&self) -> serde_json::Value {
        self.structured
            .clone()
            .unwrap_or_else(|| self.content.clone())
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the connection's default call timeout.
    pub timeout: Option<Duration>,
    /// Cancelling this token abandons the call and notifies the backend.
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    /// Options with only a timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }
}

// ─── Standard MCP Error Codes ───────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_classify_response_notification_and_request() {
        match parse_incoming(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#) {
            Some(Incoming::Response(resp)) => assert_eq!(resp.id, 7),
            other => panic!("expected response, got {other:?}"),
        }
        match parse_incoming(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#) {
            Some(Incoming::Notification { method, .. }) => {
                assert_eq!(method, "notifications/tools/list_changed")
            }
            other => panic!("expected notification, got {other:?}"),
        }
        assert!(matches!(
            parse_incoming(r#"{"jsonrpc":"2.0","id":"a","method":"ping"}"#),
            Some(Incoming::Request { .. })
        ));
        assert!(parse_incoming("not json").is_none());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            id: 1,
            result: None,
            error: Some(JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result("fs", resp).unwrap_err() {
            McpError::Protocol { code, .. } => assert_eq!(code, error_codes::METHOD_NOT_FOUND),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_deserializes_flattened_transport() {
        let yaml = r#"
transport: http-stream
url: "https://mcp.example.com/mcp"
bearer_auth: true
"#;
        let desc: ServerDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.kind(), TransportKind::HttpStream);
        assert!(desc.enabled);
        assert!(desc.transport.requires_credential());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(ServerDescriptor::local_process("files", "npx", &["srv"])
            .validate()
            .is_ok());
        assert!(ServerDescriptor::local_process("bad__name", "npx", &[])
            .validate()
            .is_err());
        assert!(ServerDescriptor::local_process("files", " ", &[])
            .validate()
            .is_err());

        let desc = ServerDescriptor {
            name: "remote".into(),
            transport: TransportConfig::PushStream {
                url: "ftp://example.com".into(),
                headers: HashMap::new(),
                bearer_auth: false,
            },
            enabled: true,
        };
        assert!(matches!(desc.validate(), Err(McpError::Config { .. })));
    }

    #[test]
    fn test_prompt_descriptor_schema() {
        let prompt = PromptDefinition {
            name: "summarize".into(),
            description: None,
            arguments: vec![PromptArgument {
                name: "text".into(),
                description: None,
                required: true,
            }],
        };
        let cap = CapabilityDescriptor::from(prompt);
        assert_eq!(cap.kind, CapabilityKind::Prompt);
        assert_eq!(cap.input_schema["required"][0], "text");
    }
}
