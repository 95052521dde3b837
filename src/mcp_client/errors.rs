//! MCP client error types.
//!
//! Every variant carries the server it concerns so callers can build
//! meaningful log entries. `code()` returns a stable dotted identifier and
//! `context()` the structured fields for surfacing to external callers.

use serde_json::json;
use thiserror::Error;

/// Errors that can occur while talking to backend servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server descriptor is malformed.
    #[error("config error for server '{server}': {reason}")]
    Config { server: String, reason: String },

    /// Transport-level failure (spawn, I/O, closed stream, HTTP status).
    #[error("connection error for server '{server}': {reason}")]
    Connection { server: String, reason: String },

    /// The backend demands (re-)authentication.
    #[error("server '{server}' requires authorization: {reason}")]
    AuthRequired { server: String, reason: String },

    /// The backend executed the call but reported a failure.
    #[error("tool '{tool}' on server '{server}' failed: {message}")]
    Tool {
        server: String,
        tool: String,
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The backend answered a non-tool request with a JSON-RPC error.
    #[error("protocol error from server '{server}' [{code}]: {message}")]
    Protocol {
        server: String,
        code: i64,
        message: String,
    },

    /// No capability is registered under this identifier.
    #[error("unknown capability: '{id}'")]
    NotFound { id: String, suggestions: Vec<String> },

    /// The capability exists but its server is not currently connected.
    #[error("server '{server}' is unavailable (state: {state})")]
    ServerUnavailable { server: String, state: String },

    /// The per-connection in-flight bound was reached.
    #[error("server '{server}' is busy ({limit} calls in flight)")]
    ServerBusy { server: String, limit: usize },

    /// A request did not complete within its timeout.
    #[error("'{operation}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The caller cancelled the request before it completed.
    #[error("'{operation}' on server '{server}' was cancelled")]
    Cancelled { server: String, operation: String },
}

impl McpError {
    /// Shorthand for a transport-level failure.
    pub fn connection(server: &str, reason: impl Into<String>) -> Self {
        Self::Connection {
            server: server.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::Connection { .. } => "connection_error",
            Self::AuthRequired { .. } => "auth_required",
            Self::Tool { .. } => "tool_error",
            Self::Protocol { .. } => "protocol_error",
            Self::NotFound { .. } => "routing.not_found",
            Self::ServerUnavailable { .. } => "routing.server_unavailable",
            Self::ServerBusy { .. } => "resource_limit.server_busy",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// The server this error concerns, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Config { server, .. }
            | Self::Connection { server, .. }
            | Self::AuthRequired { server, .. }
            | Self::Tool { server, .. }
            | Self::Protocol { server, .. }
            | Self::ServerUnavailable { server, .. }
            | Self::ServerBusy { server, .. }
            | Self::Timeout { server, .. }
            | Self::Cancelled { server, .. } => Some(server),
            Self::NotFound { .. } => None,
        }
    }

    /// Structured context for external callers.
    pub fn context(&self) -> serde_json::Value {
        let mut ctx = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(server) = self.server() {
            ctx["server"] = json!(server);
        }
        match self {
            Self::Tool { tool, code, data, .. } => {
                ctx["tool"] = json!(tool);
                ctx["remote_code"] = json!(code);
                ctx["data"] = data.clone().unwrap_or(serde_json::Value::Null);
            }
            Self::NotFound { id, suggestions } => {
                ctx["id"] = json!(id);
                ctx["suggestions"] = json!(suggestions);
            }
            Self::Timeout {
                operation,
                timeout_ms,
                ..
            } => {
                ctx["operation"] = json!(operation);
                ctx["timeout_ms"] = json!(timeout_ms);
            }
            _ => {}
        }
        ctx
    }

    /// Whether the failure is an authentication problem.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::AuthRequired { .. })
    }

    /// Whether the failure is transport-level and may clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Timeout { .. }
                | Self::ServerBusy { .. }
                | Self::ServerUnavailable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = McpError::ServerBusy {
            server: "fs".into(),
            limit: 4,
        };
        assert_eq!(err.code(), "resource_limit.server_busy");
        assert!(err.is_transient());
        assert_eq!(err.server(), Some("fs"));
    }

    #[test]
    fn test_context_carries_tool_fields() {
        let err = McpError::Tool {
            server: "fs".into(),
            tool: "read_file".into(),
            code: Some(-32001),
            message: "no such file".into(),
            data: None,
        };
        let ctx = err.context();
        assert_eq!(ctx["code"], "tool_error");
        assert_eq!(ctx["server"], "fs");
        assert_eq!(ctx["tool"], "read_file");
        assert_eq!(ctx["remote_code"], -32001);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_found_has_no_server() {
        let err = McpError::NotFound {
            id: "ghost__tool".into(),
            suggestions: vec![],
        };
        assert!(err.server().is_none());
        assert_eq!(err.context()["id"], "ghost__tool");
    }
}
