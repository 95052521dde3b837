//! Streamable HTTP transport.
//!
//! Each client message is POSTed to the server URL. The reply is either a
//! JSON body or a short event stream that ends with the response. The
//! server hands out an `Mcp-Session-Id` on initialize which is echoed on
//! every later request. After the handshake a GET listener picks up
//! server-initiated notifications; servers without a push channel answer
//! that GET with 405.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::sse::{build_headers, status_error, SseDecoder};
use super::{dispatch_incoming, CloseSignal, OpenedTransport, PendingRequests, Transport};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{parse_incoming, Incoming, JsonRpcRequest, JsonRpcResponse};

/// Session header issued by the server on initialize.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Transport over POST-per-message HTTP.
pub struct HttpStreamTransport {
    server_name: String,
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    session_id: Arc<Mutex<Option<String>>>,
    pending: PendingRequests,
    close: Arc<CloseSignal>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl HttpStreamTransport {
    /// Prepare the transport. No network traffic happens until the first request.
    pub fn open(
        name: &str,
        http: reqwest::Client,
        url: &str,
        extra_headers: &HashMap<String, String>,
        credential: Option<String>,
    ) -> Result<OpenedTransport, McpError> {
        let url = Url::parse(url).map_err(|e| McpError::Config {
            server: name.to_string(),
            reason: format!("invalid url '{url}': {e}"),
        })?;
        let headers = build_headers(name, extra_headers, credential.as_deref())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            server_name: name.to_string(),
            http,
            url,
            headers,
            session_id: Arc::new(Mutex::new(None)),
            pending: PendingRequests::default(),
            close: Arc::new(CloseSignal::new(events_tx)),
            listener: Mutex::new(None),
        };
        Ok(OpenedTransport {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }

    fn request_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        let session = self.session_id.lock().ok().and_then(|s| s.clone());
        if let Some(id) = session {
            if let Ok(value) = HeaderValue::from_str(&id) {
                headers.insert(SESSION_HEADER, value);
            }
        }
        headers
    }

    fn has_session(&self) -> bool {
        self.session_id.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// POST one message and return the raw response after status checks.
    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        let response = self
            .http
            .post(self.url.clone())
            .headers(self.request_headers())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::connection(&self.server_name, format!("POST failed: {e}")))?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut session) = self.session_id.lock() {
                *session = Some(id.to_string());
            }
        }

        let status = response.status();
        if status == StatusCode::NOT_FOUND && self.has_session() {
            // The server forgot our session; the connection has to start over.
            self.close.fire("session expired");
            return Err(McpError::connection(&self.server_name, "session expired"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(&self.server_name, status, &text));
        }
        Ok(response)
    }

    /// Route every message in a JSON body. Bodies may hold a single
    /// message or a batch.
    async fn handle_json_body(&self, response: reqwest::Response) -> Result<(), McpError> {
        let value: serde_json::Value = response.json().await.map_err(|e| {
            McpError::connection(&self.server_name, format!("invalid JSON body: {e}"))
        })?;
        let messages = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        for message in messages {
            if let Some(incoming) = parse_incoming(&message.to_string()) {
                self.route(incoming).await;
            }
        }
        Ok(())
    }

    /// Drain an event-stream body until the awaited response shows up.
    async fn handle_stream_body(
        &self,
        response: reqwest::Response,
        waiter: &mut super::PendingGuard,
    ) -> Option<JsonRpcResponse> {
        let mut decoder = SseDecoder::new();
        let mut bytes = response.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let Ok(chunk) = chunk else { break };
            for event in decoder.push(&chunk) {
                if let Some(incoming) = parse_incoming(&event.data) {
                    self.route(incoming).await;
                }
            }
            if let Some(resp) = waiter.try_take() {
                return Some(resp);
            }
        }
        if let Some(event) = decoder.finish() {
            if let Some(incoming) = parse_incoming(&event.data) {
                self.route(incoming).await;
            }
        }
        waiter.try_take()
    }

    async fn route(&self, incoming: Incoming) {
        if let Some(reply) =
            dispatch_incoming(&self.server_name, incoming, &self.pending, self.close.events())
        {
            if let Err(e) = self.post(&reply).await {
                tracing::debug!(server = %self.server_name, error = %e, "failed to answer server request");
            }
        }
    }
}

#[async_trait]
impl Transport for HttpStreamTransport {
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
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params)).map_err(|e| {
            McpError::connection(&self.server_name, format!("failed to serialize request: {e}"))
        })?;
        let response = self.post(&body).await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if response.status() == StatusCode::ACCEPTED {
            // Answer will arrive on the push channel.
        } else if is_stream {
            if let Some(resp) = self.handle_stream_body(response, &mut waiter).await {
                return Ok(resp);
            }
        } else {
            self.handle_json_body(response).await?;
            if let Some(resp) = waiter.try_take() {
                return Ok(resp);
            }
        }

        tokio::select! {
            resp = waiter.recv() => resp.ok_or_else(|| {
                McpError::connection(&self.server_name, "transport closed")
            }),
            _ = self.close.token().cancelled() => {
                Err(McpError::connection(&self.server_name, "transport closed"))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        self.post(&body).await.map(|_| ())
    }

    async fn on_ready(&self) {
        let handle = tokio::spawn(listen_loop(
            self.server_name.clone(),
            self.http.clone(),
            self.url.clone(),
            self.request_headers(),
            self.pending.clone(),
            Arc::clone(&self.close),
        ));
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(old) = listener.replace(handle) {
                old.abort();
            }
        }
    }

    async fn close(&self) {
        self.close.silence();
        self.pending.fail_all();
        let handle = self.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        if self.has_session() {
            // Best effort: tell the server the session is over.
            let result = self
                .http
                .delete(self.url.clone())
                .headers(self.request_headers())
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!(server = %self.server_name, error = %e, "session DELETE failed");
            }
        }
    }
}

/// Long-lived GET picking up server-initiated messages.
async fn listen_loop(
    server: String,
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    pending: PendingRequests,
    close: Arc<CloseSignal>,
) {
    let response = match http
        .get(url)
        .headers(headers)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(server = %server, error = %e, "push listener could not connect");
            return;
        }
    };

    if response.status() == StatusCode::METHOD_NOT_ALLOWED {
        tracing::debug!(server = %server, "server offers no push channel");
        return;
    }
    if !response.status().is_success() {
        tracing::debug!(server = %server, status = %response.status(), "push listener rejected");
        return;
    }

    let mut decoder = SseDecoder::new();
    let mut bytes = response.bytes_stream();
    while let Some(Ok(chunk)) = bytes.next().await {
        for event in decoder.push(&chunk) {
            if let Some(incoming) = parse_incoming(&event.data) {
                // Server requests on the push channel are rare; answers are not supported here.
                let _ = dispatch_incoming(&server, incoming, &pending, close.events());
            }
        }
    }
    tracing::debug!(server = %server, "push listener ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_bad_url() {
        let result = HttpStreamTransport::open(
            "remote",
            reqwest::Client::new(),
            "not a url",
            &HashMap::new(),
            None,
        );
        assert!(matches!(result, Err(McpError::Config { .. })));
    }

    #[test]
    fn test_session_header_echoed_once_known() {
        let opened = HttpStreamTransport::open(
            "remote",
            reqwest::Client::new(),
            "http://127.0.0.1:9/mcp",
            &HashMap::new(),
            Some("secret".into()),
        );
        assert!(opened.is_ok());

        let transport = HttpStreamTransport {
            server_name: "remote".into(),
            http: reqwest::Client::new(),
            url: Url::parse("http://127.0.0.1:9/mcp").unwrap(),
            headers: HeaderMap::new(),
            session_id: Arc::new(Mutex::new(None)),
            pending: PendingRequests::default(),
            close: Arc::new(CloseSignal::new(mpsc::unbounded_channel().0)),
            listener: Mutex::new(None),
        };
        assert!(transport.request_headers().get(SESSION_HEADER).is_none());
        *transport.session_id.lock().unwrap() = Some("abc".into());
        assert_eq!(transport.request_headers().get(SESSION_HEADER).unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_request_to_unreachable_server_is_connection_error() {
        let opened = HttpStreamTransport::open(
            "remote",
            reqwest::Client::new(),
            "http://127.0.0.1:9/mcp",
            &HashMap::new(),
            None,
        )
        .unwrap();
        let err = opened.transport.request(1, "ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::Connection { .. }));
    }
}
