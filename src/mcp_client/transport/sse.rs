//! Server-push (SSE) transport and the shared event-stream decoder.
//!
//! The push-stream transport opens a long-lived GET whose first `endpoint`
//! event names the URL that client messages are POSTed to. Every response
//! and notification arrives on the stream. When the stream ends the
//! transport reports itself closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{dispatch_incoming, CloseSignal, OpenedTransport, PendingRequests, Transport};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{parse_incoming, JsonRpcRequest, JsonRpcResponse};

/// How long to wait for the `endpoint` event after the stream opens.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(15);

// ─── SSE Decoder ────────────────────────────────────────────────────────────

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if any (defaults to "message" per the SSE spec).
    pub event: Option<String>,
    /// All `data:` lines joined with newlines.
    pub data: String,
}

impl SseEvent {
    /// Event name with the SSE default applied.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental decoder: feed raw bytes, get complete events.
///
/// Buffers across chunk boundaries (including split UTF-8 sequences) and
/// splits on blank lines.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block[..end])) {
                events.push(event);
            }
        }
        events
    }

    /// Flush whatever remains once the stream has ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&rest))
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in block.lines() {
        if line.starts_with(':') {
            continue; // comment / keep-alive
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {} // id, retry: not needed here
        }
    }

    if data.is_empty() && event.is_none() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Build request headers shared by the HTTP-based transports.
pub(crate) fn build_headers(
    server: &str,
    extra: &HashMap<String, String>,
    credential: Option<&str>,
) -> Result<HeaderMap, McpError> {
    let mut headers = HeaderMap::new();
    for (key, value) in extra {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| McpError::Config {
            server: server.to_string(),
            reason: format!("invalid header name '{key}': {e}"),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| McpError::Config {
            server: server.to_string(),
            reason: format!("invalid header value for '{key}': {e}"),
        })?;
        headers.insert(name, value);
    }
    if let Some(token) = credential {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            McpError::AuthRequired {
                server: server.to_string(),
                reason: "credential is not a valid header value".into(),
            }
        })?;
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Map an HTTP status to the error taxonomy.
pub(crate) fn status_error(server: &str, status: StatusCode, body: &str) -> McpError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        McpError::AuthRequired {
            server: server.to_string(),
            reason: format!("HTTP {status}"),
        }
    } else {
        McpError::connection(server, format!("HTTP {status}: {body}"))
    }
}

// ─── Push-Stream Transport ──────────────────────────────────────────────────

/// Transport over a server-push event stream plus POSTed client messages.
pub struct PushStreamTransport {
    server_name: String,
    http: reqwest::Client,
    headers: HeaderMap,
    endpoint: Url,
    pending: PendingRequests,
    close: Arc<CloseSignal>,
    reader_handle: JoinHandle<()>,
}

impl PushStreamTransport {
    /// Open the stream and wait for the server to announce its POST endpoint.
    pub async fn open(
        name: &str,
        http: reqwest::Client,
        url: &str,
        extra_headers: &HashMap<String, String>,
        credential: Option<String>,
    ) -> Result<OpenedTransport, McpError> {
        let base = Url::parse(url).map_err(|e| McpError::Config {
            server: name.to_string(),
            reason: format!("invalid url '{url}': {e}"),
        })?;
        let headers = build_headers(name, extra_headers, credential.as_deref())?;

        let response = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| McpError::connection(name, format!("failed to open event stream: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(name, status, &body));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let close = Arc::new(CloseSignal::new(events_tx));
        let pending = PendingRequests::default();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader_handle = tokio::spawn(stream_loop(
            name.to_string(),
            response,
            base.clone(),
            http.clone(),
            headers.clone(),
            pending.clone(),
            Arc::clone(&close),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader_handle.abort();
                return Err(McpError::connection(name, "event stream closed before endpoint event"));
            }
            Err(_) => {
                reader_handle.abort();
                return Err(McpError::connection(
                    name,
                    format!("no endpoint event within {}s", ENDPOINT_TIMEOUT.as_secs()),
                ));
            }
        };

        tracing::info!(server = name, endpoint = %endpoint, "push-stream transport ready");

        let transport = Self {
            server_name: name.to_string(),
            http,
            headers,
            endpoint,
            pending,
            close,
            reader_handle,
        };
        Ok(OpenedTransport {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }

    async fn post(&self, body: &serde_json::Value) -> Result<(), McpError> {
        post_message(&self.server_name, &self.http, &self.endpoint, &self.headers, body).await
    }
}

async fn post_message(
    server: &str,
    http: &reqwest::Client,
    endpoint: &Url,
    headers: &HeaderMap,
    body: &serde_json::Value,
) -> Result<(), McpError> {
    let response = http
        .post(endpoint.clone())
        .headers(headers.clone())
        .json(body)
        .send()
        .await
        .map_err(|e| McpError::connection(server, format!("POST failed: {e}")))?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(status_error(server, status, &text));
    }
    Ok(())
}

#[async_trait]
impl Transport for PushStreamTransport {
    async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.close.is_closed() {
            return Err(McpError::connection(&self.server_name, "event stream is closed"));
        }
        let mut waiter = self.pending.register(id);
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params)).map_err(|e| {
            McpError::connection(&self.server_name, format!("failed to serialize request: {e}"))
        })?;
        self.post(&body).await?;

        tokio::select! {
            resp = waiter.recv() => resp.ok_or_else(|| {
                McpError::connection(&self.server_name, "event stream closed")
            }),
            _ = self.close.token().cancelled() => {
                Err(McpError::connection(&self.server_name, "event stream closed"))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<(), McpError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        self.post(&body).await
    }

    async fn close(&self) {
        self.close.silence();
        self.pending.fail_all();
        self.reader_handle.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_loop(
    server: String,
    response: reqwest::Response,
    base: Url,
    http: reqwest::Client,
    headers: HeaderMap,
    pending: PendingRequests,
    close: Arc<CloseSignal>,
    endpoint_tx: oneshot::Sender<Url>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut endpoint: Option<Url> = None;
    let mut decoder = SseDecoder::new();
    let mut bytes = response.bytes_stream();

    let reason = loop {
        let chunk = match bytes.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break format!("stream read error: {e}"),
            None => break "event stream ended".to_string(),
        };

        for event in decoder.push(&chunk) {
            if event.name() == "endpoint" {
                match base.join(event.data.trim()) {
                    Ok(url) => {
                        endpoint = Some(url.clone());
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(url);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %server, error = %e, "bad endpoint event");
                    }
                }
                continue;
            }

            let Some(incoming) = parse_incoming(&event.data) else {
                continue;
            };
            if let Some(reply) = dispatch_incoming(&server, incoming, &pending, close.events()) {
                if let Some(url) = &endpoint {
                    if let Err(e) = post_message(&server, &http, url, &headers, &reply).await {
                        tracing::debug!(server = %server, error = %e, "failed to answer server request");
                    }
                }
            }
        }
    };

    tracing::info!(server = %server, reason = %reason, "push-stream reader finished");
    pending.fail_all();
    close.fire(&reason);
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_events_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: endpoint\ndata: /mess").is_empty());
        let events = decoder.push(b"ages?s=1\n\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "endpoint");
        assert_eq!(events[0].data, "/messages?s=1");
        assert_eq!(events[1].name(), "message");
        assert_eq!(events[1].data, "{\"a\":1}");
    }

    #[test]
    fn test_decoder_handles_crlf_comments_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keep-alive\r\n\r\ndata: line1\r\ndata: line2\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn test_decoder_finish_flushes_tail() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish().unwrap().data, "tail");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_keeps_split_utf8_intact() {
        let mut decoder = SseDecoder::new();
        let text = "data: héllo\n\n".as_bytes();
        let split = 8; // inside the two-byte 'é'
        assert!(decoder.push(&text[..split]).is_empty());
        let events = decoder.push(&text[split..]);
        assert_eq!(events[0].data, "héllo");
    }

    #[test]
    fn test_status_error_maps_auth() {
        assert!(status_error("s", StatusCode::UNAUTHORIZED, "").is_auth());
        assert!(status_error("s", StatusCode::FORBIDDEN, "").is_auth());
        assert!(matches!(
            status_error("s", StatusCode::BAD_GATEWAY, "oops"),
            McpError::Connection { .. }
        ));
    }

    #[test]
    fn test_build_headers_adds_bearer() {
        let mut extra = HashMap::new();
        extra.insert("X-Tenant".to_string(), "acme".to_string());
        let headers = build_headers("s", &extra, Some("tok")).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(headers.get("x-tenant").unwrap(), "acme");
    }
}
