//! HTTP transport for remote tool servers.
//!
//! Each request is one POST carrying a JSON-RPC envelope. Servers may answer
//! with a plain JSON body or with an SSE stream whose `data:` lines carry the
//! messages; SSE streams are read only until the matching reply arrives. The
//! transport tracks the `MCP-Session-Id` and `MCP-Protocol-Version` headers
//! the server hands out and echoes them back.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::{Transport, TransportError};
use crate::config::AuthConfig;
use crate::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};

const SESSION_ID_HEADER: &str = "MCP-Session-Id";
const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// HTTP transport for remote tool servers.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    connected: AtomicBool,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
}

impl HttpTransport {
    /// Create a transport for `url`, applying the credentials in `auth` to
    /// every request.
    pub fn new(url: impl Into<String>, auth: &AuthConfig) -> Result<Self, TransportError> {
        let url = url.into();
        info!("Creating HTTP transport for URL: {}", url);

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Connect(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            headers: build_headers(auth)?,
            connected: AtomicBool::new(false),
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }

    /// POST one envelope. Returns `None` for 202 Accepted.
    async fn post(
        &self,
        body: &impl serde::Serialize,
    ) -> Result<Option<reqwest::Response>, TransportError> {
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(body);

        if let Some(version) = self.protocol_version.lock().await.clone() {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        if let Some(session) = self.session_id.lock().await.clone() {
            request = request.header(SESSION_ID_HEADER, session);
        }

        let response = request.send().await.map_err(request_error)?;

        if let Some(version) = header_str(response.headers(), PROTOCOL_VERSION_HEADER) {
            *self.protocol_version.lock().await = Some(version);
        }
        if let Some(session) = header_str(response.headers(), SESSION_ID_HEADER) {
            *self.session_id.lock().await = Some(session);
        }

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            if status.as_u16() == 404 {
                // The server forgot our session; the next request starts fresh.
                *self.session_id.lock().await = None;
            }
            return Err(TransportError::Http {
                status: status.as_u16(),
                message,
            });
        }

        if status.as_u16() == 202 {
            return Ok(None);
        }
        Ok(Some(response))
    }
}

fn build_headers(auth: &AuthConfig) -> Result<HeaderMap, TransportError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static("application/json, text/event-stream"),
    );

    if let Some(token) = &auth.bearer_token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| TransportError::Connect(format!("Invalid auth header: {}", e)))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);
    }

    if let Some(api_key) = &auth.api_key {
        let header_name = auth.api_key_header.as_deref().unwrap_or("X-API-Key");
        let name = HeaderName::from_bytes(header_name.as_bytes())
            .map_err(|e| TransportError::Connect(format!("Invalid API key header name: {}", e)))?;
        let value = HeaderValue::from_str(api_key)
            .map_err(|e| TransportError::Connect(format!("Invalid API key: {}", e)))?;
        headers.insert(name, value);
    }

    for (key, value) in &auth.headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| TransportError::Connect(format!("Invalid header name '{}': {}", key, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Connect(format!("Invalid header value: {}", e)))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn request_error(err: reqwest::Error) -> TransportError {
    if err.is_connect() {
        TransportError::io(format!("HTTP connection failed: {}", err))
    } else {
        TransportError::io(format!("HTTP request failed: {}", err))
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("text/event-stream"))
}

/// Joined `data:` payload of one SSE event, if it has any.
fn sse_event_data(event: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for raw_line in event.lines() {
        let line = raw_line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            let chunk = rest.strip_prefix(' ').unwrap_or(rest);
            match data.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(chunk);
                }
                None => data = Some(chunk.to_string()),
            }
        }
    }
    data.filter(|d| !d.trim().is_empty())
}

fn parse_sse_data(data: &str) -> Result<Value, TransportError> {
    serde_json::from_str(data)
        .map_err(|e| TransportError::Malformed(format!("invalid SSE data JSON: {}", e)))
}

/// Decode a complete response body as JSON, or as SSE events whose `data:`
/// lines carry JSON messages. A JSON array body is treated as a batch.
pub(crate) fn parse_json_or_sse_messages(body: &str) -> Result<Vec<Value>, TransportError> {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        return Ok(match json {
            Value::Array(items) => items,
            other => vec![other],
        });
    }

    let normalized = body.replace("\r\n", "\n");
    let messages = normalized
        .split("\n\n")
        .filter_map(sse_event_data)
        .map(|data| parse_sse_data(&data))
        .collect::<Result<Vec<_>, _>>()?;

    if messages.is_empty() {
        let preview: String = body.chars().take(240).collect();
        return Err(TransportError::Malformed(format!(
            "no JSON payload or SSE data lines found. Body preview: {}",
            preview
        )));
    }
    Ok(messages)
}

/// Return the message as the reply to `id`, or `None` when it is a server
/// message or answers another request.
fn match_response(id: &RequestId, message: Value) -> Result<Option<JsonRpcResponse>, TransportError> {
    if let Some(method) = message.get("method") {
        trace!("Skipping server message in HTTP body: {}", method);
        return Ok(None);
    }
    let response: JsonRpcResponse = serde_json::from_value(message)
        .map_err(|e| TransportError::Malformed(format!("Invalid response: {}", e)))?;
    if id.matches(&response.id) {
        Ok(Some(response))
    } else {
        trace!("Skipping response for request {}", response.id);
        Ok(None)
    }
}

fn no_reply(id: &RequestId) -> TransportError {
    TransportError::Malformed(format!("response body carries no reply for request {}", id))
}

/// Pick the response to `id` out of the decoded messages.
fn find_response(id: &RequestId, messages: Vec<Value>) -> Result<JsonRpcResponse, TransportError> {
    for message in messages {
        if let Some(response) = match_response(id, message)? {
            return Ok(response);
        }
    }
    Err(no_reply(id))
}

/// Read SSE events until the reply to `id` arrives.
async fn read_event_stream(
    id: &RequestId,
    response: reqwest::Response,
) -> Result<JsonRpcResponse, TransportError> {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut scanned = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransportError::io(format!("SSE stream failed: {}", e)))?;
        buffer.extend(chunk.iter().filter(|b| **b != b'\r'));

        while let Some(event) = take_event(&mut buffer, &mut scanned) {
            let event = String::from_utf8_lossy(&event);
            if let Some(data) = sse_event_data(&event) {
                if let Some(reply) = match_response(id, parse_sse_data(&data)?)? {
                    return Ok(reply);
                }
            }
        }
    }

    // The stream may end without a trailing blank line.
    let rest = String::from_utf8_lossy(&buffer);
    if let Some(data) = sse_event_data(&rest) {
        if let Some(reply) = match_response(id, parse_sse_data(&data)?)? {
            return Ok(reply);
        }
    }
    Err(no_reply(id))
}

/// Pop the next blank-line-terminated event off `buffer`.
///
/// `scanned` is how much of the buffer has already been searched, so each
/// byte is examined once per event.
fn take_event(buffer: &mut Vec<u8>, scanned: &mut usize) -> Option<Vec<u8>> {
    let start = (*scanned).saturating_sub(1).min(buffer.len());
    match buffer[start..].windows(2).position(|w| w == b"\n\n") {
        Some(offset) => {
            *scanned = 0;
            Some(buffer.drain(..start + offset + 2).collect())
        }
        None => {
            *scanned = buffer.len();
            None
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        self.ensure_connected()?;
        trace!("Sending HTTP request: method={}, id={}", request.method, request.id);

        let response = self.post(&request).await?.ok_or_else(|| {
            TransportError::Malformed("202 Accepted received for a JSON-RPC request".to_string())
        })?;

        if is_event_stream(&response) {
            return read_event_stream(&request.id, response).await;
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::io(format!("Failed to read response body: {}", e)))?;
        if body.trim().is_empty() {
            return Err(TransportError::Malformed(
                "Empty response body for JSON-RPC request".to_string(),
            ));
        }

        find_response(&request.id, parse_json_or_sse_messages(&body)?)
    }

    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), TransportError> {
        self.ensure_connected()?;
        trace!("Sending HTTP notification: method={}", notification.method);
        self.post(&notification).await.map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing HTTP transport for: {}", self.url);

        let session = self.session_id.lock().await.take();
        if let Some(session) = session {
            let result = self
                .client
                .delete(&self.url)
                .headers(self.headers.clone())
                .header(SESSION_ID_HEADER, &session)
                .send()
                .await;
            match result {
                Ok(response) => debug!(
                    "Session {} terminated with status {}",
                    session,
                    response.status()
                ),
                Err(e) => warn!("Failed to terminate session {}: {}", session, e),
            }
        }
        *self.protocol_version.lock().await = None;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;

    fn request(id: i64, method: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(RequestId::Number(id), method, None)
    }

    #[test]
    fn test_parse_plain_json_body() {
        let messages = parse_json_or_sse_messages(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert_eq!(messages, vec![json!({"jsonrpc":"2.0","id":1,"result":{}})]);
    }

    #[test]
    fn test_parse_sse_body_with_multiple_events() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\
                    \n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":2,\n\
                    data: \"result\":{\"ok\":true}}\n\n";
        let messages = parse_json_or_sse_messages(body).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["result"]["ok"], true);

        let response = find_response(&RequestId::Number(2), messages).unwrap();
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_take_event_across_chunks() {
        let mut buffer = Vec::new();
        let mut scanned = 0;

        buffer.extend_from_slice(b"data: {\"a\":1}\n");
        assert_eq!(take_event(&mut buffer, &mut scanned), None);
        assert_eq!(scanned, buffer.len());

        // The blank line straddles the chunk boundary.
        buffer.extend_from_slice(b"\ndata: {\"b\":2}\n\nda");
        assert_eq!(
            take_event(&mut buffer, &mut scanned),
            Some(b"data: {\"a\":1}\n\n".to_vec())
        );
        assert_eq!(
            take_event(&mut buffer, &mut scanned),
            Some(b"data: {\"b\":2}\n\n".to_vec())
        );
        assert_eq!(take_event(&mut buffer, &mut scanned), None);
        assert_eq!(buffer, b"da".to_vec());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_json_or_sse_messages("<html>nope</html>").is_err());
        assert!(parse_json_or_sse_messages("data: {broken\n\n").is_err());
    }

    #[test]
    fn test_find_response_without_match() {
        let result = find_response(
            &RequestId::Number(1),
            vec![json!({"jsonrpc":"2.0","id":9,"result":{}})],
        );
        assert!(matches!(result, Err(TransportError::Malformed(_))));
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let auth = AuthConfig {
            headers: HashMap::from([("bad header".to_string(), "x".to_string())]),
            ..AuthConfig::default()
        };
        assert!(matches!(
            HttpTransport::new("http://localhost:1", &auth),
            Err(TransportError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let transport = HttpTransport::new("http://localhost:1", &AuthConfig::default()).unwrap();
        assert_eq!(
            transport.send(request(1, "tools/list")).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_send_with_auth_and_session_tracking() {
        let server = MockServer::start_async().await;

        let init = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .header("authorization", "Bearer secret")
                    .header("x-api-key", "key-1")
                    .body_contains("\"method\":\"initialize\"");
                then.status(200)
                    .header("content-type", "application/json")
                    .header("mcp-session-id", "sess-42")
                    .json_body(json!({"jsonrpc":"2.0","id":1,"result":{"ready":true}}));
            })
            .await;

        let list = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/mcp")
                    .header("mcp-session-id", "sess-42")
                    .body_contains("\"method\":\"tools/list\"");
                then.status(200)
                    .header("content-type", "text/event-stream")
                    .body("data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"tools\":[]}}\n\n");
            })
            .await;

        let delete = server
            .mock_async(|when, then| {
                when.method(DELETE)
                    .path("/mcp")
                    .header("mcp-session-id", "sess-42");
                then.status(200);
            })
            .await;

        let auth = AuthConfig {
            bearer_token: Some("secret".to_string()),
            api_key: Some("key-1".to_string()),
            ..AuthConfig::default()
        };
        let transport = HttpTransport::new(server.url("/mcp/"), &auth).unwrap();
        transport.connect().await.unwrap();

        let response = transport.send(request(1, "initialize")).await.unwrap();
        assert_eq!(response.result, Some(json!({"ready": true})));
        assert_eq!(transport.session_id().await, Some("sess-42".to_string()));

        let response = transport.send(request(2, "tools/list")).await.unwrap();
        assert_eq!(response.result, Some(json!({"tools": []})));

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected().await);

        init.assert_async().await;
        list.assert_async().await;
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_notification_accepts_202() {
        let server = MockServer::start_async().await;
        let accepted = server
            .mock_async(|when, then| {
                when.method(POST).path("/");
                then.status(202);
            })
            .await;

        let transport = HttpTransport::new(server.url("/"), &AuthConfig::default()).unwrap();
        transport.connect().await.unwrap();
        transport
            .notify(JsonRpcNotification::new("notifications/initialized", None))
            .await
            .unwrap();

        accepted.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_maps_to_http_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/mcp");
                then.status(503).body("overloaded");
            })
            .await;

        let transport = HttpTransport::new(server.url("/mcp"), &AuthConfig::default()).unwrap();
        transport.connect().await.unwrap();

        let result = transport.send(request(1, "tools/list")).await;
        assert_eq!(
            result,
            Err(TransportError::Http {
                status: 503,
                message: "overloaded".to_string()
            })
        );
    }
}
