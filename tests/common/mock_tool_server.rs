//! In-process tool server for integration testing.
//!
//! Answers `initialize`, `tools/list` (with optional pagination) and
//! `tools/call` without any I/O.

use std::sync::Mutex;

use serde_json::{json, Value};

use toolsession::types::error_codes::*;
use toolsession::types::*;

/// How the server answers `initialize`.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeMode {
    /// A well-formed response with the given protocol version.
    Version(String),
    /// A result that does not decode as an initialize response.
    Malformed,
    /// A JSON-RPC error object.
    Reject,
}

/// A mock tool server for testing.
pub struct MockToolServer {
    pub tools: Mutex<Vec<Tool>>,
    request_log: Mutex<Vec<JsonRpcRequest>>,
    handshake: Mutex<HandshakeMode>,
    page_size: Mutex<Option<usize>>,
    repeat_cursor: Mutex<bool>,
    instructions: Mutex<Option<String>>,
}

impl Default for MockToolServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockToolServer {
    /// Create a new server with no tools.
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(Vec::new()),
            request_log: Mutex::new(Vec::new()),
            handshake: Mutex::new(HandshakeMode::Version("2025-06-18".to_string())),
            page_size: Mutex::new(None),
            repeat_cursor: Mutex::new(false),
            instructions: Mutex::new(None),
        }
    }

    /// Create a server offering `echo`, `add`, `fail` and `explode`.
    pub fn with_sample_tools() -> Self {
        let server = Self::new();
        server.add_tool(tool("echo", json!({ "type": "object", "required": ["text"] })));
        server.add_tool(tool(
            "add",
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number" }
                },
                "required": ["a", "b"]
            }),
        ));
        server.add_tool(tool(
            "getDirections",
            json!({
                "type": "object",
                "properties": {
                    "origin": { "type": "string" },
                    "destination": { "type": "string" },
                    "mode": { "type": "string", "enum": ["driving", "walking", "transit"] }
                },
                "required": ["origin", "destination"]
            }),
        ));
        server.add_tool(tool("fail", json!({ "type": "object" })));
        server.add_tool(tool("explode", json!({ "type": "object" })));
        server
    }

    pub fn add_tool(&self, tool: Tool) {
        self.tools.lock().unwrap().push(tool);
    }

    pub fn remove_tool(&self, name: &str) {
        self.tools.lock().unwrap().retain(|t| t.name != name);
    }

    pub fn set_handshake(&self, mode: HandshakeMode) {
        *self.handshake.lock().unwrap() = mode;
    }

    /// Split listings into pages of `size` tools.
    pub fn set_page_size(&self, size: Option<usize>) {
        *self.page_size.lock().unwrap() = size;
    }

    /// Hand out the same cursor forever.
    pub fn set_repeat_cursor(&self, repeat: bool) {
        *self.repeat_cursor.lock().unwrap() = repeat;
    }

    pub fn set_instructions(&self, instructions: impl Into<String>) {
        *self.instructions.lock().unwrap() = Some(instructions.into());
    }

    /// Get the request log.
    pub fn get_request_log(&self) -> Vec<JsonRpcRequest> {
        self.request_log.lock().unwrap().clone()
    }

    /// Count logged requests for `method`.
    pub fn count(&self, method: &str) -> usize {
        self.request_log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    /// Handle a JSON-RPC request.
    pub fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        self.request_log.lock().unwrap().push(request.clone());

        let result = match request.method.as_str() {
            "initialize" => self.handle_initialize(),
            "tools/list" => self.handle_tools_list(request.params),
            "tools/call" => self.handle_tools_call(request.params),
            _ => Err(JsonRpcError::method_not_found(&request.method)),
        };

        match result {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(error) => JsonRpcResponse::error(request.id, error),
        }
    }

    fn handle_initialize(&self) -> Result<Value, JsonRpcError> {
        let mode = self.handshake.lock().unwrap().clone();
        match mode {
            HandshakeMode::Version(version) => {
                let mut result = json!({
                    "protocolVersion": version,
                    "capabilities": ServerCapabilities {
                        tools: Some(ToolsCapability { list_changed: Some(true) }),
                        ..ServerCapabilities::default()
                    },
                    "serverInfo": Implementation::new("mock-tool-server", "1.0.0"),
                });
                if let Some(instructions) = self.instructions.lock().unwrap().clone() {
                    result["instructions"] = json!(instructions);
                }
                Ok(result)
            }
            HandshakeMode::Malformed => Ok(json!({ "hello": "world" })),
            HandshakeMode::Reject => Err(JsonRpcError::new(
                INVALID_REQUEST,
                "unsupported client",
                None,
            )),
        }
    }

    fn handle_tools_list(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let tools = self.tools.lock().unwrap().clone();

        let start = params
            .as_ref()
            .and_then(|p| p.get("cursor"))
            .and_then(|c| c.as_str())
            .map(|c| {
                c.parse::<usize>()
                    .map_err(|_| JsonRpcError::invalid_params(format!("bad cursor '{}'", c)))
            })
            .transpose()?
            .unwrap_or(0);

        if *self.repeat_cursor.lock().unwrap() {
            return Ok(json!(ListToolsResult {
                tools: tools.into_iter().take(1).collect(),
                next_cursor: Some("0".to_string()),
            }));
        }

        let page_size = self.page_size.lock().unwrap().unwrap_or(tools.len().max(1));
        let end = (start + page_size).min(tools.len());
        let next_cursor = (end < tools.len()).then(|| end.to_string());

        Ok(json!(ListToolsResult {
            tools: tools[start.min(end)..end].to_vec(),
            next_cursor,
        }))
    }

    fn handle_tools_call(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| JsonRpcError::invalid_params("Missing params"))?;
        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| JsonRpcError::invalid_params("Missing tool name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        if !self.tools.lock().unwrap().iter().any(|t| t.name == name) {
            return Err(JsonRpcError::invalid_params(format!("Tool not found: {}", name)));
        }

        match name {
            // The raw arguments come back as the result.
            "echo" => Ok(arguments),
            "add" => {
                let a = arguments["a"].as_f64().unwrap_or_default();
                let b = arguments["b"].as_f64().unwrap_or_default();
                Ok(json!({
                    "content": [{ "type": "text", "text": (a + b).to_string() }],
                    "structuredContent": { "sum": a + b }
                }))
            }
            "fail" => Ok(json!({
                "content": [{ "type": "text", "text": "no route found" }],
                "isError": true
            })),
            "explode" => Err(JsonRpcError::new(
                INTERNAL_ERROR,
                "tool crashed",
                Some(json!({ "trace": "boom" })),
            )),
            _ => Ok(json!({
                "content": [{ "type": "text", "text": format!("ran {}", name) }]
            })),
        }
    }
}

/// Build a tool from its name and schema.
pub fn tool(name: &str, input_schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(format!("The {} tool", name)),
        input_schema,
        annotations: None,
    }
}
