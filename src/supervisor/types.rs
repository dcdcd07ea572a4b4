//! Shared types for the supervisor.
//!
//! JSON-RPC 2.0 message types, tool protocol structures, and the client tier
//! enumeration.

use serde::{Deserialize, Serialize};

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

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

fn default_jsonrpc() -> String {
    "2.0".to_string()
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A decoded message from the child's output stream.
#[derive(Debug, Clone)]
pub enum RpcMessage {
    /// A request initiated by the child (carries both `id` and `method`).
    Request {
        id: serde_json::Value,
        method: String,
        params: Option<serde_json::Value>,
    },
    /// A notification initiated by the child.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// A response to one of our requests.
    Response(JsonRpcResponse),
}

impl RpcMessage {
    /// Classify a framed JSON value.
    ///
    /// Returns `None` for values that are not JSON-RPC messages at all, and
    /// for responses whose id is not a non-negative integer (we never send
    /// those).
    pub fn from_value(value: &serde_json::Value) -> Option<RpcMessage> {
        let obj = value.as_object()?;
        let params = obj.get("params").cloned();

        if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
            return Some(match obj.get("id") {
                Some(id) if !id.is_null() => RpcMessage::Request {
                    id: id.clone(),
                    method: method.to_string(),
                    params,
                },
                _ => RpcMessage::Notification {
                    method: method.to_string(),
                    params,
                },
            });
        }

        obj.get("id")?.as_u64()?;
        serde_json::from_value::<JsonRpcResponse>(value.clone())
            .ok()
            .map(RpcMessage::Response)
    }
}

// ─── Tool Protocol Types ─────────────────────────────────────────────────────

/// A tool as advertised by the child in `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

/// Identity we present to the child during the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Result of a successful tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    /// The name the caller used (before alias mapping).
    pub tool_name: String,
    /// The name actually sent to the child.
    pub resolved_name: String,
    pub result: serde_json::Value,
    pub execution_time_ms: u64,
}

// ─── Client Tier ─────────────────────────────────────────────────────────────

/// Which launch strategy produced the active process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientTier {
    Persistent,
    Managed,
    EnhancedGraphAccess,
    Legacy,
    None,
}

impl ClientTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientTier::Persistent => "persistent",
            ClientTier::Managed => "managed",
            ClientTier::EnhancedGraphAccess => "enhanced_graph_access",
            ClientTier::Legacy => "legacy",
            ClientTier::None => "none",
        }
    }
}

impl std::fmt::Display for ClientTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Standard Error Codes ────────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
