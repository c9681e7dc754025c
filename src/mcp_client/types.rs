//! Shared types for the MCP fleet.
//!
//! JSON-RPC 2.0 message types, tool descriptors, server specifications, and
//! the status records reported upward.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

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

/// JSON-RPC 2.0 notification (no id, no response).
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
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    /// `None` only for error responses to requests the server could not parse.
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── Tool-Provider Protocol Types ────────────────────────────────────────────

/// A tool advertised by a server.
///
/// `server` is the origin-server id. It is empty on the wire and filled in
/// when the tool enters the catalog; the tool name itself is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema", alias = "params_schema")]
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub server: String,
}

/// Shapes observed in `tools/list` results, normalized at the channel boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolListResponse {
    /// Absent, null, or unrecognized result.
    Empty,
    /// A complete listing.
    Flat(Vec<McpToolDefinition>),
    /// One page of a listing plus the token for the next page.
    Paginated(Vec<McpToolDefinition>, String),
}

impl ToolListResponse {
    /// Normalize a raw `tools/list` result.
    ///
    /// Accepts a bare array, an object with a `tools` array (with an optional
    /// `nextCursor`, `next_cursor`, or `paginationToken`), or nothing at all.
    /// Entries that do not parse as tool definitions are skipped.
    pub fn from_value(server: &str, value: serde_json::Value) -> Self {
        let (raw_tools, token) = match value {
            serde_json::Value::Array(items) => (items, None),
            serde_json::Value::Object(mut obj) => {
                let token = ["nextCursor", "next_cursor", "paginationToken"]
                    .iter()
                    .find_map(|key| obj.get(*key).and_then(|v| v.as_str()).map(String::from))
                    .filter(|t| !t.is_empty());
                match obj.remove("tools") {
                    Some(serde_json::Value::Array(items)) => (items, token),
                    _ => (Vec::new(), None),
                }
            }
            _ => return Self::Empty,
        };

        let tools: Vec<McpToolDefinition> = raw_tools
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<McpToolDefinition>(raw) {
                Ok(tool) => Some(tool),
                Err(e) => {
                    tracing::warn!(server, error = %e, "skipping malformed tool descriptor");
                    None
                }
            })
            .collect();

        match (tools.is_empty(), token) {
            (_, Some(token)) => Self::Paginated(tools, token),
            (true, None) => Self::Empty,
            (false, None) => Self::Flat(tools),
        }
    }

    /// Split into the tools on this page and the continuation token, if any.
    pub fn into_parts(self) -> (Vec<McpToolDefinition>, Option<String>) {
        match self {
            Self::Empty => (Vec::new(), None),
            Self::Flat(tools) => (tools, None),
            Self::Paginated(tools, token) => (tools, Some(token)),
        }
    }
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
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Result of a tool call execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub server: String,
    /// `false` when the tool ran but reported `isError: true`.
    pub success: bool,
    pub result: serde_json::Value,
    pub execution_time_ms: u64,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// One server specification. The server id is the key it is stored under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server working directory (overrides the fleet-wide working_dir).
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    /// Servers empirically prone to hanging get the stricter startup budget.
    #[serde(default, alias = "knownSlow")]
    pub known_slow: bool,
    /// Explicit startup budget, overriding both fleet defaults.
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
}

/// Fleet-wide budgets and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetOptions {
    pub startup_timeout_ms: u64,
    pub slow_server_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub list_timeout_ms: u64,
    pub max_pages: usize,
    pub shutdown_grace_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub working_dir: Option<String>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 5_000,
            slow_server_timeout_ms: 2_000,
            call_timeout_ms: 30_000,
            list_timeout_ms: 5_000,
            max_pages: 10,
            shutdown_grace_ms: 500,
            shutdown_deadline_ms: 3_000,
            working_dir: None,
        }
    }
}

impl FleetOptions {
    /// Startup budget for one server.
    pub fn startup_budget(&self, config: &ServerConfig) -> Duration {
        let ms = match config.timeout_ms {
            Some(ms) => ms,
            None if config.known_slow => self.slow_server_timeout_ms,
            None => self.startup_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn list_timeout(&self) -> Duration {
        Duration::from_millis(self.list_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }
}

/// Top-level servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(default, alias = "mcpServers")]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub fleet: FleetOptions,
    /// When set, only these server ids are started.
    #[serde(default)]
    pub enabled_servers: Option<Vec<String>>,
    /// When set, only these tool names are kept in the catalog.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Health of one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    /// Startup is in flight.
    Pending,
    Active,
    Disabled,
    Failed,
}

/// Per-server health summary returned by `McpClient::status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusInfo {
    pub name: String,
    pub state: ServerState,
    pub tool_count: usize,
    pub pid: Option<u32>,
    pub last_check: String,
    pub error: Option<String>,
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
