//! MCP fleet error types.

use thiserror::Error;

/// Errors that can occur while supervising tool-provider servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// Configuration error (bad server entry, unreadable config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// Malformed response, I/O failure, or the server closed its stdout.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A caller-imposed budget elapsed before the server answered.
    #[error("'{operation}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Tool not found in the aggregated catalog.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// The owning server is not running (failed, disabled, or shut down).
    #[error("server '{name}' unavailable: {reason}")]
    ServerUnavailable {
        name: String,
        reason: String,
    },

    /// All restart attempts exhausted for a server.
    #[error("server '{name}' failed after {attempts} restart attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },
}

impl McpError {
    /// Whether this error means the channel to the server can no longer be trusted.
    ///
    /// A timed-out exchange leaves an unread response in the pipe, so it is
    /// treated the same as a broken pipe.
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::TransportError { .. } | Self::Timeout { .. })
    }
}
