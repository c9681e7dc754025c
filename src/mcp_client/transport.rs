//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! There is no multiplexing: one request is outstanding at a time, and the
//! exchange lock is held from the write until the matching response is read.
//! Neither side of the exchange has its own timeout; callers bound it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{
    error_codes, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ToolListResponse,
};

/// Protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── Transport ───────────────────────────────────────────────────────────────

struct Exchange {
    writer: Option<ChildStdin>,
    reader: BufReader<ChildStdout>,
}

/// Closes the channel if dropped before `disarm`: a caller that gave up
/// between write and read leaves an unread response in the pipe.
struct AbandonGuard<'a> {
    transport: &'a StdioTransport,
    armed: bool,
}

impl AbandonGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.transport.abandoned.store(true, Ordering::SeqCst);
            self.transport.closed.store(true, Ordering::SeqCst);
        }
    }
}

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    next_id: AtomicU64,
    /// Readable without the exchange lock, so health checks and shutdown
    /// never queue behind an in-flight call.
    closed: AtomicBool,
    abandoned: AtomicBool,
    exchange: Mutex<Exchange>,
}

impl StdioTransport {
    /// Create a new transport from a child process's stdin/stdout.
    pub fn new(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            server_name: server_name.to_string(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            exchange: Mutex::new(Exchange {
                writer: Some(stdin),
                reader: BufReader::new(stdout),
            }),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    fn transport_error(&self, reason: impl Into<String>) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason: reason.into(),
        }
    }

    fn closed_error(&self) -> McpError {
        if self.abandoned.load(Ordering::SeqCst) {
            self.transport_error("previous exchange was abandoned mid-flight")
        } else {
            self.transport_error("channel closed")
        }
    }

    /// Send a JSON-RPC request and read its response line.
    ///
    /// EOF, unparseable output, or a response for a different id all fail
    /// the exchange and close the channel; every later request fails fast.
    /// Dropping this future while waiting for the lock leaves the channel
    /// usable; dropping it after the write closes the channel.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut io = self.exchange.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;
        line.push('\n');

        let guard = AbandonGuard {
            transport: self,
            armed: true,
        };
        let result = self.exchange_line(&mut io, id, &line).await;
        guard.disarm();
        if result.is_err() {
            self.closed.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn exchange_line(
        &self,
        io: &mut Exchange,
        id: u64,
        line: &str,
    ) -> Result<JsonRpcResponse, McpError> {
        let writer = io
            .writer
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin already closed"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))?;

        let mut buf = String::new();
        loop {
            buf.clear();
            let bytes_read = io
                .reader
                .read_line(&mut buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error("server stdout closed (process may have exited)"));
            }

            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            let value: serde_json::Value = serde_json::from_str(trimmed)
                .map_err(|e| self.transport_error(format!("malformed response: {e}")))?;

            // Server-initiated messages (log lines, progress, list_changed)
            // may arrive before the response; they are not ours to answer.
            if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
                if value.get("result").is_none() && value.get("error").is_none() {
                    tracing::debug!(server = %self.server_name, method, "skipping server message");
                    continue;
                }
            }

            let resp: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| self.transport_error(format!("malformed response: {e}")))?;

            return match resp.id {
                Some(resp_id) if resp_id == id => Ok(resp),
                // Servers answer unparseable requests with a null id.
                None if resp.error.is_some() => Ok(resp),
                other => Err(self.transport_error(format!(
                    "response id {other:?} does not match request id {id}"
                ))),
            };
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut io = self.exchange.lock().await;
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let mut line = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize notification: {e}")))?;
        line.push('\n');

        let writer = io
            .writer
            .as_mut()
            .ok_or_else(|| self.transport_error("stdin already closed"))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write notification: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush notification: {e}")))?;

        Ok(())
    }

    /// Cooperative close: drop stdin so the server reads EOF.
    ///
    /// Never waits for an in-flight exchange. If one is running, stdin is
    /// left to the process teardown, which also ends the pending read.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let Ok(mut io) = self.exchange.try_lock() else {
            tracing::debug!(server = %self.server_name, "exchange busy, skipping stdin close");
            return;
        };
        if let Some(mut writer) = io.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Whether the channel has failed or been closed. Never blocks.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─── Protocol Methods ────────────────────────────────────────────────

    /// Perform the `initialize` handshake followed by the `initialized` notification.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = self.request("initialize", Some(params)).await?;
        let result = extract_result(response)?;
        let init: InitializeResult = serde_json::from_value(result).unwrap_or_else(|e| {
            tracing::debug!(
                server = %self.server_name,
                error = %e,
                "unrecognized initialize result"
            );
            InitializeResult::default()
        });

        self.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    /// Fetch one page of the server's tool listing.
    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<ToolListResponse, McpError> {
        let params = cursor.map(|c| json!({ "cursor": c }));
        let response = self.request("tools/list", params).await?;
        if let Some(err) = response.error {
            return Err(McpError::ServerError {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(match response.result {
            Some(value) => ToolListResponse::from_value(&self.server_name, value),
            None => ToolListResponse::Empty,
        })
    }

    /// Invoke a tool and return its raw result.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        let response = self.request("tools/call", Some(params)).await?;
        extract_result(response)
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
