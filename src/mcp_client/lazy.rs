//! On-demand single server.
//!
//! `LazyServer` spawns its process on first use rather than at fleet startup
//! and respawns it on the next call after the process dies or the channel
//! fails. Useful for rarely used servers that are expensive to keep running.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Mutex;

use super::errors::McpError;
use super::lifecycle::{self, ManagedServer};
use super::registry::discover_tools;
use super::types::{FleetOptions, McpToolDefinition, ServerConfig};

pub struct LazyServer {
    name: String,
    config: ServerConfig,
    options: FleetOptions,
    slot: Mutex<Option<ManagedServer>>,
    spawns: AtomicU32,
}

impl LazyServer {
    pub fn new(name: &str, config: ServerConfig, options: FleetOptions) -> Self {
        Self {
            name: name.to_string(),
            config,
            options,
            slot: Mutex::new(None),
            spawns: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times the process has been started.
    pub fn spawn_count(&self) -> u32 {
        self.spawns.load(Ordering::SeqCst)
    }

    pub async fn is_running(&self) -> bool {
        match self.slot.lock().await.as_ref() {
            Some(server) => server.is_alive().await,
            None => false,
        }
    }

    /// Re-discover the server's tools, starting it if needed.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut slot = self.slot.lock().await;
        let server = self.ensure_running(&mut slot).await?;
        let budget = self.options.list_timeout();

        let outcome = match tokio::time::timeout(
            budget,
            discover_tools(&server.transport, self.options.max_pages),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.name.clone(),
                operation: "tools/list".into(),
                timeout_ms: budget.as_millis() as u64,
            }),
        };
        self.discard_on_channel_failure(&mut slot, outcome).await
    }

    /// Invoke a tool, starting or restarting the server if needed.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let mut slot = self.slot.lock().await;
        let server = self.ensure_running(&mut slot).await?;
        let budget = self.options.call_timeout();

        let outcome = match tokio::time::timeout(
            budget,
            server.transport.call_tool(tool_name, arguments),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: self.name.clone(),
                operation: format!("tools/call {tool_name}"),
                timeout_ms: budget.as_millis() as u64,
            }),
        };
        self.discard_on_channel_failure(&mut slot, outcome).await
    }

    /// Stop the process if it is running. A later call starts it again.
    pub async fn shutdown(&self) {
        if let Some(server) = self.slot.lock().await.take() {
            server.shutdown(self.options.shutdown_grace()).await;
        }
    }

    async fn ensure_running<'a>(
        &self,
        slot: &'a mut Option<ManagedServer>,
    ) -> Result<&'a ManagedServer, McpError> {
        let alive = match slot.as_ref() {
            Some(server) => server.is_alive().await,
            None => false,
        };

        if !alive {
            if let Some(dead) = slot.take() {
                tracing::info!(server = %self.name, pid = dead.pid(), "server gone, respawning");
                dead.shutdown(self.options.shutdown_grace()).await;
            }
            let server =
                lifecycle::start_with_budget(&self.name, &self.config, &self.options).await?;
            self.spawns.fetch_add(1, Ordering::SeqCst);
            tracing::info!(server = %self.name, pid = server.pid(), "lazy server started");
            *slot = Some(server);
        }

        slot.as_ref().ok_or_else(|| McpError::ServerUnavailable {
            name: self.name.clone(),
            reason: "server did not start".into(),
        })
    }

    async fn discard_on_channel_failure<T>(
        &self,
        slot: &mut Option<ManagedServer>,
        outcome: Result<T, McpError>,
    ) -> Result<T, McpError> {
        if let Err(e) = &outcome {
            if e.is_channel_failure() {
                tracing::warn!(
                    server = %self.name,
                    error = %e,
                    "channel failed, will respawn on next call"
                );
                if let Some(server) = slot.take() {
                    server.shutdown(self.options.shutdown_grace()).await;
                }
            }
        }
        outcome
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::FakeServer;

    const CALL_RESULT: &str = r#"{"content":[{"type":"text","text":"ok"}]}"#;

    fn server(fake: FakeServer) -> LazyServer {
        LazyServer::new("lazy", fake.config(), FleetOptions::default())
    }

    #[tokio::test]
    async fn test_spawns_on_first_call() {
        let lazy = server(
            FakeServer::new()
                .tools(r#"{"tools":[{"name":"ping"}]}"#)
                .respond(r#""method":"tools/call""#, CALL_RESULT),
        );
        assert_eq!(lazy.spawn_count(), 0);
        assert!(!lazy.is_running().await);

        let result = lazy.call_tool("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "ok");
        assert_eq!(lazy.spawn_count(), 1);

        let tools = lazy.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "ping");
        assert_eq!(lazy.spawn_count(), 1);

        lazy.shutdown().await;
        assert!(!lazy.is_running().await);
    }

    #[tokio::test]
    async fn test_respawns_after_exit() {
        // initialize, tools/list, one call; the next request ends the process.
        let lazy = server(
            FakeServer::new()
                .tools(r#"{"tools":[{"name":"ping"}]}"#)
                .respond(r#""method":"tools/call""#, CALL_RESULT)
                .exit_after(3),
        );

        lazy.call_tool("ping", serde_json::json!({})).await.unwrap();
        let err = lazy.call_tool("ping", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
        assert!(!lazy.is_running().await);

        lazy.call_tool("ping", serde_json::json!({})).await.unwrap();
        assert_eq!(lazy.spawn_count(), 2);

        lazy.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let lazy = LazyServer::new(
            "missing",
            ServerConfig {
                command: "/nonexistent/server-binary".into(),
                ..Default::default()
            },
            FleetOptions::default(),
        );
        let err = lazy.call_tool("ping", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(lazy.spawn_count(), 0);
    }
}
