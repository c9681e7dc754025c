//! MCP Client: high-level interface to a fleet of tool-provider servers.
//!
//! Orchestrates server lifecycle, the aggregated tool catalog, and tool call
//! dispatch. This is the surface handed to the agent runtime:
//! `list_all_tools`, `call_tool`, `status`, and `shutdown`.
//!
//! All methods take `&self`, so one client can be shared behind an `Arc`.
//! Workers never touch the server table or the catalog; both are written
//! here, after worker results have been joined.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};

use super::errors::McpError;
use super::lifecycle::{self, ManagedServer};
use super::registry::{discover_tools, ToolRegistry};
use super::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use super::types::{
    FleetOptions, McpServersConfig, McpToolDefinition, ServerConfig, ServerState,
    ServerStatusInfo, ToolCallResult,
};

// ─── Health Tracking ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ServerHealth {
    state: ServerState,
    error: Option<String>,
    restarts: u32,
    last_check: DateTime<Utc>,
}

impl ServerHealth {
    fn new(state: ServerState, error: Option<String>) -> Self {
        Self {
            state,
            error,
            restarts: 0,
            last_check: Utc::now(),
        }
    }
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes tool calls.
pub struct McpClient {
    /// Server configurations, kept for restarts.
    configs: BTreeMap<String, ServerConfig>,
    options: FleetOptions,
    enabled_servers: Option<HashSet<String>>,
    enabled_tools: Option<HashSet<String>>,
    /// Running servers.
    servers: Mutex<HashMap<String, Arc<ManagedServer>>>,
    /// Aggregated tool definitions from all running servers.
    registry: RwLock<ToolRegistry>,
    health: Mutex<BTreeMap<String, ServerHealth>>,
    coordinator: ShutdownCoordinator,
}

impl McpClient {
    /// Create a client from a servers configuration. Nothing is started yet.
    pub fn new(config: McpServersConfig) -> Self {
        let enabled_servers = config
            .enabled_servers
            .map(|ids| ids.into_iter().collect::<HashSet<_>>());
        let enabled_tools = config
            .enabled_tools
            .map(|names| names.into_iter().collect::<HashSet<_>>());

        let health = config
            .servers
            .iter()
            .map(|(name, server)| {
                let entry = if server.disabled {
                    ServerHealth::new(ServerState::Disabled, None)
                } else if !enabled_servers.as_ref().map_or(true, |ids| ids.contains(name)) {
                    ServerHealth::new(
                        ServerState::Disabled,
                        Some("not in enabled_servers".into()),
                    )
                } else {
                    ServerHealth::new(ServerState::Pending, None)
                };
                (name.clone(), entry)
            })
            .collect();

        let coordinator = ShutdownCoordinator::new(
            config.fleet.shutdown_grace(),
            config.fleet.shutdown_deadline(),
        );

        Self {
            configs: config.servers,
            options: config.fleet,
            enabled_servers,
            enabled_tools,
            servers: Mutex::new(HashMap::new()),
            registry: RwLock::new(ToolRegistry::new()),
            health: Mutex::new(health),
            coordinator,
        }
    }

    /// Replace what happens when shutdown overruns its deadline.
    pub fn with_exit_hatch(mut self, hatch: impl Fn() + Send + Sync + 'static) -> Self {
        self.coordinator = self.coordinator.with_exit_hatch(hatch);
        self
    }

    pub fn options(&self) -> &FleetOptions {
        &self.options
    }

    fn is_selected(&self, name: &str, config: &ServerConfig) -> bool {
        !config.disabled
            && self
                .enabled_servers
                .as_ref()
                .map_or(true, |ids| ids.contains(name))
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start all enabled servers concurrently and build the tool registry.
    ///
    /// Returns the servers that failed to start. Partial startup is the
    /// normal outcome; failures only show up here and in `status()`.
    pub async fn start_all(&self) -> Vec<(String, McpError)> {
        let selected: BTreeMap<String, ServerConfig> = self
            .configs
            .iter()
            .filter(|(name, config)| self.is_selected(name, config))
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();

        {
            let mut health = self.health.lock().await;
            for name in selected.keys() {
                health.insert(name.clone(), ServerHealth::new(ServerState::Pending, None));
            }
        }

        let report = lifecycle::spawn_all_servers(&selected, &self.options).await;

        for server in report.servers.into_values() {
            self.install(server).await;
        }
        for (name, e) in &report.failures {
            self.set_health(name, ServerState::Failed, Some(e.to_string())).await;
        }

        tracing::info!(
            servers = self.running_server_count().await,
            tools = self.tool_count().await,
            "fleet ready"
        );
        report.failures
    }

    /// Start one configured server by id.
    pub async fn start_server(&self, name: &str) -> Result<(), McpError> {
        let config = self.config_for(name)?;
        self.set_health(name, ServerState::Pending, None).await;

        match lifecycle::start_with_budget(name, config, &self.options).await {
            Ok(server) => {
                self.install(server).await;
                Ok(())
            }
            Err(e) => {
                self.set_health(name, ServerState::Failed, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Restart a server (crashed or not) and re-register its tools.
    ///
    /// Attempts back off exponentially. Consecutive attempts are capped; any
    /// successful start resets the count.
    pub async fn restart_server(&self, name: &str) -> Result<(), McpError> {
        let config = self.config_for(name)?;
        let restarts = self
            .health
            .lock()
            .await
            .get(name)
            .map(|h| h.restarts)
            .unwrap_or(0);

        let old = self.servers.lock().await.remove(name);
        self.registry.write().await.unregister_server(name);
        if let Some(old) = old {
            old.shutdown(self.options.shutdown_grace()).await;
        }
        self.set_health(name, ServerState::Pending, None).await;

        let outcome = lifecycle::restart_server(name, config, &self.options, restarts).await;
        if let Some(entry) = self.health.lock().await.get_mut(name) {
            entry.restarts = restarts + 1;
        }

        match outcome {
            Ok(server) => {
                tracing::info!(
                    server = name,
                    restarts = server.restart_count(),
                    "server restarted"
                );
                self.install(server).await;
                Ok(())
            }
            Err(e) => {
                self.set_health(name, ServerState::Failed, Some(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Shut down every running server under the coordinator's deadline.
    ///
    /// Idempotent. If the deadline expires, the exit hatch fires (by default
    /// ending the process).
    pub async fn shutdown(&self) -> ShutdownOutcome {
        let servers: Vec<Arc<ManagedServer>> =
            self.servers.lock().await.drain().map(|(_, s)| s).collect();
        *self.registry.write().await = ToolRegistry::new();
        for server in &servers {
            self.set_health(&server.name, ServerState::Disabled, Some("fleet shut down".into()))
                .await;
        }
        self.coordinator.shutdown(servers).await
    }

    // ─── Catalog ─────────────────────────────────────────────────────────

    /// Re-discover tools on every running server and return the flat catalog.
    ///
    /// Each server's listing is bounded by the list timeout. Servers whose
    /// listing fails are dropped from the fleet and absent from the result.
    /// A server busy with a call past the timeout keeps its previous tools.
    pub async fn list_all_tools(&self) -> Vec<McpToolDefinition> {
        let servers = self.running().await;
        let budget = self.options.list_timeout();
        let max_pages = self.options.max_pages;

        let listings = join_all(servers.iter().map(|server| async move {
            let listing = discover_tools(&server.transport, max_pages);
            let outcome = match tokio::time::timeout(budget, listing).await {
                Ok(result) => result,
                Err(_) => Err(McpError::Timeout {
                    server: server.name.clone(),
                    operation: "tools/list".into(),
                    timeout_ms: budget.as_millis() as u64,
                }),
            };
            (server, outcome)
        }))
        .await;

        for (server, outcome) in listings {
            let name = &server.name;
            match outcome {
                Ok(tools) => {
                    let mut registry = self.registry.write().await;
                    registry.register_server_tools(name, tools);
                    if let Some(allowed) = &self.enabled_tools {
                        registry.retain_tools(allowed);
                    }
                }
                Err(e) if e.is_channel_failure() && !server.transport.is_closed() => {
                    tracing::debug!(
                        server = %name,
                        error = %e,
                        "server busy, keeping cached tools"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        server = %name,
                        error = %e,
                        "tool listing failed, dropping server"
                    );
                    self.mark_failed(name, e.to_string()).await;
                }
            }
        }

        self.registry
            .read()
            .await
            .all_tools()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Snapshot of the current catalog without re-discovering.
    pub async fn registry(&self) -> ToolRegistry {
        self.registry.read().await.clone()
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool call, routing to the first server that advertises it.
    ///
    /// Remote errors, transport failures, and timeouts are all returned to
    /// the caller. A failure that closes the channel also removes the server
    /// from the fleet.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let server_name = self
            .registry
            .read()
            .await
            .get_tool(tool_name)
            .map(|t| t.server.clone())
            .ok_or(McpError::UnknownTool {
                name: tool_name.to_string(),
            })?;

        self.call_server_tool(&server_name, tool_name, arguments).await
    }

    /// Execute a tool call on a specific server.
    pub async fn call_server_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let server = self.servers.lock().await.get(server_name).cloned();
        let server = match server {
            Some(server) => server,
            None => {
                let reason = self
                    .health
                    .lock()
                    .await
                    .get(server_name)
                    .and_then(|h| h.error.clone())
                    .unwrap_or_else(|| "server not running".into());
                return Err(McpError::ServerUnavailable {
                    name: server_name.to_string(),
                    reason,
                });
            }
        };

        if self
            .registry
            .read()
            .await
            .get_server_tool(server_name, tool_name)
            .is_none()
        {
            return Err(McpError::UnknownTool {
                name: tool_name.to_string(),
            });
        }

        let start = Instant::now();
        let budget = self.options.call_timeout();
        let outcome = match tokio::time::timeout(
            budget,
            server.transport.call_tool(tool_name, arguments),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: server_name.to_string(),
                operation: format!("tools/call {tool_name}"),
                timeout_ms: budget.as_millis() as u64,
            }),
        };
        let elapsed = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let is_error = result
                    .get("isError")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                tracing::debug!(
                    server = server_name,
                    tool = tool_name,
                    elapsed_ms = elapsed,
                    is_error,
                    "tool call finished"
                );
                Ok(ToolCallResult {
                    tool_name: tool_name.to_string(),
                    server: server_name.to_string(),
                    success: !is_error,
                    result,
                    execution_time_ms: elapsed,
                })
            }
            Err(e) => {
                // A timeout spent queued behind another call leaves the
                // channel open; only a closed channel takes the server down.
                if e.is_channel_failure() && server.transport.is_closed() {
                    self.mark_failed(server_name, e.to_string()).await;
                }
                tracing::warn!(
                    server = server_name,
                    tool = tool_name,
                    error = %e,
                    "tool call failed"
                );
                Err(e)
            }
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Per-server health summary, in server-id order.
    ///
    /// Active servers whose process has since exited are marked failed here.
    pub async fn status(&self) -> Vec<ServerStatusInfo> {
        for server in self.running().await {
            if !server.is_alive().await {
                self.mark_failed(&server.name, "server process exited".into()).await;
            } else if let Some(entry) = self.health.lock().await.get_mut(&server.name) {
                entry.last_check = Utc::now();
            }
        }

        let servers = self.servers.lock().await;
        let registry = self.registry.read().await;
        let health = self.health.lock().await;
        health
            .iter()
            .map(|(name, entry)| ServerStatusInfo {
                name: name.clone(),
                state: entry.state.clone(),
                tool_count: registry.tools_for_server(name),
                pid: servers.get(name).and_then(|s| s.pid()),
                last_check: entry.last_check.to_rfc3339(),
                error: entry.error.clone(),
            })
            .collect()
    }

    /// Get the number of running servers.
    pub async fn running_server_count(&self) -> usize {
        self.servers.lock().await.len()
    }

    /// Get the number of registered tools.
    pub async fn tool_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn config_for(&self, name: &str) -> Result<&ServerConfig, McpError> {
        self.configs.get(name).ok_or(McpError::ConfigError {
            reason: format!("no configuration for server '{name}'"),
        })
    }

    async fn running(&self) -> Vec<Arc<ManagedServer>> {
        self.servers.lock().await.values().cloned().collect()
    }

    async fn set_health(&self, name: &str, state: ServerState, error: Option<String>) {
        let mut health = self.health.lock().await;
        let entry = health
            .entry(name.to_string())
            .or_insert_with(|| ServerHealth::new(state.clone(), None));
        entry.state = state;
        entry.error = error;
        entry.last_check = Utc::now();
    }

    async fn install(&self, server: ManagedServer) {
        let name = server.name.clone();
        {
            let mut registry = self.registry.write().await;
            registry.register_server_tools(&name, server.tools.clone());
            if let Some(allowed) = &self.enabled_tools {
                registry.retain_tools(allowed);
            }
        }
        self.set_health(&name, ServerState::Active, None).await;
        if let Some(entry) = self.health.lock().await.get_mut(&name) {
            entry.restarts = 0;
        }

        let replaced = self.servers.lock().await.insert(name, Arc::new(server));
        if let Some(old) = replaced {
            old.shutdown(self.options.shutdown_grace()).await;
        }
    }

    /// Drop a server from the fleet. It stays down until restarted.
    async fn mark_failed(&self, name: &str, reason: String) {
        let removed = self.servers.lock().await.remove(name);
        self.registry.write().await.unregister_server(name);
        tracing::warn!(server = name, reason = %reason, "server marked failed");
        self.set_health(name, ServerState::Failed, Some(reason)).await;

        if let Some(server) = removed {
            let grace = self.options.shutdown_grace();
            tokio::spawn(async move { server.shutdown(grace).await });
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
