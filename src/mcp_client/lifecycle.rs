//! Server startup and restart.
//!
//! Each server is brought up on its own task (spawn, `initialize`, paginated
//! tool discovery) and raced against its startup budget. Startup of a fleet
//! fans out across all servers at once, so the whole fleet is ready (or
//! given up on) after the largest single budget rather than the sum.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::errors::McpError;
use super::process::{format_stderr_suffix, ManagedProcess};
use super::registry::discover_tools;
use super::transport::StdioTransport;
use super::types::{FleetOptions, McpToolDefinition, ServerConfig, ServerInfo};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum restart attempts before giving up on a server.
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay between restart attempts (doubles each time).
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// Time allowed for a crashing child's last stderr lines to be drained.
const STDERR_SETTLE: Duration = Duration::from_millis(100);

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// A running server: its process, its channel, and the tools it advertised.
pub struct ManagedServer {
    /// Server id from the configuration.
    pub name: String,
    process: Mutex<ManagedProcess>,
    /// JSON-RPC transport (stdin/stdout).
    pub transport: StdioTransport,
    /// Tools discovered during startup.
    pub tools: Vec<McpToolDefinition>,
    pub server_info: Option<ServerInfo>,
    pid: Option<u32>,
    restart_count: u32,
}

impl ManagedServer {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// How many times this server has been restarted.
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Whether the process is running and the channel has not failed.
    pub async fn is_alive(&self) -> bool {
        !self.transport.is_closed() && self.process.lock().await.is_alive()
    }

    /// Close the channel, then terminate the process within `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.transport.close().await;
        self.process.lock().await.terminate(grace).await;
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn one server, run the handshake, and discover its tools.
///
/// Has no timeout of its own; see [`start_with_budget`].
pub async fn spawn_server(
    name: &str,
    config: &ServerConfig,
    working_dir: Option<&str>,
    max_pages: usize,
) -> Result<ManagedServer, McpError> {
    let (mut process, pipes) = ManagedProcess::spawn(name, config, working_dir)?;
    let transport = StdioTransport::new(name, pipes.stdin, pipes.stdout);

    let handshake = async {
        let init = transport.initialize().await?;
        let tools = discover_tools(&transport, max_pages).await?;
        Ok::<_, McpError>((init, tools))
    };

    let (init, tools) = match handshake.await {
        Ok(done) => done,
        Err(e) => {
            sleep(STDERR_SETTLE).await;
            let stderr_ctx = process.stderr_excerpt();
            if !stderr_ctx.is_empty() {
                tracing::warn!(
                    server = name,
                    stderr = %stderr_ctx,
                    "server stderr captured on failure"
                );
            }
            process.kill().await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
            });
        }
    };

    let pid = process.pid();
    Ok(ManagedServer {
        name: name.to_string(),
        process: Mutex::new(process),
        transport,
        tools,
        server_info: init.server_info,
        pid,
        restart_count: 0,
    })
}

/// Start one server under its startup budget.
///
/// The startup runs on its own task. If the budget elapses first, the task
/// is aborted without waiting for it: dropping it drops the process handle,
/// which kills the child. The caller never waits past the budget.
pub async fn start_with_budget(
    name: &str,
    config: &ServerConfig,
    options: &FleetOptions,
) -> Result<ManagedServer, McpError> {
    let budget = options.startup_budget(config);
    let task = {
        let name = name.to_string();
        let config = config.clone();
        let working_dir = options.working_dir.clone();
        let max_pages = options.max_pages;
        tokio::spawn(async move {
            spawn_server(&name, &config, working_dir.as_deref(), max_pages).await
        })
    };
    let abort = task.abort_handle();

    match tokio::time::timeout(budget, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("startup task failed: {join_err}"),
        }),
        Err(_) => {
            abort.abort();
            Err(McpError::Timeout {
                server: name.to_string(),
                operation: "startup".into(),
                timeout_ms: budget.as_millis() as u64,
            })
        }
    }
}

/// Restart a crashed server with exponential backoff.
///
/// Returns the new `ManagedServer` if successful, or an error if all
/// attempts are exhausted.
pub async fn restart_server(
    name: &str,
    config: &ServerConfig,
    options: &FleetOptions,
    current_restart_count: u32,
) -> Result<ManagedServer, McpError> {
    if current_restart_count >= MAX_RESTART_ATTEMPTS {
        return Err(McpError::RestartExhausted {
            name: name.to_string(),
            attempts: MAX_RESTART_ATTEMPTS,
        });
    }

    // Exponential backoff: 1s, 2s, 4s
    let delay = RESTART_BASE_DELAY * 2u32.pow(current_restart_count);
    sleep(delay).await;

    let mut server = start_with_budget(name, config, options).await?;
    server.restart_count = current_restart_count + 1;
    Ok(server)
}

// ─── Batch Operations ────────────────────────────────────────────────────────

/// Outcome of bringing up a fleet.
#[derive(Default)]
pub struct StartupReport {
    pub servers: HashMap<String, ManagedServer>,
    pub failures: Vec<(String, McpError)>,
    pub disabled: Vec<String>,
}

/// Start all enabled servers concurrently, each under its own budget.
///
/// Servers that fail or time out are reported in `failures` and never abort
/// the rest; partial startup is the normal outcome.
pub async fn spawn_all_servers(
    configs: &BTreeMap<String, ServerConfig>,
    options: &FleetOptions,
) -> StartupReport {
    let mut report = StartupReport::default();
    let started = Instant::now();

    let attempts = configs
        .iter()
        .filter(|(name, config)| {
            if config.disabled {
                report.disabled.push((*name).clone());
            }
            !config.disabled
        })
        .map(|(name, config)| async move {
            let begin = Instant::now();
            let outcome = start_with_budget(name, config, options).await;
            (name.clone(), outcome, begin.elapsed())
        })
        .collect::<Vec<_>>();

    for (name, outcome, elapsed) in join_all(attempts).await {
        match outcome {
            Ok(server) => {
                tracing::info!(
                    server = %name,
                    pid = server.pid(),
                    tools = server.tools.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "server started"
                );
                report.servers.insert(name, server);
            }
            Err(e) => {
                tracing::warn!(
                    server = %name,
                    error = %e,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "server failed to start (non-fatal)"
                );
                report.failures.push((name, e));
            }
        }
    }

    tracing::info!(
        started = report.servers.len(),
        failed = report.failures.len(),
        disabled = report.disabled.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "fleet startup finished"
    );
    report
}

// ─── Tests ───────────────────────────────────────────────────────────────────
