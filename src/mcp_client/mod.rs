//! MCP Client: supervision of tool-provider servers over stdio JSON-RPC.
//!
//! This module handles:
//! - Spawning child processes with a curated environment, and reaping them
//! - JSON-RPC 2.0 communication over process stdio, one exchange at a time
//! - Concurrent fleet startup, each server under its own budget
//! - Tool discovery (with pagination) and aggregation across all servers
//! - Tool call routing, health status, and bounded fleet shutdown

pub mod client;
pub mod config;
pub mod errors;
pub mod lazy;
pub mod lifecycle;
pub mod process;
pub mod registry;
pub mod shutdown;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{find_config_path, load_servers_config};
pub use errors::McpError;
pub use lazy::LazyServer;
pub use registry::ToolRegistry;
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
pub use types::{
    FleetOptions, McpServersConfig, McpToolDefinition, ServerConfig, ServerState,
    ServerStatusInfo, ToolCallResult,
};
