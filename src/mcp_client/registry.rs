//! Tool registry: aggregates tool definitions across all servers.
//!
//! Provides:
//! - Paginated discovery against one channel (`discover_tools`)
//! - A flat, ordered view and a grouped-by-server view of every tool
//! - Lookup by name, with the origin server kept alongside each tool
//! - Serialization of tools into function-calling format
//!
//! Tool names are never rewritten. Two servers may advertise the same name;
//! `get_tool` returns the first in server-id order and `servers_for_tool`
//! lists every owner so callers can disambiguate.

use std::collections::{BTreeMap, HashSet};

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::McpToolDefinition;

// ─── Discovery ───────────────────────────────────────────────────────────────

/// List every tool a server advertises, following continuation tokens.
///
/// Stops after `max_pages` pages or when a token repeats, so a server that
/// loops its cursor cannot stall discovery. Duplicate names within the
/// server's own listing are dropped.
pub async fn discover_tools(
    transport: &StdioTransport,
    max_pages: usize,
) -> Result<Vec<McpToolDefinition>, McpError> {
    let server = transport.server_name();
    let mut tools = Vec::new();
    let mut seen_names = HashSet::new();
    let mut seen_tokens = HashSet::new();
    let mut cursor: Option<String> = None;

    for page in 1..=max_pages.max(1) {
        let (page_tools, next) = transport.list_tools(cursor.as_deref()).await?.into_parts();

        for mut tool in page_tools {
            if seen_names.insert(tool.name.clone()) {
                tool.server = server.to_string();
                tools.push(tool);
            }
        }

        match next {
            Some(token) if seen_tokens.insert(token.clone()) => {
                if page == max_pages {
                    tracing::warn!(server, max_pages, "tool listing hit page cap, truncating");
                }
                cursor = Some(token);
            }
            Some(token) => {
                tracing::warn!(server, token = %token, "tool listing repeated a cursor, stopping");
                break;
            }
            None => break,
        }
    }

    tracing::debug!(server, count = tools.len(), "discovered tools");
    Ok(tools)
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all servers.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `server_id → tools`, in advertisement order.
    servers: BTreeMap<String, Vec<McpToolDefinition>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a server's tools, tagging each with its origin.
    pub fn register_server_tools(&mut self, server_name: &str, tools: Vec<McpToolDefinition>) {
        let tagged = tools
            .into_iter()
            .map(|mut tool| {
                tool.server = server_name.to_string();
                tool
            })
            .collect();
        self.servers.insert(server_name.to_string(), tagged);
    }

    /// Remove all tools belonging to a server.
    pub fn unregister_server(&mut self, server_name: &str) {
        self.servers.remove(server_name);
    }

    /// Look up a tool by name. With collisions, the lowest server id wins.
    pub fn get_tool(&self, name: &str) -> Option<&McpToolDefinition> {
        self.all_tools().into_iter().find(|t| t.name == name)
    }

    /// Look up a tool on one specific server.
    pub fn get_server_tool(&self, server_name: &str, name: &str) -> Option<&McpToolDefinition> {
        self.servers
            .get(server_name)
            .and_then(|tools| tools.iter().find(|t| t.name == name))
    }

    /// Every server advertising a tool with this name.
    pub fn servers_for_tool(&self, name: &str) -> Vec<&str> {
        self.servers
            .iter()
            .filter(|(_, tools)| tools.iter().any(|t| t.name == name))
            .map(|(server, _)| server.as_str())
            .collect()
    }

    /// Flat list of all tools, grouped by server id then advertisement order.
    pub fn all_tools(&self) -> Vec<&McpToolDefinition> {
        self.servers.values().flatten().collect()
    }

    /// Tools grouped by origin server.
    pub fn grouped(&self) -> &BTreeMap<String, Vec<McpToolDefinition>> {
        &self.servers
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.servers.values().map(Vec::len).sum()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.servers.get(server_name).map(Vec::len).unwrap_or(0)
    }

    /// Server ids with at least one registered tool list (possibly empty).
    pub fn server_names(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    /// Retain only tools whose names appear in the allowlist.
    pub fn retain_tools(&mut self, allowed: &HashSet<String>) {
        let before = self.len();
        for tools in self.servers.values_mut() {
            tools.retain(|t| allowed.contains(&t.name));
        }
        tracing::info!(before, after = self.len(), "filtered tool catalog by allowlist");
    }

    /// One-line-per-server summary of what the fleet can do.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools currently available.".to_string();
        }

        let server_parts: Vec<String> = self
            .servers
            .iter()
            .filter(|(_, tools)| !tools.is_empty())
            .map(|(name, tools)| format!("{name} ({})", tools.len()))
            .collect();

        format!(
            "Available capabilities ({} tools across {} servers): {}.",
            self.len(),
            server_parts.len(),
            server_parts.join(", "),
        )
    }

    /// Serialize all tool definitions into OpenAI function-calling format.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.all_tools()
            .into_iter()
            .map(|def| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": def.name,
                        "description": def.description,
                        "parameters": def.input_schema,
                    }
                })
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> McpToolDefinition {
        McpToolDefinition {
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: serde_json::json!({"type": "object"}),
            server: String::new(),
        }
    }

    fn sample_registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("zeta", vec![tool("search"), tool("fetch")]);
        reg.register_server_tools("alpha", vec![tool("search")]);
        reg
    }

    #[test]
    fn test_register_tags_origin_without_renaming() {
        let reg = sample_registry();
        let fetch = reg.get_tool("fetch").unwrap();
        assert_eq!(fetch.name, "fetch");
        assert_eq!(fetch.server, "zeta");
    }

    #[test]
    fn test_collisions_are_kept() {
        let reg = sample_registry();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.servers_for_tool("search"), vec!["alpha", "zeta"]);
        assert_eq!(reg.get_tool("search").unwrap().server, "alpha");
        assert_eq!(reg.get_server_tool("zeta", "search").unwrap().server, "zeta");
    }

    #[test]
    fn test_flat_order_follows_server_id() {
        let reg = sample_registry();
        let order: Vec<(&str, &str)> = reg
            .all_tools()
            .iter()
            .map(|t| (t.server.as_str(), t.name.as_str()))
            .collect();
        assert_eq!(order, vec![("alpha", "search"), ("zeta", "search"), ("zeta", "fetch")]);
    }

    #[test]
    fn test_register_replaces_previous_listing() {
        let mut reg = sample_registry();
        reg.register_server_tools("zeta", vec![tool("only")]);
        assert_eq!(reg.tools_for_server("zeta"), 1);
        assert!(reg.get_tool("fetch").is_none());
    }

    #[test]
    fn test_unregister_server() {
        let mut reg = sample_registry();
        reg.unregister_server("zeta");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.server_names(), vec!["alpha"]);
        assert_eq!(reg.tools_for_server("zeta"), 0);
    }

    #[test]
    fn test_retain_tools() {
        let mut reg = sample_registry();
        let allowed: HashSet<String> = ["fetch".to_string()].into_iter().collect();
        reg.retain_tools(&allowed);
        assert_eq!(reg.len(), 1);
        assert!(reg.get_tool("search").is_none());
    }

    #[test]
    fn test_capability_summary() {
        assert_eq!(ToolRegistry::new().capability_summary(), "No tools currently available.");
        let summary = sample_registry().capability_summary();
        assert!(summary.contains("3 tools across 2 servers"));
        assert!(summary.contains("zeta (2)"));
    }

    #[test]
    fn test_to_openai_tools() {
        let tools = sample_registry().to_openai_tools();
        assert_eq!(tools.len(), 3);
        assert_eq!(tools[0]["function"]["name"], "search");
        assert_eq!(tools[0]["function"]["parameters"]["type"], "object");
    }

    #[cfg(unix)]
    mod discovery {
        use super::*;
        use crate::mcp_client::process::ManagedProcess;
        use crate::mcp_client::test_support::FakeServer;

        async fn discover(server: FakeServer, max_pages: usize) -> Vec<McpToolDefinition> {
            let (_process, pipes) = ManagedProcess::spawn("paged", &server.config(), None).unwrap();
            let transport = StdioTransport::new("paged", pipes.stdin, pipes.stdout);
            transport.initialize().await.unwrap();
            discover_tools(&transport, max_pages).await.unwrap()
        }

        #[tokio::test]
        async fn test_two_pages_concatenate_without_duplicates() {
            let server = FakeServer::new()
                .page("p2", r#"{"tools":[{"name":"b"},{"name":"c"}]}"#)
                .tools(r#"{"tools":[{"name":"a"},{"name":"b"}],"nextCursor":"p2"}"#);
            let names: Vec<String> =
                discover(server, 10).await.into_iter().map(|t| t.name).collect();
            assert_eq!(names, vec!["a", "b", "c"]);
        }

        #[tokio::test]
        async fn test_token_loop_is_bounded() {
            // Every page points at a fresh cursor, forever.
            let script = r#"
                n=0
                while IFS= read -r line; do
                  id=$(printf '%s' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\).*/\1/p')
                  [ -z "$id" ] && continue
                  n=$((n+1))
                  printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"t%s"}],"nextCursor":"c%s"}}\n' "$id" "$n" "$n"
                done
            "#;
            let tools = discover(FakeServer::raw(script), 4).await;
            assert_eq!(tools.len(), 4);
        }

        #[tokio::test]
        async fn test_repeated_cursor_stops() {
            let server = FakeServer::new()
                .tools(r#"{"tools":[{"name":"a"}],"nextCursor":"same"}"#);
            let tools = discover(server, 10).await;
            assert_eq!(tools.len(), 1);
        }
    }
}
