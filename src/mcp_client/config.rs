//! Servers configuration loading.
//!
//! Reads a JSON or YAML servers file and resolves environment variables.
//! Both `{"mcpServers": {...}}` and `{"servers": {...}}` layouts are accepted.

use std::path::{Path, PathBuf};

use super::errors::McpError;
use super::types::McpServersConfig;

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_FLEET_CONFIG";

/// File names searched for, in order, in each directory.
const CONFIG_FILE_NAMES: &[&str] = &["mcp-servers.json", "mcp-servers.yaml", "mcp-servers.yml"];

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate a servers config file.
///
/// Checks `MCP_FLEET_CONFIG` first, then walks upward from `start`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find any of {}", CONFIG_FILE_NAMES.join(", ")),
    })
}

/// Load and parse a servers configuration file.
///
/// `.yaml` / `.yml` files are parsed as YAML, anything else as JSON.
/// `${VAR_NAME}` and `${VAR_NAME:-default}` are interpolated first.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let config = parse_servers_config(&raw, is_yaml)?;

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        "loaded servers config"
    );
    Ok(config)
}

/// Parse config text after env-var interpolation.
pub fn parse_servers_config(raw: &str, yaml: bool) -> Result<McpServersConfig, McpError> {
    let interpolated = interpolate_env_vars(raw, |name| std::env::var(name).ok());

    let parsed = if yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
    } else {
        serde_json::from_str(&interpolated).map_err(|e| e.to_string())
    };

    parsed.map_err(|e| McpError::ConfigError {
        reason: format!("failed to parse servers config: {e}"),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr, &lookup));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr<F>(expr: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    match expr.split_once(":-") {
        Some((name, default)) => lookup(name).unwrap_or_else(|| expand_tilde(default)),
        None => lookup(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup(name: &str) -> Option<String> {
        (name == "SERVER_ROOT").then(|| "/srv/tools".to_string())
    }

    #[test]
    fn test_interpolate_with_value_and_default() {
        assert_eq!(
            interpolate_env_vars("${SERVER_ROOT:-/fallback}/bin", lookup),
            "/srv/tools/bin"
        );
        assert_eq!(interpolate_env_vars("${MISSING:-/fallback}", lookup), "/fallback");
        assert_eq!(interpolate_env_vars("x${MISSING}y", lookup), "xy");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain $text with no {variables}";
        assert_eq!(interpolate_env_vars(input, lookup), input);
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/servers");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/servers"));
    }

    #[test]
    fn test_parse_mcp_servers_json() {
        let raw = r#"{
            "mcpServers": {
                "files": {
                    "command": "npx",
                    "args": ["-y", "files-server"],
                    "env": {"ROOT": "/tmp"}
                },
                "search": {
                    "command": "uvx",
                    "args": ["search-server"],
                    "knownSlow": true,
                    "disabled": true
                }
            },
            "fleet": {"slow_server_timeout_ms": 1500},
            "enabled_tools": ["read_file"]
        }"#;
        let config = parse_servers_config(raw, false).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers["files"].env["ROOT"], "/tmp");
        assert!(config.servers["search"].known_slow);
        assert!(config.servers["search"].disabled);
        assert_eq!(config.fleet.slow_server_timeout_ms, 1500);
        assert_eq!(config.fleet.startup_timeout_ms, 5000);
        assert_eq!(config.enabled_tools, Some(vec!["read_file".to_string()]));
    }

    #[test]
    fn test_parse_servers_yaml() {
        let raw = r#"servers:
  files:
    command: npx
    args: ["-y", "files-server"]
    timeout_ms: 800
"#;
        let config = parse_servers_config(raw, true).unwrap();
        assert_eq!(config.servers["files"].command, "npx");
        assert_eq!(config.servers["files"].timeout_ms, Some(800));
    }

    #[test]
    fn test_parse_error_is_config_error() {
        let err = parse_servers_config("{not json", false).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "mcpServers:\n  echo:\n    command: echo-server").unwrap();

        let config = load_servers_config(&path).unwrap();
        assert_eq!(config.servers["echo"].command, "echo-server");
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_servers_config(Path::new("/nonexistent/mcp-servers.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mcp-servers.json"), "{}").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_path(&nested).unwrap();
        assert_eq!(found, dir.path().join("mcp-servers.json"));
    }
}
