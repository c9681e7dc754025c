//! Server process supervision.
//!
//! Owns one child process: spawning it with the right environment, checking
//! liveness, and tearing it down (SIGTERM, bounded wait, then SIGKILL).

use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use super::errors::McpError;
use super::types::ServerConfig;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Region injected for cloud-flavored servers when the host has none.
const DEFAULT_REGION: &str = "us-east-1";

/// Variables that quiet common server frameworks. Anything other than
/// protocol lines on the child's stdout corrupts the wire format.
const QUIET_LOG_VARS: &[(&str, &str)] = &[
    ("PYTHONWARNINGS", "ignore"),
    ("LOGURU_LEVEL", "ERROR"),
    ("LOG_LEVEL", "ERROR"),
    ("FASTMCP_LOG_LEVEL", "ERROR"),
];

/// How many trailing stderr lines are kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Cap on the stderr excerpt attached to error messages.
const STDERR_EXCERPT_CHARS: usize = 2000;

/// Upper bound on reaping a process after SIGKILL.
const KILL_REAP_TIMEOUT: Duration = Duration::from_millis(250);

// ─── Environment ─────────────────────────────────────────────────────────────

/// Whether a server talks to a cloud provider and needs a region.
fn is_cloud_flavored(name: &str, config: &ServerConfig) -> bool {
    name.to_lowercase().contains("aws")
        || config.args.iter().any(|a| a.to_lowercase().contains("aws"))
}

/// Compute the variables to set on top of the inherited host environment.
///
/// Precedence, lowest first: injected region defaults, the host environment,
/// the server's own `env`, then quiet-logging defaults for anything still unset.
pub fn environment_overlay<F>(
    name: &str,
    config: &ServerConfig,
    host_var: F,
) -> BTreeMap<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut overlay = BTreeMap::new();

    if is_cloud_flavored(name, config) {
        for key in ["AWS_REGION", "AWS_DEFAULT_REGION"] {
            if host_var(key).is_none() {
                overlay.insert(key.to_string(), DEFAULT_REGION.to_string());
            }
        }
    }

    for (key, value) in &config.env {
        overlay.insert(key.clone(), value.clone());
    }

    for (key, value) in QUIET_LOG_VARS {
        if host_var(key).is_none() && !overlay.contains_key(*key) {
            overlay.insert((*key).to_string(), (*value).to_string());
        }
    }

    overlay
}

// ─── ManagedProcess ──────────────────────────────────────────────────────────

/// A supervised child process.
///
/// The child is killed if this handle is dropped, so abandoning a handle
/// (e.g. in a timed-out startup task) never leaks the process.
pub struct ManagedProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

/// Pipes handed to the transport after a successful spawn.
pub struct ProcessPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl ManagedProcess {
    /// Launch a server process with stdio wired for JSON-RPC.
    pub fn spawn(
        name: &str,
        config: &ServerConfig,
        working_dir: Option<&str>,
    ) -> Result<(Self, ProcessPipes), McpError> {
        if config.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("server '{name}' has no command"),
            });
        }

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.envs(environment_overlay(name, config, |key| std::env::var(key).ok()));

        // Per-server cwd overrides the fleet-wide working_dir
        if let Some(dir) = config.cwd.as_deref().or(working_dir) {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(name.to_string(), stderr, Arc::clone(&stderr_tail)));
        }

        let pid = child.id();
        tracing::info!(server = name, pid, command = %config.command, "spawned server process");

        Ok((
            Self {
                name: name.to_string(),
                child,
                pid,
                stderr_tail,
            },
            ProcessPipes { stdin, stdout },
        ))
    }

    /// OS process id, captured at spawn.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Last lines the child wrote to stderr, truncated for log messages.
    pub fn stderr_excerpt(&self) -> String {
        let lines = match self.stderr_tail.lock() {
            Ok(tail) => tail.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => return String::new(),
        };
        truncate_excerpt(lines)
    }

    /// Ask the process to exit, then force it after `grace`.
    ///
    /// Returns within `grace` plus a short reap bound whether or not the
    /// child actually exited; the handle is considered released afterwards.
    pub async fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        self.send_sigterm();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, pid = self.pid, %status, "server exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.name,
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "server ignored terminate, killing"
                );
                self.kill().await;
            }
        }
    }

    /// Hard kill with a bounded reap.
    pub async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = tokio::time::timeout(KILL_REAP_TIMEOUT, self.child.wait()).await;
    }

    #[cfg(unix)]
    fn send_sigterm(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(server = %self.name, pid, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn send_sigterm(&self) {
        // No cooperative signal here; the grace wait still lets a process
        // that is already exiting finish before the kill.
    }
}

/// Forward child stderr to tracing and keep the tail for diagnostics.
async fn drain_stderr(name: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %name, stderr = %line, "server stderr");
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

fn truncate_excerpt(mut text: String) -> String {
    if text.len() > STDERR_EXCERPT_CHARS {
        let mut cut = STDERR_EXCERPT_CHARS;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("...(truncated)");
    }
    text
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;

    fn command_config(command: &str, args: &[&str]) -> ServerConfig {
        ServerConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_overlay_injects_region_for_aws_servers() {
        let config = command_config("uvx", &["awslabs.eks-mcp-server@latest"]);
        let overlay = environment_overlay("eks", &config, |_| None);
        assert_eq!(overlay["AWS_REGION"], DEFAULT_REGION);
        assert_eq!(overlay["AWS_DEFAULT_REGION"], DEFAULT_REGION);
        assert_eq!(overlay["LOG_LEVEL"], "ERROR");
    }

    #[test]
    fn test_overlay_respects_host_region() {
        let config = command_config("uvx", &[]);
        let overlay = environment_overlay("aws-docs", &config, |key| {
            (key == "AWS_REGION").then(|| "eu-west-1".to_string())
        });
        assert!(!overlay.contains_key("AWS_REGION"));
        assert_eq!(overlay["AWS_DEFAULT_REGION"], DEFAULT_REGION);
    }

    #[test]
    fn test_overlay_server_env_wins() {
        let mut config = command_config("node", &["server.js"]);
        config.env = HashMap::from([
            ("LOG_LEVEL".to_string(), "DEBUG".to_string()),
            ("AWS_REGION".to_string(), "ap-south-1".to_string()),
        ]);
        let overlay = environment_overlay("aws-x", &config, |_| None);
        assert_eq!(overlay["LOG_LEVEL"], "DEBUG");
        assert_eq!(overlay["AWS_REGION"], "ap-south-1");
    }

    #[test]
    fn test_overlay_skips_region_for_plain_servers() {
        let overlay = environment_overlay("filesystem", &command_config("npx", &["fs"]), |_| None);
        assert!(!overlay.contains_key("AWS_REGION"));
        assert_eq!(overlay["FASTMCP_LOG_LEVEL"], "ERROR");
    }

    #[test]
    fn test_truncate_excerpt() {
        let long = "x".repeat(STDERR_EXCERPT_CHARS + 10);
        let out = truncate_excerpt(long);
        assert!(out.ends_with("...(truncated)"));
        assert_eq!(format_stderr_suffix("  "), "");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = command_config("/nonexistent/ghost-server", &[]);
        let result = ManagedProcess::spawn("ghost", &config, None);
        assert!(matches!(result, Err(McpError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_spawn_empty_command_is_config_error() {
        let result = ManagedProcess::spawn("blank", &command_config("  ", &[]), None);
        assert!(matches!(result, Err(McpError::ConfigError { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_cooperative_process() {
        let config = command_config("sh", &["-c", "exec sleep 30"]);
        let (mut process, _pipes) = ManagedProcess::spawn("sleeper", &config, None).unwrap();
        assert!(process.is_alive());
        assert!(process.pid().is_some());

        let start = Instant::now();
        process.terminate(Duration::from_secs(2)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!process.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_kills_process_ignoring_sigterm() {
        let script = "trap '' TERM; while true; do sleep 0.1; done";
        let config = command_config("sh", &["-c", script]);
        let (mut process, _pipes) = ManagedProcess::spawn("stubborn", &config, None).unwrap();
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let grace = Duration::from_millis(300);
        let start = Instant::now();
        process.terminate(grace).await;
        assert!(start.elapsed() < grace + KILL_REAP_TIMEOUT + Duration::from_millis(200));
        assert!(!process.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_is_captured() {
        let (mut process, _pipes) = ManagedProcess::spawn(
            "noisy",
            &command_config("sh", &["-c", "echo boom >&2; exec sleep 5"]),
            None,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(process.stderr_excerpt().contains("boom"));
        process.kill().await;
    }
}
