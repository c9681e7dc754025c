//! Scripted `/bin/sh` tool-provider doubles for process-level tests.
//!
//! Each double reads request lines from stdin, pulls the numeric id off the
//! front of the line (requests serialize as `{"jsonrpc":"2.0","id":N,...}`),
//! and answers with the first canned result whose pattern matches the line.

use super::types::ServerConfig;

const INITIALIZE_RESULT: &str =
    r#"{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"fake","version":"0.0.1"}}"#;

/// `sed` expression extracting the numeric request id from a request line.
pub const ID_SED: &str = r#"s/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\).*/\1/p"#;

/// Builder for a scripted server.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    startup_delay: Option<f64>,
    cases: Vec<(String, String, Option<f64>)>,
    exit_after: Option<u32>,
    ignore_sigterm: bool,
    linger: Option<f64>,
    raw: Option<String>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A server that never reads stdin and never answers.
    pub fn hanging() -> Self {
        Self::raw("exec sleep 60")
    }

    /// A server running an arbitrary script.
    pub fn raw(script: &str) -> Self {
        Self {
            raw: Some(script.to_string()),
            ..Self::default()
        }
    }

    /// Sleep before answering anything.
    pub fn delay(mut self, seconds: f64) -> Self {
        self.startup_delay = Some(seconds);
        self
    }

    /// Answer `tools/list` with this raw JSON result.
    pub fn tools(self, result: &str) -> Self {
        self.respond(r#""method":"tools/list""#, result)
    }

    /// Answer `tools/list` requests carrying `cursor` with this result.
    pub fn page(self, cursor: &str, result: &str) -> Self {
        self.respond(&format!(r#""cursor":"{cursor}""#), result)
    }

    /// Answer requests whose line contains `pattern` with `result`.
    ///
    /// Earlier cases win, so register cursor-specific pages before `tools`.
    pub fn respond(mut self, pattern: &str, result: &str) -> Self {
        self.cases.push((pattern.to_string(), result.to_string(), None));
        self
    }

    /// Like `respond`, but sleep before answering.
    pub fn respond_slowly(mut self, pattern: &str, seconds: f64, result: &str) -> Self {
        self.cases
            .push((pattern.to_string(), result.to_string(), Some(seconds)));
        self
    }

    /// Exit (closing stdout) on the request after `answered` responses.
    pub fn exit_after(mut self, answered: u32) -> Self {
        self.exit_after = Some(answered);
        self
    }

    pub fn ignore_sigterm(mut self) -> Self {
        self.ignore_sigterm = true;
        self
    }

    /// Keep running this long after stdin closes.
    pub fn linger(mut self, seconds: f64) -> Self {
        self.linger = Some(seconds);
        self
    }

    pub fn script(&self) -> String {
        if let Some(raw) = &self.raw {
            return raw.clone();
        }

        let mut script = String::new();
        if self.ignore_sigterm {
            script.push_str("trap '' TERM\n");
        }
        if let Some(delay) = self.startup_delay {
            script.push_str(&format!("sleep {delay}\n"));
        }
        script.push_str(&format!("ID_PATTERN='{ID_SED}'\n"));
        script.push_str("n=0\n");
        script.push_str("while IFS= read -r line; do\n");
        script.push_str("  id=$(printf '%s' \"$line\" | sed -n \"$ID_PATTERN\")\n");
        script.push_str("  [ -z \"$id\" ] && continue\n");
        if let Some(limit) = self.exit_after {
            script.push_str(&format!("  [ \"$n\" -ge {limit} ] && exit 0\n"));
        }
        script.push_str("  n=$((n+1))\n");
        script.push_str("  case \"$line\" in\n");
        script.push_str(&format!(
            "    *'\"method\":\"initialize\"'*) result='{INITIALIZE_RESULT}' ;;\n"
        ));
        for (pattern, result, delay) in &self.cases {
            let pause = delay.map(|d| format!("sleep {d}; ")).unwrap_or_default();
            script.push_str(&format!("    *'{pattern}'*) {pause}result='{result}' ;;\n"));
        }
        script.push_str(
            "    *) printf '{\"jsonrpc\":\"2.0\",\"id\":%s,\"error\":{\"code\":-32601,\"message\":\"Method not found\"}}\\n' \"$id\"; continue ;;\n",
        );
        script.push_str("  esac\n");
        script.push_str(
            "  printf '{\"jsonrpc\":\"2.0\",\"id\":%s,\"result\":%s}\\n' \"$id\" \"$result\"\n",
        );
        script.push_str("done\n");
        if let Some(linger) = self.linger {
            script.push_str(&format!("sleep {linger}\n"));
        }
        script
    }

    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), self.script()],
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_orders_cases() {
        let script = FakeServer::new()
            .page("p2", "[]")
            .tools(r#"{"tools":[]}"#)
            .script();
        let page = script.find("cursor").unwrap();
        let list = script.find("tools/list").unwrap();
        assert!(page < list);
    }
}
