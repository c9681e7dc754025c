pub mod mcp_client;

use std::path::{Path, PathBuf};

pub use mcp_client::{McpClient, McpError};

/// Return the platform-standard data directory for mcp-fleet.
///
/// - macOS: `~/Library/Application Support/mcp-fleet/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-fleet\`
/// - Linux: `$XDG_DATA_HOME/mcp-fleet/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-fleet/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-fleet");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-fleet")
}

/// Default log file location under [`data_dir`].
pub fn default_log_path() -> PathBuf {
    data_dir().join("fleet.log")
}

/// Initialize the tracing subscriber.
///
/// With `log_path`, existing logs are rotated (fleet.log → fleet.log.1 → .2
/// → .3, keeps last 3) and a fresh file is opened with a line-flushing
/// writer. Without it, logs go to stderr so stdout stays free for output.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing(log_path: Option<&Path>) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let (writer, ansi) = match log_path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, 3);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_fleet=info,warn"));

    // A subscriber may already be installed (tests, embedding hosts).
    let _ = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path.map(|p| p.display().to_string()),
        pid = std::process::id(),
        "=== mcp-fleet starting ==="
    );
    Ok(())
}

/// Rotate log files: `fleet.log` → `fleet.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// The fleet may be torn down by the shutdown exit hatch, which skips
/// destructors; each log line must already be on disk by then.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_rotate_log_file_shifts_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("fleet.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("fleet.log.1"), "older").unwrap();
        std::fs::write(dir.path().join("fleet.log.3"), "oldest").unwrap();

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("fleet.log.1"), "current");
        assert_eq!(read("fleet.log.2"), "older");
        assert!(!dir.path().join("fleet.log.3").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line one\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn test_default_log_path() {
        assert!(default_log_path().ends_with("fleet.log"));
    }
}
