//! Fleet teardown.
//!
//! Every server is closed and terminated on its own task so one stubborn
//! child cannot hold up the others. The whole pass runs under a hard
//! deadline; if it expires, the exit hatch fires and the host process leaves
//! without waiting for the stragglers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use super::lifecycle::ManagedServer;

type ExitHatch = Box<dyn Fn() + Send + Sync>;

/// How a shutdown pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every server was terminated within the deadline.
    Completed,
    /// The deadline expired and the exit hatch was fired.
    DeadlineExceeded,
    /// An earlier call already ran the teardown.
    AlreadyDone,
}

pub struct ShutdownCoordinator {
    grace: Duration,
    deadline: Duration,
    done: AtomicBool,
    exit_hatch: ExitHatch,
}

impl ShutdownCoordinator {
    /// A coordinator whose exit hatch ends the host process.
    pub fn new(grace: Duration, deadline: Duration) -> Self {
        Self {
            grace,
            deadline,
            done: AtomicBool::new(false),
            exit_hatch: Box::new(|| std::process::exit(0)),
        }
    }

    /// Replace the exit hatch, e.g. to observe it instead of exiting.
    pub fn with_exit_hatch(mut self, hatch: impl Fn() + Send + Sync + 'static) -> Self {
        self.exit_hatch = Box::new(hatch);
        self
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Tear down `servers`. Only the first call does any work.
    pub async fn shutdown(&self, servers: Vec<Arc<ManagedServer>>) -> ShutdownOutcome {
        if self.done.swap(true, Ordering::SeqCst) {
            tracing::debug!("shutdown already ran, skipping");
            return ShutdownOutcome::AlreadyDone;
        }

        let started = Instant::now();
        let count = servers.len();
        let grace = self.grace;
        let tasks: Vec<_> = servers
            .into_iter()
            .map(|server| {
                tokio::spawn(async move {
                    server.shutdown(grace).await;
                    tracing::debug!(server = %server.name, "server stopped");
                })
            })
            .collect();

        match tokio::time::timeout(self.deadline, join_all(tasks)).await {
            Ok(_) => {
                tracing::info!(
                    servers = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "all servers shut down"
                );
                ShutdownOutcome::Completed
            }
            Err(_) => {
                tracing::warn!(
                    servers = count,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "shutdown deadline exceeded, forcing exit"
                );
                (self.exit_hatch)();
                ShutdownOutcome::DeadlineExceeded
            }
        }
    }
}
