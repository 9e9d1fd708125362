//! Graceful shutdown: one cancellation token plus an owned set of
//! long-lived worker handles, drained with a bounded wait.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long `drain` waits for tracked workers before abandoning them.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Owns the broker's shutdown signal and its background workers.
///
/// Long-lived workers (the webhook dispatcher) register their handle via
/// [`track`](Self::track); per-connection sessions only hold a token and
/// exit on cancellation without being tracked. `drain` cancels the token
/// and waits for the tracked workers, abandoning any that outlive the
/// timeout. In-flight webhook retries are abandoned, not awaited to
/// completion.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked workers.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Register a worker whose completion `drain` should wait for.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.workers.lock().push(handle);
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token and wait up to `timeout` for the tracked workers.
    pub async fn drain(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DRAIN_TIMEOUT);
        self.shutdown();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        info!(
            worker_count = workers.len(),
            timeout_secs = timeout.as_secs(),
            "draining workers"
        );
        let all = futures::future::join_all(workers);
        if tokio::time::timeout(timeout, all).await.is_err() {
            warn!("drain timed out after {timeout:?}, abandoning remaining workers");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
