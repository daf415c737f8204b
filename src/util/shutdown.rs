//! Graceful shutdown handling.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Process-wide shutdown signal.
///
/// Child tokens let a subsystem be stopped on its own while still
/// following the process shutdown.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    /// Create a new shutdown signal manager.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// A token cancelled when shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled on shutdown or when cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Trigger shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until shutdown is triggered.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// A spawned background task paired with the token that stops it.
pub struct ServiceHandle {
    name: &'static str,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn new(name: &'static str, token: CancellationToken, join: JoinHandle<()>) -> Self {
        Self { name, token, join }
    }

    /// Spawn `task` with a fresh child token of `parent`.
    pub fn spawn<F, Fut>(name: &'static str, parent: &CancellationToken, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let join = tokio::spawn(task(token.clone()));
        Self { name, token, join }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            if e.is_panic() {
                warn!(service = self.name, error = %e, "service task panicked");
            }
        }
    }
}
