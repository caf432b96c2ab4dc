//! Graceful shutdown: one cancellation token shared by every long-running
//! task, cancelled on ctrl+c or SIGTERM.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
}

impl ShutdownManager {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            cancel_token,
            task_handles: Vec::new(),
            grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Track a task so shutdown waits for it.
    pub fn register_task(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.task_handles.push((name, handle));
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Block until a shutdown signal arrives (or the token is cancelled
    /// elsewhere), then stop every registered task.
    pub async fn wait_for_shutdown(self) {
        tokio::select! {
            _ = shutdown_signal() => tracing::info!("🛑 Shutdown signal received"),
            _ = self.cancel_token.cancelled() => tracing::info!("🛑 Shutdown requested"),
        }
        self.shutdown().await;
    }

    /// Cancel the token and wait up to the grace period for tasks to finish.
    pub async fn shutdown(mut self) {
        self.cancel_token.cancel();

        let handles = std::mem::take(&mut self.task_handles);
        let pending = std::pin::pin!(async {
            for (name, handle) in handles {
                if let Err(e) = handle.await {
                    tracing::warn!("Task {} ended abnormally: {}", name, e);
                }
            }
        });

        match tokio::time::timeout(self.grace, pending).await {
            Ok(()) => tracing::info!("✓ All tasks shut down gracefully"),
            Err(_) => tracing::warn!("⏱️  Shutdown timeout: some tasks did not complete"),
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        tracing::error!("Failed to listen for ctrl+c: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
