//! Start/stop plumbing shared by the long-running workers.

use std::future::Future;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the task of one worker.
///
/// `start` and `stop` are idempotent. `stop` signals the task through its
/// cancellation token and waits until the task returns, so the work unit in
/// flight is always finished.
pub struct WorkerLifecycle {
    name: &'static str,
    running: Mutex<Option<Running>>,
}

impl WorkerLifecycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
        }
    }

    /// Spawn `run` unless the worker is already running.
    pub async fn start<F, Fut>(&self, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::debug!(worker = self.name, "Worker already running");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(token.clone()));
        *running = Some(Running { token, handle });
        tracing::info!(worker = self.name, "Worker started");
    }

    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.token.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(worker = self.name, error = %e, "Worker task failed");
        }
        tracing::info!(worker = self.name, "Worker stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let lifecycle = WorkerLifecycle::new("test");
        let spawned = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let spawned = spawned.clone();
            lifecycle
                .start(move |token| async move {
                    spawned.fetch_add(1, Ordering::SeqCst);
                    token.cancelled().await;
                })
                .await;
        }
        assert!(lifecycle.is_running().await);
        assert_eq!(spawned.load(Ordering::SeqCst), 1);

        lifecycle.stop().await;
        lifecycle.stop().await;
        assert!(!lifecycle.is_running().await);
    }

    #[tokio::test]
    async fn test_stop_waits_for_work_in_flight() {
        let lifecycle = WorkerLifecycle::new("test");
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();

        lifecycle
            .start(move |token| async move {
                token.cancelled().await;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        lifecycle.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let lifecycle = WorkerLifecycle::new("test");
        lifecycle.start(|token| async move { token.cancelled().await }).await;
        lifecycle.stop().await;
        lifecycle.start(|token| async move { token.cancelled().await }).await;
        assert!(lifecycle.is_running().await);
        lifecycle.stop().await;
    }
}
