use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Fixed-delay background action on its own tokio task.
///
/// The next run starts `interval` after the previous one finished, so a slow
/// action never overlaps itself.
#[derive(Debug)]
pub struct ScheduledAction {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ScheduledAction {
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            debug!(action = %task_name, interval_ms = interval.as_millis() as u64, "⏱️ Scheduled action started");
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {
                        action().await;
                    }
                }
            }
            debug!(action = %task_name, "Scheduled action stopped");
        });

        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Signal the loop and wait for the in-progress run to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(action = %self.name, error = %e, "Scheduled action ended abnormally");
        }
        info!(action = %self.name, "🛑 Scheduled action shut down");
    }
}
