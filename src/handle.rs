use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::runner::Runner;

/// Handle for controlling a connector running in the background
pub struct ConnectorHandle {
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) task_handle: JoinHandle<Result<()>>,
}

impl ConnectorHandle {
    pub(crate) fn new(shutdown_tx: broadcast::Sender<()>, task_handle: JoinHandle<Result<()>>) -> Self {
        Self {
            shutdown_tx,
            task_handle,
        }
    }

    /// Gracefully shutdown the connector and wait for completion
    pub async fn shutdown_and_wait(self) -> Result<()> {
        info!("🛑 Initiating graceful shutdown...");
        let _ = self.shutdown_tx.send(());

        match self.task_handle.await {
            Ok(result) => {
                info!("✅ Connector task finished");
                result
            }
            Err(e) => {
                if e.is_cancelled() {
                    info!("✅ Connector task finished (cancelled)");
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("Failed to join connector task: {}", e))
                }
            }
        }
    }

    /// Send shutdown signal without waiting
    pub fn shutdown(&self) {
        info!("🛑 Sending shutdown signal...");
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }
}

/// Drive `runner` on a background task
pub fn spawn_runner<R>(runner: R) -> ConnectorHandle
where
    R: Runner + 'static,
{
    let (shutdown_tx, _) = broadcast::channel(1);
    let signal = shutdown_tx.clone();
    let task_handle = tokio::spawn(async move { runner.run_with_shutdown_signal(signal).await });
    ConnectorHandle::new(shutdown_tx, task_handle)
}
