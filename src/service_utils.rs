use crate::broker_session::{BrokerSession, MessageHandler, SessionError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown signal shared by the session loop, the REST API and `main`.
pub struct Lifecycle {
    shutdown_tx: watch::Sender<bool>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested.");
        self.shutdown_tx.send_replace(true);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the broker session on its own task
pub fn start_broker_session(
    session: Arc<BrokerSession>,
    handler: Arc<dyn MessageHandler>,
    lifecycle: &Lifecycle,
) -> JoinHandle<Result<(), SessionError>> {
    let shutdown = lifecycle.subscribe();
    tokio::spawn(async move { session.run(handler, shutdown).await })
}

/// Waits for Ctrl+C (or SIGTERM on unix).
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to handle termination signal: {:?}", e);
                        }
                    }
                    _ = sigterm.recv() => info!("SIGTERM received."),
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {:?}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to handle termination signal: {:?}", e);
    }
}

/// Waits for the activity recorder to flush queued writes, up to `deadline`.
pub async fn drain_recorder(worker: JoinHandle<()>, deadline: Duration) -> bool {
    match tokio::time::timeout(deadline, worker).await {
        Ok(Ok(())) => {
            info!("Activity recorder drained.");
            true
        }
        Ok(Err(e)) => {
            error!("Activity recorder task failed: {:?}", e);
            false
        }
        Err(_) => {
            warn!(
                "Activity recorder did not drain within {:?}; pending audit events are lost.",
                deadline
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_starts_running() {
        let lifecycle = Lifecycle::new();
        assert!(!*lifecycle.subscribe().borrow());
    }

    #[tokio::test]
    async fn shutdown_reaches_late_subscribers() {
        let lifecycle = Lifecycle::new();
        let early = lifecycle.subscribe();
        lifecycle.shutdown();
        assert!(*early.borrow());
        assert!(*lifecycle.subscribe().borrow());
    }

    #[tokio::test]
    async fn drain_gives_up_after_deadline() {
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        assert!(!drain_recorder(stuck, Duration::from_millis(10)).await);

        let done = tokio::spawn(async {});
        assert!(drain_recorder(done, Duration::from_secs(1)).await);
    }
}
