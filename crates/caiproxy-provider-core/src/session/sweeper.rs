use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::SessionRegistry;

impl SessionRegistry {
    /// Run [`SessionRegistry::sweep`] every `interval` until a message arrives on
    /// the returned sender (or it is dropped); then release every live session.
    pub fn spawn_sweeper(&self, interval: Duration) -> (JoinHandle<()>, mpsc::Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = registry.sweep().await;
                        if report.sessions_evicted + report.conversations_expired + report.slots_removed > 0 {
                            debug!(
                                event = "registry_swept",
                                sessions_evicted = report.sessions_evicted,
                                conversations_expired = report.conversations_expired,
                                slots_removed = report.slots_removed,
                                busy = report.busy
                            );
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            let closed = registry.close_all().await;
            info!(event = "registry_closed", sessions_released = closed);
        });
        (handle, shutdown_tx)
    }
}
