use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use confab_core::events::EngineEvent;

use crate::hub::SyncHub;

/// Subscribes to the engine's event broadcast and feeds the sync hub.
pub struct EventBridge {
    hub: Arc<SyncHub>,
}

impl EventBridge {
    pub fn new(hub: Arc<SyncHub>) -> Self {
        Self { hub }
    }

    /// Spawn the forwarding task. Lagging behind the broadcast asks every
    /// subscriber to resync, since frames were lost.
    pub fn start(
        &self,
        mut rx: broadcast::Receiver<EngineEvent>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let delivered = hub.publish(&event);
                        tracing::trace!(
                            conversation_id = %event.conversation_id(),
                            event = event.event_type(),
                            delivered,
                            "event forwarded"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event bridge lagged, dropped events");
                        hub.request_resync(n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

pub fn create_bridge(
    hub: Arc<SyncHub>,
    rx: broadcast::Receiver<EngineEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    EventBridge::new(hub).start(rx, cancel)
}
