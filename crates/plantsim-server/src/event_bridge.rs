use std::sync::Arc;

use tokio::sync::broadcast;

use plantsim_core::messages::PoolEvent;

use crate::client::ClientRegistry;

/// Subscribes to the pool's event bus and forwards each event to the
/// WebSocket clients watching that session.
pub struct EventBridge {
    registry: Arc<ClientRegistry>,
}

impl EventBridge {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Start the bridge. Spawns a task that reads from the broadcast channel
    /// and sends serialized events to matching WebSocket clients.
    pub fn start(&self, mut rx: broadcast::Receiver<PoolEvent>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let session_id = event.session_id().clone();
                        if let Ok(json) = serde_json::to_string(&event) {
                            registry.broadcast_to_session(&session_id, &json);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event bridge lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create an event bridge wired to a broadcast channel.
pub fn create_bridge(
    registry: Arc<ClientRegistry>,
    rx: broadcast::Receiver<PoolEvent>,
) -> tokio::task::JoinHandle<()> {
    let bridge = EventBridge::new(registry);
    bridge.start(rx)
}
