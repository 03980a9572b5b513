//! WebSocket client registry with per-session event routing.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use plantsim_core::ids::SessionId;

/// Opaque per-connection id.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self(format!("client_{}", uuid::Uuid::now_v7()))
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct Client {
    tx: mpsc::Sender<String>,
    session: RwLock<Option<SessionId>>,
}

/// Tracks connected WebSocket clients and which session each one watches.
pub struct ClientRegistry {
    clients: DashMap<ClientId, Arc<Client>>,
    max_send_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection; returns its id and the outbound queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        self.clients.insert(
            id.clone(),
            Arc::new(Client {
                tx,
                session: RwLock::new(None),
            }),
        );
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) {
        self.clients.remove(id);
    }

    /// Point a client's event subscription at a session.
    pub fn set_session(&self, client_id: &ClientId, session_id: SessionId) {
        if let Some(client) = self.clients.get(client_id) {
            *client.session.write() = Some(session_id);
        }
    }

    /// Queue a message for one client. A full queue drops the message.
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        let Some(client) = self.clients.get(client_id) else {
            return false;
        };
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "client send queue rejected message");
                false
            }
        }
    }

    /// Fan a message out to every client watching the session.
    pub fn broadcast_to_session(&self, session_id: &SessionId, message: &str) {
        for entry in self.clients.iter() {
            let watching = entry.value().session.read().as_ref() == Some(session_id);
            if watching {
                let _ = entry.value().tx.try_send(message.to_string());
            }
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }
}

/// Pump one WebSocket connection: outbound queue to the socket, inbound
/// text frames to the RPC processor.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut queue: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    message_tx: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_id = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = queue.recv().await {
            if ws_tx.send(Message::Text(message.into())).await.is_err() {
                debug!(client_id = %writer_id, "websocket writer closed");
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if message_tx.send((client_id.clone(), text.to_string())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    registry.unregister(&client_id);
    writer.abort();
    info!(client_id = %client_id, "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_send() {
        let registry = ClientRegistry::new(8);
        let (id, mut rx) = registry.register();
        assert_eq!(registry.count(), 1);

        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_false() {
        let registry = ClientRegistry::new(8);
        assert!(!registry.send_to(&ClientId::new(), "hello".into()));
    }

    #[tokio::test]
    async fn broadcast_reaches_only_watchers() {
        let registry = ClientRegistry::new(8);
        let (watcher, mut watcher_rx) = registry.register();
        let (other, mut other_rx) = registry.register();

        let session = SessionId::new();
        registry.set_session(&watcher, session.clone());
        registry.set_session(&other, SessionId::new());

        registry.broadcast_to_session(&session, "event");
        assert_eq!(watcher_rx.recv().await.unwrap(), "event");
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_removes_client() {
        let registry = ClientRegistry::new(8);
        let (id, _rx) = registry.register();
        registry.unregister(&id);
        assert_eq!(registry.count(), 0);
        assert!(!registry.send_to(&id, "x".into()));
    }

    #[tokio::test]
    async fn full_queue_drops_message() {
        let registry = ClientRegistry::new(1);
        let (id, _rx) = registry.register();
        assert!(registry.send_to(&id, "first".into()));
        // Queue capacity 1, nothing consumed: the second send is dropped
        assert!(!registry.send_to(&id, "second".into()));
    }
}
