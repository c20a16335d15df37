use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use confab_core::ids::ClientId;

/// A connected WebSocket client.
pub struct Client {
    pub id: ClientId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket clients.
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

    /// Register a new client and return its id and outbound queue. The queue
    /// holds `max_send_queue` frames plus one slot kept for resync notices.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue.max(1) + 1);
        let _ = self.clients.insert(id.clone(), Arc::new(Client::new(id.clone(), tx)));
        (id, rx)
    }

    pub fn unregister(&self, id: &ClientId) -> bool {
        match self.clients.remove(id) {
            Some((_, client)) => {
                client.connected.store(false, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    /// Queue a frame for one client. A full queue drops the frame; the last
    /// slot is left free for [`send_reserved`](Self::send_reserved).
    pub fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        self.enqueue(client_id, message, 2)
    }

    /// Queue a frame that may take the reserved slot. Used for resync
    /// notices after a dropped frame.
    pub fn send_reserved(&self, client_id: &ClientId, message: String) -> bool {
        self.enqueue(client_id, message, 1)
    }

    fn enqueue(&self, client_id: &ClientId, message: String, min_free: usize) -> bool {
        let Some(client) = self.clients.get(client_id).map(|c| Arc::clone(c.value())) else {
            return false;
        };
        if !client.is_connected() {
            return false;
        }
        if client.tx.capacity() < min_free {
            warn!(client_id = %client_id, msg_len = message.len(), "send queue full, dropping frame");
            return false;
        }
        match client.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(client_id = %client_id, msg_len = msg.len(), "send queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame for every connected client.
    pub fn broadcast(&self, message: &str) -> usize {
        let ids: Vec<ClientId> = self.clients.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.send_to(id, message.to_string()))
            .count()
    }

    pub fn record_pong(&self, client_id: &ClientId) {
        if let Some(client) = self.clients.get(client_id) {
            client.record_pong();
        }
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that have not answered a ping within `timeout`.
    pub fn cleanup_dead_clients(&self, timeout: Duration) -> Vec<ClientId> {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|entry| !entry.value().is_alive(timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &dead {
            let _ = self.unregister(id);
            info!(client_id = %id, "cleaned up dead client");
        }
        dead
    }
}

/// Drive one WebSocket: a writer draining the client's queue with periodic
/// pings, and a reader forwarding text frames to the RPC processor.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
    heartbeat: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_cid = client_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    trace!(client_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if on_message.send((reader_cid.clone(), text.to_string())).await.is_err() {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_registry.record_pong(&reader_cid),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    let _ = registry.unregister(&client_id);
}

/// Periodically drop clients that stopped answering pings. `on_dead` runs
/// for each removed client.
pub fn start_cleanup_task<F>(
    registry: Arc<ClientRegistry>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
    on_dead: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(&ClientId) + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = registry.cleanup_dead_clients(timeout);
                    for id in &removed {
                        on_dead(id);
                    }
                    if !removed.is_empty() {
                        info!(removed = removed.len(), "dead client cleanup");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new(32);
        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);
        assert_ne!(id1, id2);

        assert!(registry.unregister(&id1));
        assert!(!registry.unregister(&id1));
        assert!(!registry.contains(&id1));
        assert!(registry.contains(&id2));
    }

    #[tokio::test]
    async fn send_to_specific_client() {
        let registry = ClientRegistry::new(32);
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
        assert!(!registry.send_to(&ClientId::new(), "x".into()));
    }

    #[test]
    fn full_queue_drops_but_keeps_a_reserved_slot() {
        let registry = ClientRegistry::new(2);
        let (id, mut rx) = registry.register();
        assert!(registry.send_to(&id, "1".into()));
        assert!(registry.send_to(&id, "2".into()));
        assert!(!registry.send_to(&id, "3".into()));

        assert!(registry.send_reserved(&id, "resync".into()));
        assert!(!registry.send_reserved(&id, "again".into()));
        let drained: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(drained, vec!["1", "2", "resync"]);
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let registry = ClientRegistry::new(8);
        let (_a, mut rx_a) = registry.register();
        let (_b, mut rx_b) = registry.register();
        assert_eq!(registry.broadcast("ping"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "ping");
        assert_eq!(rx_b.try_recv().unwrap(), "ping");
    }

    #[test]
    fn cleanup_removes_silent_clients() {
        let registry = ClientRegistry::new(8);
        let (id, _rx) = registry.register();
        let (_fresh, _rx2) = registry.register();
        registry
            .clients
            .get(&id)
            .unwrap()
            .last_pong
            .store(0, Ordering::Relaxed);

        let removed = registry.cleanup_dead_clients(Duration::from_secs(90));
        assert_eq!(removed, vec![id]);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn pong_keeps_client_alive() {
        let (tx, _rx) = mpsc::channel(1);
        let client = Client::new(ClientId::new(), tx);
        client.last_pong.store(0, Ordering::Relaxed);
        assert!(!client.is_alive(Duration::from_secs(90)));
        client.record_pong();
        assert!(client.is_alive(Duration::from_secs(90)));
    }
}
