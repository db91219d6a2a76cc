// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Live model-list connections.
//!
//! Every client connection is represented by an outbound channel whose
//! receiving end is drained by a writer task owning the socket. The hub never
//! touches sockets itself: a failed send means the writer has gone away, and
//! the connection is dropped on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use protocol::{ClientMessage, ModelList, ServerEvent};
use registry::{RegistryError, RegistryService, SubscriberId};

pub type ConnectionId = u64;

/// Outbound half of a connection, as handed to [`ConnectionHub::register`].
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Registered, `init` not yet delivered.
    Connecting,
    /// Receives broadcasts.
    Open,
    /// Unregistered or pruned after a failed send. Terminal.
    Closed,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("connection {0} is not open")]
    NotOpen(ConnectionId),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

struct Connection {
    state: ConnectionState,
    outbound: EventSender,
}

struct HubInner {
    registry: RegistryService,
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
    subscription: StdMutex<Option<SubscriberId>>,
}

/// Tracks open client connections and fans registry changes out to them.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

impl ConnectionHub {
    pub fn new(registry: RegistryService) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry,
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                subscription: StdMutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> &RegistryService {
        &self.inner.registry
    }

    /// Subscribe to registry changes and start the broadcaster task.
    ///
    /// The registry callback only enqueues the new list; a single task
    /// drains the queue, so broadcasts go out in version order and never
    /// run inside the registry's mutation lock. Calling this twice is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn attach(&self) {
        let mut subscription = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if subscription.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ModelList>();
        let id = self.inner.registry.subscribe(move |list| {
            tx.send(list.clone())
                .map_err(|_| anyhow::anyhow!("hub broadcaster has stopped"))
        });
        *subscription = Some(id);

        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(list) = rx.recv().await {
                let version = list.version;
                let delivered = hub.broadcast(ServerEvent::ModelAdded { data: list }).await;
                debug!(
                    "broadcast registry version {} to {} connection(s)",
                    version, delivered
                );
            }
            info!("hub broadcaster exiting");
        });
    }

    /// Stop receiving registry changes. The broadcaster exits once its
    /// queue is drained.
    pub fn detach(&self) {
        let taken = self
            .inner
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = taken {
            self.inner.registry.unsubscribe(id);
        }
    }

    /// Add a connection and deliver its `init` snapshot.
    ///
    /// The connection table stays write-locked from before the snapshot is
    /// taken until the connection is open, so no broadcast can slip in
    /// between `init` and the first `model_added`.
    pub async fn register(&self, outbound: EventSender) -> Result<ConnectionId, HubError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.inner.connections.write().await;
        connections.insert(
            id,
            Connection {
                state: ConnectionState::Connecting,
                outbound: outbound.clone(),
            },
        );

        let data = match self.inner.registry.list_models().await {
            Ok(data) => data,
            Err(e) => {
                connections.remove(&id);
                return Err(e.into());
            }
        };

        if outbound.send(ServerEvent::Init { data }).is_err() {
            connections.remove(&id);
            return Err(HubError::NotOpen(id));
        }
        if let Some(conn) = connections.get_mut(&id) {
            conn.state = ConnectionState::Open;
        }
        info!(
            "hub: connection {} open ({} total)",
            id,
            connections.len()
        );
        Ok(id)
    }

    /// Remove a connection. Returns `false` if it was already gone.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.inner.connections.write().await.remove(&id).is_some();
        if removed {
            info!("hub: connection {} closed", id);
        }
        removed
    }

    pub async fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        if let Some(conn) = self.inner.connections.read().await.get(&id) {
            return Some(conn.state);
        }
        if id > 0 && id < self.inner.next_id.load(Ordering::Relaxed) {
            Some(ConnectionState::Closed)
        } else {
            None
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Send `event` to every open connection, dropping the ones whose send
    /// fails. Returns the number of successful deliveries.
    pub async fn broadcast(&self, event: ServerEvent) -> usize {
        let mut connections = self.inner.connections.write().await;
        let mut delivered = 0;
        connections.retain(|id, conn| {
            if conn.state != ConnectionState::Open {
                return true;
            }
            if conn.outbound.send(event.clone()).is_ok() {
                delivered += 1;
                true
            } else {
                warn!("hub: dropping connection {} after failed send", id);
                false
            }
        });
        delivered
    }

    /// Send `event` to one connection only.
    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> Result<(), HubError> {
        let mut connections = self.inner.connections.write().await;
        let sent = match connections.get(&id) {
            Some(conn) if conn.state == ConnectionState::Open => conn.outbound.send(event).is_ok(),
            _ => return Err(HubError::NotOpen(id)),
        };
        if !sent {
            connections.remove(&id);
            warn!("hub: dropping connection {} after failed send", id);
            return Err(HubError::NotOpen(id));
        }
        Ok(())
    }

    /// Handle one text frame from a client.
    ///
    /// Failures are reported to the sending connection only, as an `error`
    /// event. Success is reported to everyone through the registry
    /// broadcast, including the sender.
    pub async fn handle_client_message(&self, id: ConnectionId, text: &str) -> Result<(), HubError> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("hub: rejecting message from {}: {}", id, e);
                return self
                    .send_to(
                        id,
                        ServerEvent::Error {
                            error: format!("Invalid message: {e}"),
                        },
                    )
                    .await;
            }
        };

        match message {
            ClientMessage::AddModel { name, category } => {
                match self.inner.registry.add_model(&name, category).await {
                    Ok(outcome) => {
                        debug!(
                            "hub: connection {} recorded {} (new: {})",
                            id, name, outcome.is_new
                        );
                        Ok(())
                    }
                    Err(e) => {
                        if !e.is_validation() {
                            warn!("hub: add_model from connection {} failed: {}", id, e);
                        }
                        self.send_to(
                            id,
                            ServerEvent::Error {
                                error: e.to_string(),
                            },
                        )
                        .await
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use protocol::Category;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    fn registry_in(dir: &std::path::Path) -> RegistryService {
        let path = dir.join("models.json");
        std::fs::write(&path, r#"{"official": [], "custom": []}"#).unwrap();
        RegistryService::open(&path).unwrap()
    }

    async fn next(rx: &mut UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn init_is_sent_on_register() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        registry.add_model("gpt-4o", Category::Official).await.unwrap();
        let hub = ConnectionHub::new(registry);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(tx).await.unwrap();

        assert_eq!(hub.state(id).await, Some(ConnectionState::Open));
        match next(&mut rx).await {
            ServerEvent::Init { data } => {
                assert_eq!(data.official, vec!["gpt-4o"]);
                assert_eq!(data.version, 1);
            }
            other => panic!("expected init, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_prunes_failed_connections() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ConnectionHub::new(registry_in(dir.path()));

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        let a = hub.register(tx1).await.unwrap();
        let b = hub.register(tx2).await.unwrap();
        let c = hub.register(tx3).await.unwrap();
        next(&mut rx1).await;
        next(&mut rx3).await;

        drop(rx2);
        let event = ServerEvent::ModelAdded {
            data: ModelList::default(),
        };
        assert_eq!(hub.broadcast(event.clone()).await, 2);

        assert_eq!(next(&mut rx1).await, event);
        assert_eq!(next(&mut rx3).await, event);
        assert_eq!(hub.state(a).await, Some(ConnectionState::Open));
        assert_eq!(hub.state(b).await, Some(ConnectionState::Closed));
        assert_eq!(hub.state(c).await, Some(ConnectionState::Open));
        assert_eq!(hub.connection_count().await, 2);

        // The pruned connection is not tried again.
        let later = ServerEvent::ModelAdded {
            data: ModelList {
                official: vec!["gpt-4o".into()],
                custom: Vec::new(),
                version: 1,
            },
        };
        assert_eq!(hub.broadcast(later.clone()).await, 2);
        assert_eq!(next(&mut rx1).await, later);
        assert_eq!(next(&mut rx3).await, later);
        assert!(rx1.try_recv().is_err());
        assert!(rx3.try_recv().is_err());
        assert_eq!(hub.connection_count().await, 2);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ConnectionHub::new(registry_in(dir.path()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.register(tx).await.unwrap();

        assert!(hub.unregister(id).await);
        assert!(!hub.unregister(id).await);
        assert_eq!(hub.state(id).await, Some(ConnectionState::Closed));
        assert_eq!(hub.state(999).await, None);
    }

    #[tokio::test]
    async fn errors_go_only_to_the_sender() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ConnectionHub::new(registry_in(dir.path()));
        hub.attach();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let sender = hub.register(tx1).await.unwrap();
        hub.register(tx2).await.unwrap();
        next(&mut rx1).await;
        next(&mut rx2).await;

        hub.handle_client_message(sender, r#"{"type": "add_model", "name": " x "}"#)
            .await
            .unwrap();
        hub.handle_client_message(sender, r#"{"type": "add_model", "name": "ok-name", "category": "bogus"}"#)
            .await
            .unwrap();
        hub.handle_client_message(sender, "not json").await.unwrap();

        for _ in 0..3 {
            match next(&mut rx1).await {
                ServerEvent::Error { error } => assert!(!error.is_empty()),
                other => panic!("expected error, got {other:?}"),
            }
        }
        assert!(rx2.try_recv().is_err());
        assert_eq!(hub.registry().version(), 0);
    }

    #[tokio::test]
    async fn successful_add_is_broadcast_to_everyone() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ConnectionHub::new(registry_in(dir.path()));
        hub.attach();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let sender = hub.register(tx1).await.unwrap();
        hub.register(tx2).await.unwrap();
        next(&mut rx1).await;
        next(&mut rx2).await;

        hub.handle_client_message(
            sender,
            r#"{"type": "add_model", "name": "Microsoft/Phi-4", "category": "custom"}"#,
        )
        .await
        .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            match next(rx).await {
                ServerEvent::ModelAdded { data } => {
                    assert_eq!(data.custom, vec!["microsoft/phi-4"]);
                    assert_eq!(data.version, 1);
                }
                other => panic!("expected model_added, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn detach_stops_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ConnectionHub::new(registry_in(dir.path()));
        hub.attach();
        hub.attach();
        assert_eq!(hub.registry().subscriber_count(), 1);

        hub.detach();
        assert_eq!(hub.registry().subscriber_count(), 0);
    }
}
