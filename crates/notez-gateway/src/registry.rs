use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::trace;
use uuid::Uuid;

use notez_types::events::ServerEvent;
use notez_types::models::Identity;

/// Events are shared between every recipient of a fan-out.
pub type EventSender = mpsc::UnboundedSender<Arc<ServerEvent>>;
pub type EventReceiver = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// A live connection as the registry sees it.
#[derive(Debug)]
pub struct ConnectionRecord {
    pub identity: Identity,
    pub rooms: HashSet<Uuid>,
    tx: EventSender,
}

/// Outcome of a point-to-point push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Connections the identity had at the time of the call
    pub attempted: usize,
    /// Connections whose queue accepted the event
    pub delivered: usize,
}

/// Which connections exist, whose they are, and which rooms they joined.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    /// conn_id -> record
    connections: RwLock<HashMap<Uuid, ConnectionRecord>>,

    /// user_id -> conn_ids
    identities: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection. Returns (conn_id, receiver).
    pub async fn register(&self, identity: Identity) -> (Uuid, EventReceiver) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let user_id = identity.user_id;

        self.inner.connections.write().await.insert(
            conn_id,
            ConnectionRecord {
                identity,
                rooms: HashSet::new(),
                tx,
            },
        );
        self.inner
            .identities
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id);

        (conn_id, rx)
    }

    /// Remove a connection. Only the first call for a given id gets the record.
    pub async fn unregister(&self, conn_id: Uuid) -> Option<ConnectionRecord> {
        let record = self.inner.connections.write().await.remove(&conn_id)?;

        let mut identities = self.inner.identities.write().await;
        if let Some(conns) = identities.get_mut(&record.identity.user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                identities.remove(&record.identity.user_id);
            }
        }

        Some(record)
    }

    pub async fn contains(&self, conn_id: Uuid) -> bool {
        self.inner.connections.read().await.contains_key(&conn_id)
    }

    pub async fn identity_for(&self, conn_id: Uuid) -> Option<Identity> {
        self.inner
            .connections
            .read()
            .await
            .get(&conn_id)
            .map(|r| r.identity.clone())
    }

    pub async fn connections_for(&self, user_id: Uuid) -> Vec<Uuid> {
        self.inner
            .identities
            .read()
            .await
            .get(&user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Record that a connection joined a room. Returns false if the
    /// connection is gone or was already in the room.
    pub async fn add_room(&self, conn_id: Uuid, room: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get_mut(&conn_id) {
            Some(record) => record.rooms.insert(room),
            None => false,
        }
    }

    pub async fn remove_room(&self, conn_id: Uuid, room: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;
        match connections.get_mut(&conn_id) {
            Some(record) => record.rooms.remove(&room),
            None => false,
        }
    }

    pub async fn in_room(&self, conn_id: Uuid, room: Uuid) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(&conn_id)
            .is_some_and(|r| r.rooms.contains(&room))
    }

    /// Queue an event for one connection. False if it is gone or its
    /// receiver has been dropped.
    pub async fn send_to_connection(&self, conn_id: Uuid, event: Arc<ServerEvent>) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&conn_id) {
            Some(record) => record.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Queue an event for every connection of `user_id`. Silent when there are none.
    pub async fn send_to_identity(&self, user_id: Uuid, event: Arc<ServerEvent>) -> Delivery {
        let conn_ids = self.connections_for(user_id).await;
        let connections = self.inner.connections.read().await;

        let mut delivery = Delivery::default();
        for conn_id in conn_ids {
            if let Some(record) = connections.get(&conn_id) {
                delivery.attempted += 1;
                if record.tx.send(event.clone()).is_ok() {
                    delivery.delivered += 1;
                }
            }
        }
        trace!(
            "Identity push to {}: {}/{} connections",
            user_id, delivery.delivered, delivery.attempted
        );
        delivery
    }

    /// Queue an event for a batch of connections under one read lock.
    /// Connections that vanished in the meantime are skipped.
    pub(crate) async fn send_to_many(&self, conn_ids: &[Uuid], event: &Arc<ServerEvent>) -> usize {
        let connections = self.inner.connections.read().await;
        conn_ids
            .iter()
            .filter_map(|id| connections.get(id))
            .filter(|record| record.tx.send(event.clone()).is_ok())
            .count()
    }

    pub(crate) async fn identities_of(&self, conn_ids: &[Uuid]) -> Vec<Identity> {
        let connections = self.inner.connections.read().await;
        conn_ids
            .iter()
            .filter_map(|id| connections.get(id))
            .map(|r| r.identity.clone())
            .collect()
    }
}
