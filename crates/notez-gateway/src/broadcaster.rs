use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

use notez_types::events::ServerEvent;
use notez_types::models::Identity;

use crate::error::{GatewayError, GatewayResult};
use crate::registry::{ConnectionRecord, Delivery, Registry};
use crate::store::Services;

/// Connections joined to one group.
#[derive(Default)]
struct Room {
    members: Mutex<RoomMembers>,
}

#[derive(Default)]
struct RoomMembers {
    /// conn_id -> user_id
    conns: HashMap<Uuid, Uuid>,
    /// Set once the last member left; the entry is about to be evicted.
    closed: bool,
}

/// Room membership and event fan-out.
///
/// The outer map lock is held only to find, create or evict a room entry.
/// Membership changes and snapshots take the per-room lock. Neither lock is
/// held while talking to the store or queueing events.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    registry: Registry,
    services: Services,
    backlog_size: u32,
    /// group_id -> room
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
}

/// Result of removing a connection from a room.
struct Departure {
    remaining: Vec<Uuid>,
    /// The identity still has another connection in the room.
    still_present: bool,
}

/// What a join changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    AlreadyJoined,
}

impl Broadcaster {
    pub fn new(registry: Registry, services: Services, backlog_size: u32) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                registry,
                services,
                backlog_size,
                rooms: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Authorize and add a connection to a room, then hand it the backlog.
    pub async fn join(&self, conn_id: Uuid, group_id: Uuid) -> GatewayResult<JoinOutcome> {
        let registry = &self.inner.registry;
        let identity = registry
            .identity_for(conn_id)
            .await
            .ok_or(GatewayError::Unauthenticated)?;

        self.inner
            .services
            .require_member(group_id, identity.user_id)
            .await?;

        registry.add_room(conn_id, group_id).await;
        let (newly_joined, others, already_present) = self
            .insert_member(group_id, conn_id, identity.user_id)
            .await;

        // A disconnect may have swept the rooms before we were inserted.
        if !registry.contains(conn_id).await {
            self.remove_member(group_id, conn_id).await;
            return Err(GatewayError::Unauthenticated);
        }

        // A second device of someone already in the room is not news.
        if newly_joined && !already_present {
            debug!("{} ({}) joined room {}", identity.username, conn_id, group_id);
            let event = Arc::new(ServerEvent::UserJoined {
                group_id,
                user_id: identity.user_id,
                username: identity.username.clone(),
            });
            registry.send_to_many(&others, &event).await;
        }

        let messages = self
            .inner
            .services
            .recent_messages(group_id, self.inner.backlog_size)
            .await?;
        registry
            .send_to_connection(
                conn_id,
                Arc::new(ServerEvent::RecentMessages { group_id, messages }),
            )
            .await;

        Ok(if newly_joined {
            JoinOutcome::Joined
        } else {
            JoinOutcome::AlreadyJoined
        })
    }

    /// Leave a room. Returns false, and does nothing, if the connection was not in it.
    pub async fn leave(&self, conn_id: Uuid, group_id: Uuid) -> bool {
        let registry = &self.inner.registry;
        let Some(identity) = registry.identity_for(conn_id).await else {
            return false;
        };
        registry.remove_room(conn_id, group_id).await;

        let Some(departure) = self.remove_member(group_id, conn_id).await else {
            return false;
        };
        debug!("{} ({}) left room {}", identity.username, conn_id, group_id);
        self.announce_departure(group_id, &identity, &departure).await;
        true
    }

    /// Drop every trace of a connection. Only the first call for an id does any work.
    pub async fn disconnect(&self, conn_id: Uuid) -> Option<ConnectionRecord> {
        let record = self.inner.registry.unregister(conn_id).await?;

        for &group_id in &record.rooms {
            if let Some(departure) = self.remove_member(group_id, conn_id).await {
                self.announce_departure(group_id, &record.identity, &departure)
                    .await;
            }
        }
        Some(record)
    }

    /// Deliver to every connection in the room right now. Returns how many accepted it.
    pub async fn broadcast(&self, group_id: Uuid, event: ServerEvent) -> usize {
        let conns = self.snapshot(group_id).await;
        let event = Arc::new(event);
        let sent = self.inner.registry.send_to_many(&conns, &event).await;
        trace!("Broadcast to room {}: {}/{} connections", group_id, sent, conns.len());
        sent
    }

    pub async fn broadcast_except(&self, group_id: Uuid, except: Uuid, event: ServerEvent) -> usize {
        let conns: Vec<Uuid> = self
            .snapshot(group_id)
            .await
            .into_iter()
            .filter(|c| *c != except)
            .collect();
        self.inner
            .registry
            .send_to_many(&conns, &Arc::new(event))
            .await
    }

    pub async fn send_to_identity(&self, user_id: Uuid, event: ServerEvent) -> Delivery {
        self.inner
            .registry
            .send_to_identity(user_id, Arc::new(event))
            .await
    }

    pub async fn send_to_connection(&self, conn_id: Uuid, event: ServerEvent) -> bool {
        self.inner
            .registry
            .send_to_connection(conn_id, Arc::new(event))
            .await
    }

    /// Distinct identities currently joined to the room.
    pub async fn members_of(&self, group_id: Uuid) -> Vec<Identity> {
        let conns = self.snapshot(group_id).await;
        let mut seen = HashSet::new();
        self.inner
            .registry
            .identities_of(&conns)
            .await
            .into_iter()
            .filter(|identity| seen.insert(identity.user_id))
            .collect()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    // -- Room bookkeeping --

    async fn snapshot(&self, group_id: Uuid) -> Vec<Uuid> {
        let room = self.inner.rooms.read().await.get(&group_id).cloned();
        match room {
            Some(room) => room.members.lock().await.conns.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Insert into the room, creating it if needed. Returns whether the
    /// connection was new to the room, who else was there, and whether the
    /// identity already had another connection in it.
    async fn insert_member(&self, group_id: Uuid, conn_id: Uuid, user_id: Uuid) -> (bool, Vec<Uuid>, bool) {
        loop {
            let room = self.room_entry(group_id).await;
            let mut members = room.members.lock().await;
            if members.closed {
                drop(members);
                self.evict(group_id, &room).await;
                continue;
            }
            let inserted = members.conns.insert(conn_id, user_id).is_none();
            let mut already_present = false;
            let mut others = Vec::new();
            for (&other, &owner) in &members.conns {
                if other != conn_id {
                    already_present |= owner == user_id;
                    others.push(other);
                }
            }
            return (inserted, others, already_present);
        }
    }

    /// Remove from the room, evicting it when empty. None if the connection
    /// was not a member.
    async fn remove_member(&self, group_id: Uuid, conn_id: Uuid) -> Option<Departure> {
        let room = self.inner.rooms.read().await.get(&group_id).cloned()?;

        let mut members = room.members.lock().await;
        let user_id = members.conns.remove(&conn_id)?;
        let remaining: Vec<Uuid> = members.conns.keys().copied().collect();
        let still_present = members.conns.values().any(|owner| *owner == user_id);
        if remaining.is_empty() {
            members.closed = true;
            drop(members);
            self.evict(group_id, &room).await;
        }
        Some(Departure {
            remaining,
            still_present,
        })
    }

    async fn room_entry(&self, group_id: Uuid) -> Arc<Room> {
        if let Some(room) = self.inner.rooms.read().await.get(&group_id) {
            return room.clone();
        }
        self.inner
            .rooms
            .write()
            .await
            .entry(group_id)
            .or_default()
            .clone()
    }

    /// Remove `room` from the map unless it has already been replaced.
    async fn evict(&self, group_id: Uuid, room: &Arc<Room>) {
        let mut rooms = self.inner.rooms.write().await;
        if rooms.get(&group_id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(&group_id);
            trace!("Room {} evicted", group_id);
        }
    }

    async fn announce_departure(&self, group_id: Uuid, identity: &Identity, departure: &Departure) {
        if departure.remaining.is_empty() || departure.still_present {
            return;
        }
        let event = Arc::new(ServerEvent::UserLeft {
            group_id,
            user_id: identity.user_id,
            username: identity.username.clone(),
        });
        self.inner
            .registry
            .send_to_many(&departure.remaining, &event)
            .await;
    }
}
