use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use notez_types::events::{ClientAction, ErrorKind, ServerEvent};
use notez_types::models::Identity;

use crate::assistant::AssistantScheduler;
use crate::broadcaster::Broadcaster;
use crate::error::{GatewayError, GatewayResult};
use crate::fanout::NotificationFanout;
use crate::mutation::MessageEngine;
use crate::registry::{EventReceiver, Registry};
use crate::session::SessionGate;
use crate::store::Services;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Messages handed to a connection when it joins a room
    pub backlog_size: u32,
    /// How long the simulated assistant "thinks" before replying
    pub assistant_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backlog_size: 20,
            assistant_delay: Duration::from_secs(2),
        }
    }
}

/// The realtime core: one entry point per connection lifecycle step, and one
/// for every client action.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    sessions: SessionGate,
    broadcaster: Broadcaster,
    engine: MessageEngine,
    fanout: NotificationFanout,
    assistant: AssistantScheduler,
}

impl Gateway {
    pub fn new(services: Services, jwt_secret: &str, config: GatewayConfig) -> Self {
        let registry = Registry::new();
        let broadcaster = Broadcaster::new(registry, services.clone(), config.backlog_size);
        let fanout = NotificationFanout::new(services.clone(), broadcaster.clone());
        let engine = MessageEngine::new(services.clone(), broadcaster.clone(), fanout.clone());
        let assistant =
            AssistantScheduler::new(services.clone(), broadcaster.clone(), config.assistant_delay);

        Self {
            inner: Arc::new(GatewayInner {
                sessions: SessionGate::new(services, jwt_secret),
                broadcaster,
                engine,
                fanout,
                assistant,
            }),
        }
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn fanout(&self) -> &NotificationFanout {
        &self.inner.fanout
    }

    pub fn assistant(&self) -> &AssistantScheduler {
        &self.inner.assistant
    }

    /// Verify a bearer token. Runs before any connection state exists.
    pub async fn authenticate(&self, token: &str) -> GatewayResult<Identity> {
        self.inner.sessions.authenticate(token).await
    }

    /// Register an authenticated connection and queue its `ready` event.
    pub async fn connect(&self, identity: Identity) -> (Uuid, EventReceiver) {
        let registry = self.inner.broadcaster.registry();
        let (conn_id, rx) = registry.register(identity.clone()).await;

        registry
            .send_to_connection(
                conn_id,
                Arc::new(ServerEvent::Ready {
                    user_id: identity.user_id,
                    username: identity.username.clone(),
                    connection_id: conn_id,
                }),
            )
            .await;

        info!("{} ({}) connected to gateway as {}", identity.username, identity.user_id, conn_id);
        (conn_id, rx)
    }

    /// Tear down a connection. Safe to call any number of times.
    pub async fn disconnect(&self, conn_id: Uuid) -> bool {
        match self.inner.broadcaster.disconnect(conn_id).await {
            Some(record) => {
                info!(
                    "{} ({}) disconnected from gateway ({} rooms left)",
                    record.identity.username,
                    record.identity.user_id,
                    record.rooms.len()
                );
                true
            }
            None => false,
        }
    }

    /// Cancel background work owned by the gateway.
    pub fn shutdown(&self) {
        self.inner.assistant.shutdown();
    }

    /// Parse and run one raw text frame.
    pub async fn handle_text(&self, conn_id: Uuid, text: &str) {
        match serde_json::from_str::<ClientAction>(text) {
            Ok(action) => self.handle(conn_id, action).await,
            Err(e) => {
                warn!(
                    "Connection {} sent a bad action: {} -- raw: {}",
                    conn_id,
                    e,
                    text.chars().take(200).collect::<String>()
                );
                self.inner
                    .broadcaster
                    .send_to_connection(
                        conn_id,
                        ServerEvent::Error {
                            action: "unknown".into(),
                            kind: ErrorKind::InvalidRequest,
                            message: "malformed action".into(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Run one action. Any failure becomes an `error` event for this connection only.
    pub async fn handle(&self, conn_id: Uuid, action: ClientAction) {
        let name = action.name();
        let Some(identity) = self.inner.broadcaster.registry().identity_for(conn_id).await else {
            debug!("Action {} on unknown connection {}", name, conn_id);
            return;
        };

        if let Err(e) = self.execute(conn_id, &identity, action).await {
            if e.is_server_fault() {
                error!(
                    "Action {} failed for {} ({}) on {}: {}",
                    name, identity.username, identity.user_id, conn_id, e
                );
            } else {
                debug!(
                    "Action {} rejected for {} ({}): {}",
                    name, identity.username, identity.user_id, e
                );
            }
            self.inner
                .broadcaster
                .send_to_connection(
                    conn_id,
                    ServerEvent::Error {
                        action: name.to_string(),
                        kind: e.kind(),
                        message: e.client_message(),
                    },
                )
                .await;
        }
    }

    async fn execute(&self, conn_id: Uuid, identity: &Identity, action: ClientAction) -> GatewayResult<()> {
        let inner = &self.inner;
        let broadcaster = &inner.broadcaster;
        let engine = &inner.engine;

        match action {
            ClientAction::JoinRoom { group_id } => {
                broadcaster.join(conn_id, group_id).await?;
            }

            ClientAction::LeaveRoom { group_id } => {
                broadcaster.leave(conn_id, group_id).await;
            }

            ClientAction::SendMessage {
                group_id,
                content,
                kind,
                thread_id,
            } => {
                engine
                    .send(identity, group_id, &content, kind, thread_id)
                    .await?;
            }

            ClientAction::CreatePoll {
                group_id,
                question,
                options,
                allow_multiple,
                expires_at,
            } => {
                engine
                    .create_poll(identity, group_id, &question, &options, allow_multiple, expires_at)
                    .await?;
            }

            ClientAction::React {
                message_id,
                emoji,
                op,
            } => {
                engine.react(identity, message_id, &emoji, op).await?;
            }

            ClientAction::Vote {
                message_id,
                option_index,
            } => {
                engine.vote(identity, message_id, option_index).await?;
            }

            ClientAction::EditMessage {
                message_id,
                content,
            } => {
                engine.edit(identity, message_id, &content).await?;
            }

            ClientAction::DeleteMessage { message_id } => {
                engine.delete(identity, message_id).await?;
            }

            ClientAction::MarkRead {
                group_id,
                message_ids,
            } => {
                let (marked, read_at) = engine.mark_read(identity, group_id, &message_ids).await?;
                // Read state stays private to the reader.
                broadcaster
                    .send_to_identity(
                        identity.user_id,
                        ServerEvent::ReadMarked {
                            group_id,
                            message_ids: marked,
                            read_at,
                        },
                    )
                    .await;
            }

            ClientAction::Search {
                group_id,
                query,
                limit,
                skip,
            } => {
                let messages = engine.search(identity, group_id, &query, limit, skip).await?;
                broadcaster
                    .send_to_connection(
                        conn_id,
                        ServerEvent::SearchResults {
                            group_id,
                            query,
                            messages,
                        },
                    )
                    .await;
            }

            ClientAction::TypingStart { group_id } => {
                self.require_joined(conn_id, group_id).await?;
                broadcaster
                    .broadcast_except(
                        group_id,
                        conn_id,
                        ServerEvent::UserTyping {
                            group_id,
                            user_id: identity.user_id,
                            username: identity.username.clone(),
                        },
                    )
                    .await;
            }

            ClientAction::TypingStop { group_id } => {
                self.require_joined(conn_id, group_id).await?;
                broadcaster
                    .broadcast_except(
                        group_id,
                        conn_id,
                        ServerEvent::UserStoppedTyping {
                            group_id,
                            user_id: identity.user_id,
                            username: identity.username.clone(),
                        },
                    )
                    .await;
            }

            ClientAction::UpdatePresence { group_id, status } => {
                self.require_joined(conn_id, group_id).await?;
                broadcaster
                    .broadcast_except(
                        group_id,
                        conn_id,
                        ServerEvent::PresenceUpdate {
                            group_id,
                            user_id: identity.user_id,
                            username: identity.username.clone(),
                            status,
                        },
                    )
                    .await;
            }

            ClientAction::ContentCreated {
                group_id,
                entity_id,
                title,
            } => {
                engine
                    .content_created(identity, group_id, entity_id, &title)
                    .await?;
            }

            ClientAction::ContentUpdated {
                group_id,
                entity_id,
                changes,
            } => {
                engine
                    .content_updated(identity, group_id, entity_id, changes)
                    .await?;
            }

            ClientAction::InviteMember { group_id, user_id } => {
                engine.invite(identity, group_id, user_id).await?;
            }

            ClientAction::RequestJoin { group_id } => {
                engine.request_join(identity, group_id).await?;
            }

            ClientAction::AssistantRequest {
                group_id,
                message,
                request_id,
            } => {
                inner
                    .assistant
                    .request(identity, group_id, &message, request_id)
                    .await?;
            }

            ClientAction::AssistantCancel { request_id } => {
                inner.assistant.cancel(identity, request_id).await?;
            }

            ClientAction::NotificationDelivered { notification_id } => {
                inner
                    .fanout
                    .acknowledge(identity.user_id, notification_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Typing and presence are only relayed from connections inside the room.
    async fn require_joined(&self, conn_id: Uuid, group_id: Uuid) -> GatewayResult<()> {
        if self
            .inner
            .broadcaster
            .registry()
            .in_room(conn_id, group_id)
            .await
        {
            Ok(())
        } else {
            Err(GatewayError::Forbidden)
        }
    }
}
