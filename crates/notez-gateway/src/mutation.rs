use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use notez_db::messages::{DEFAULT_SEARCH_LIMIT, MAX_SEARCH_LIMIT};
use notez_types::events::{ReactionOp, SendKind, ServerEvent};
use notez_types::models::{
    EntityKind, GroupMember, Identity, Message, MessageKind, NotificationKind, Permission, Poll,
    Priority, RelatedEntity,
};

use crate::broadcaster::Broadcaster;
use crate::error::{GatewayError, GatewayResult};
use crate::fanout::{NotificationDraft, NotificationFanout};
use crate::mentions::extract_handles;
use crate::message_state::{apply_delete, apply_edit, apply_reaction, apply_read, apply_vote};
use crate::store::Services;

pub const MAX_CONTENT_CHARS: usize = 2000;
pub const MIN_POLL_OPTIONS: usize = 2;
pub const MAX_POLL_OPTIONS: usize = 20;
const MAX_EMOJI_CHARS: usize = 32;
const MAX_READ_BATCH: usize = 100;
const PREVIEW_CHARS: usize = 100;

/// Trimmed, non-empty, and within the length limit.
pub fn validate_content(content: &str) -> GatewayResult<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::invalid_request("content must not be empty"));
    }
    if trimmed.chars().count() > MAX_CONTENT_CHARS {
        return Err(GatewayError::invalid_request(format!(
            "content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    Ok(trimmed.to_string())
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        return content.to_string();
    }
    let mut cut: String = content.chars().take(PREVIEW_CHARS).collect();
    cut.push('…');
    cut
}

/// Send, edit, delete, react, vote, read and search on group messages.
///
/// Every operation re-checks membership. Writes go through the store's
/// atomic update first; broadcasts only follow a successful write.
#[derive(Clone)]
pub struct MessageEngine {
    services: Services,
    broadcaster: Broadcaster,
    fanout: NotificationFanout,
}

impl MessageEngine {
    pub fn new(services: Services, broadcaster: Broadcaster, fanout: NotificationFanout) -> Self {
        Self {
            services,
            broadcaster,
            fanout,
        }
    }

    pub async fn send(
        &self,
        author: &Identity,
        group_id: Uuid,
        content: &str,
        kind: SendKind,
        thread_id: Option<Uuid>,
    ) -> GatewayResult<Message> {
        self.services
            .require_permission(group_id, author.user_id, Permission::CreateContent)
            .await?;
        let content = validate_content(content)?;

        let handles = extract_handles(&content);
        let needs_members = !handles.is_empty() || kind == SendKind::Announcement;
        let members = if needs_members {
            self.services.active_members(group_id).await?
        } else {
            Vec::new()
        };
        let mentions = resolve_mentions(&handles, &members);

        let kind = match kind {
            SendKind::Text => MessageKind::Text,
            SendKind::Announcement => MessageKind::Announcement,
        };
        let mut message = Message::new(group_id, author, content, kind);
        message.thread_id = thread_id;
        message.mentions = mentions;

        let message = match thread_id {
            Some(_) => self
                .services
                .create_reply(message)
                .await?
                .ok_or(GatewayError::NotFound("thread"))?,
            None => self.services.create_message(message).await?,
        };
        self.broadcaster
            .broadcast(
                group_id,
                ServerEvent::NewMessage {
                    message: message.clone(),
                },
            )
            .await;

        let mentioned: Vec<Uuid> = message
            .mentions
            .iter()
            .copied()
            .filter(|id| *id != author.user_id)
            .collect();
        if !mentioned.is_empty() {
            let draft = NotificationDraft::new(
                NotificationKind::ChatMention,
                format!("{} mentioned you", author.username),
                preview(&message.content),
            )
            .from_sender(author.user_id)
            .in_group(group_id)
            .about(RelatedEntity {
                kind: EntityKind::Message,
                id: message.id,
            });
            self.fanout.notify(mentioned, &draft).await;
        }

        if message.kind == MessageKind::Announcement {
            let draft = NotificationDraft::new(
                NotificationKind::ChatMessage,
                format!("Announcement from {}", author.username),
                preview(&message.content),
            )
            .from_sender(author.user_id)
            .in_group(group_id)
            .with_priority(Priority::High)
            .about(RelatedEntity {
                kind: EntityKind::Message,
                id: message.id,
            });
            self.fanout
                .notify(others(&members, author.user_id), &draft)
                .await;
        }

        debug!("{} posted {} in {}", author.username, message.id, group_id);
        Ok(message)
    }

    pub async fn create_poll(
        &self,
        author: &Identity,
        group_id: Uuid,
        question: &str,
        options: &[String],
        allow_multiple: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> GatewayResult<Message> {
        self.services
            .require_permission(group_id, author.user_id, Permission::CreateContent)
            .await?;

        let question = validate_content(question)?;
        if !(MIN_POLL_OPTIONS..=MAX_POLL_OPTIONS).contains(&options.len()) {
            return Err(GatewayError::invalid_request(format!(
                "a poll needs {} to {} options",
                MIN_POLL_OPTIONS, MAX_POLL_OPTIONS
            )));
        }
        let options = options
            .iter()
            .map(|o| validate_content(o))
            .collect::<GatewayResult<Vec<_>>>()?;
        if expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(GatewayError::invalid_request("poll expiry must be in the future"));
        }

        let mut message = Message::new(group_id, author, question.clone(), MessageKind::Poll);
        message.poll = Some(Poll::new(question, options, allow_multiple, expires_at));

        let message = self.services.create_message(message).await?;
        self.broadcaster
            .broadcast(
                group_id,
                ServerEvent::NewMessage {
                    message: message.clone(),
                },
            )
            .await;
        Ok(message)
    }

    pub async fn edit(&self, editor: &Identity, message_id: Uuid, content: &str) -> GatewayResult<Message> {
        let content = validate_content(content)?;
        let (group_id, _) = self.authorize_on_message(editor, message_id).await?;

        let now = Utc::now();
        let user_id = editor.user_id;
        let (message, changed) = self
            .services
            .update_message(message_id, move |m| apply_edit(m, user_id, &content, now))
            .await?
            .ok_or(GatewayError::NotFound("message"))?;

        if changed {
            self.broadcaster
                .broadcast(
                    group_id,
                    ServerEvent::MessageEdited {
                        message_id,
                        group_id,
                        content: message.content.clone(),
                        edited_at: now,
                    },
                )
                .await;
        }
        Ok(message)
    }

    pub async fn delete(&self, actor: &Identity, message_id: Uuid) -> GatewayResult<Message> {
        let (group_id, member) = self.authorize_on_message(actor, message_id).await?;
        let can_delete_any = member.has_permission(Permission::ModerateChat)
            || member.has_permission(Permission::DeleteContent);

        let now = Utc::now();
        let user_id = actor.user_id;
        let (message, changed) = self
            .services
            .update_message(message_id, move |m| apply_delete(m, user_id, can_delete_any, now))
            .await?
            .ok_or(GatewayError::NotFound("message"))?;

        if changed {
            info!("{} deleted message {} in {}", actor.username, message_id, group_id);
            self.broadcaster
                .broadcast(
                    group_id,
                    ServerEvent::MessageDeleted {
                        message_id,
                        group_id,
                        deleted_by: user_id,
                        deleted_at: now,
                    },
                )
                .await;
        }
        Ok(message)
    }

    pub async fn react(
        &self,
        actor: &Identity,
        message_id: Uuid,
        emoji: &str,
        op: ReactionOp,
    ) -> GatewayResult<Message> {
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(GatewayError::invalid_request("invalid emoji"));
        }
        let (group_id, _) = self.authorize_on_message(actor, message_id).await?;

        let user_id = actor.user_id;
        let (message, changed) = self
            .services
            .update_message(message_id, move |m| apply_reaction(m, user_id, &emoji, op))
            .await?
            .ok_or(GatewayError::NotFound("message"))?;

        if changed {
            self.broadcaster
                .broadcast(
                    group_id,
                    ServerEvent::ReactionUpdated {
                        message_id,
                        group_id,
                        reactions: message.reactions.clone(),
                    },
                )
                .await;
        }
        Ok(message)
    }

    pub async fn vote(&self, voter: &Identity, message_id: Uuid, option_index: usize) -> GatewayResult<Message> {
        let (group_id, _) = self.authorize_on_message(voter, message_id).await?;

        let now = Utc::now();
        let user_id = voter.user_id;
        let (message, changed) = self
            .services
            .update_message(message_id, move |m| apply_vote(m, user_id, option_index, now))
            .await?
            .ok_or(GatewayError::NotFound("message"))?;

        if changed {
            if let Some(poll) = &message.poll {
                self.broadcaster
                    .broadcast(
                        group_id,
                        ServerEvent::PollUpdated {
                            message_id,
                            group_id,
                            poll: poll.clone(),
                        },
                    )
                    .await;
            }
        }
        Ok(message)
    }

    /// Record read receipts and return the ids now read by `reader`, with
    /// the receipt time. Messages outside the group or deleted are skipped.
    pub async fn mark_read(
        &self,
        reader: &Identity,
        group_id: Uuid,
        message_ids: &[Uuid],
    ) -> GatewayResult<(Vec<Uuid>, DateTime<Utc>)> {
        if message_ids.len() > MAX_READ_BATCH {
            return Err(GatewayError::invalid_request(format!(
                "at most {} messages per call",
                MAX_READ_BATCH
            )));
        }
        self.services.require_member(group_id, reader.user_id).await?;

        let now = Utc::now();
        let user_id = reader.user_id;
        let mut seen = HashSet::new();
        let mut marked = Vec::new();

        for &message_id in message_ids {
            if !seen.insert(message_id) {
                continue;
            }
            let updated = self
                .services
                .update_message(message_id, move |m| {
                    if m.group_id != group_id {
                        return Ok(false);
                    }
                    Ok(apply_read(m, user_id, now))
                })
                .await?;
            if let Some((message, _)) = updated {
                if message.group_id == group_id && !message.is_deleted {
                    marked.push(message_id);
                }
            }
        }
        Ok((marked, now))
    }

    pub async fn search(
        &self,
        searcher: &Identity,
        group_id: Uuid,
        query: &str,
        limit: Option<u32>,
        skip: Option<u32>,
    ) -> GatewayResult<Vec<Message>> {
        self.services.require_member(group_id, searcher.user_id).await?;
        let query = query.trim();
        if query.is_empty() {
            return Err(GatewayError::invalid_request("search query must not be empty"));
        }
        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);
        self.services
            .search_messages(group_id, query.to_string(), limit, skip.unwrap_or(0))
            .await
    }

    /// Shared content (a note, a file) appeared in the group.
    pub async fn content_created(
        &self,
        creator: &Identity,
        group_id: Uuid,
        entity_id: Uuid,
        title: &str,
    ) -> GatewayResult<()> {
        self.services
            .require_permission(group_id, creator.user_id, Permission::CreateContent)
            .await?;
        let title = validate_content(title)?;

        self.broadcaster
            .broadcast(
                group_id,
                ServerEvent::ContentCreated {
                    group_id,
                    entity_id,
                    title: title.clone(),
                    created_by: creator.user_id,
                },
            )
            .await;

        let members = self.services.active_members(group_id).await?;
        let draft = NotificationDraft::new(
            NotificationKind::ContentCreated,
            format!("{} shared something new", creator.username),
            title,
        )
        .from_sender(creator.user_id)
        .in_group(group_id)
        .about(RelatedEntity {
            kind: EntityKind::Content,
            id: entity_id,
        });
        self.fanout
            .notify(others(&members, creator.user_id), &draft)
            .await;
        Ok(())
    }

    /// Relay an edit of shared content to the room. Nothing is persisted
    /// and nobody is notified; the room sees it live or not at all.
    pub async fn content_updated(
        &self,
        editor: &Identity,
        group_id: Uuid,
        entity_id: Uuid,
        changes: serde_json::Value,
    ) -> GatewayResult<()> {
        self.services.require_member(group_id, editor.user_id).await?;
        if !changes.is_object() {
            return Err(GatewayError::invalid_request("changes must be an object"));
        }

        self.broadcaster
            .broadcast(
                group_id,
                ServerEvent::ContentUpdated {
                    group_id,
                    entity_id,
                    changes,
                    updated_by: editor.user_id,
                    username: editor.username.clone(),
                },
            )
            .await;
        Ok(())
    }

    pub async fn invite(&self, inviter: &Identity, group_id: Uuid, invitee_id: Uuid) -> GatewayResult<()> {
        self.services
            .require_permission(group_id, inviter.user_id, Permission::InviteMembers)
            .await?;

        let invitee = self
            .services
            .user(invitee_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or(GatewayError::NotFound("user"))?;
        if self
            .services
            .membership_record(group_id, invitee_id)
            .await?
            .is_some_and(|m| m.is_active())
        {
            return Err(GatewayError::invalid_state("user is already a member"));
        }

        let draft = NotificationDraft::new(
            NotificationKind::GroupInvite,
            "Group invitation",
            format!("{} invited you to join a group", inviter.username),
        )
        .from_sender(inviter.user_id)
        .in_group(group_id)
        .with_priority(Priority::High)
        .about(RelatedEntity {
            kind: EntityKind::Group,
            id: group_id,
        });
        self.fanout.notify([invitee.id], &draft).await;
        info!("{} invited {} to {}", inviter.username, invitee.username, group_id);
        Ok(())
    }

    pub async fn request_join(&self, requester: &Identity, group_id: Uuid) -> GatewayResult<()> {
        match self
            .services
            .membership_record(group_id, requester.user_id)
            .await?
        {
            Some(m) if m.is_active() => {
                return Err(GatewayError::invalid_state("already a member"));
            }
            Some(_) => return Err(GatewayError::Forbidden),
            None => {}
        }

        let admins: Vec<Uuid> = self
            .services
            .active_members(group_id)
            .await?
            .into_iter()
            .filter(|m| m.role.is_privileged())
            .map(|m| m.user_id)
            .collect();
        if admins.is_empty() {
            return Err(GatewayError::NotFound("group"));
        }

        let draft = NotificationDraft::new(
            NotificationKind::JoinRequest,
            "Join request",
            format!("{} wants to join your group", requester.username),
        )
        .from_sender(requester.user_id)
        .in_group(group_id)
        .about(RelatedEntity {
            kind: EntityKind::User,
            id: requester.user_id,
        });
        self.fanout.notify(admins, &draft).await;
        Ok(())
    }

    /// Load the message and check the actor is an active member of its group.
    async fn authorize_on_message(
        &self,
        actor: &Identity,
        message_id: Uuid,
    ) -> GatewayResult<(Uuid, GroupMember)> {
        let message = self
            .services
            .message(message_id)
            .await?
            .ok_or(GatewayError::NotFound("message"))?;
        let member = self
            .services
            .require_member(message.group_id, actor.user_id)
            .await?;
        Ok((message.group_id, member))
    }
}

fn resolve_mentions(handles: &[&str], members: &[GroupMember]) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for handle in handles {
        let found = members
            .iter()
            .find(|m| m.username.eq_ignore_ascii_case(handle));
        if let Some(member) = found {
            if !ids.contains(&member.user_id) {
                ids.push(member.user_id);
            }
        }
    }
    ids
}

fn others(members: &[GroupMember], actor: Uuid) -> Vec<Uuid> {
    members
        .iter()
        .map(|m| m.user_id)
        .filter(|id| *id != actor)
        .collect()
}
