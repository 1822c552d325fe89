use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Notification, Poll, ReactionGroup};

/// Events pushed FROM server TO client over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection accepted and registered
    Ready {
        user_id: Uuid,
        username: String,
        connection_id: Uuid,
    },

    /// Join-time backlog, sent only to the joining connection (oldest first)
    RecentMessages {
        group_id: Uuid,
        messages: Vec<Message>,
    },

    NewMessage { message: Message },

    /// Edit delta: only the fields an edit changes
    MessageEdited {
        message_id: Uuid,
        group_id: Uuid,
        content: String,
        edited_at: DateTime<Utc>,
    },

    MessageDeleted {
        message_id: Uuid,
        group_id: Uuid,
        deleted_by: Uuid,
        deleted_at: DateTime<Utc>,
    },

    /// Full reaction set of one message after a change
    ReactionUpdated {
        message_id: Uuid,
        group_id: Uuid,
        reactions: Vec<ReactionGroup>,
    },

    PollUpdated {
        message_id: Uuid,
        group_id: Uuid,
        poll: Poll,
    },

    /// Read receipts recorded; delivered to the reader's own connections only
    ReadMarked {
        group_id: Uuid,
        message_ids: Vec<Uuid>,
        read_at: DateTime<Utc>,
    },

    SearchResults {
        group_id: Uuid,
        query: String,
        messages: Vec<Message>,
    },

    UserJoined {
        group_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserLeft {
        group_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserTyping {
        group_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserStoppedTyping {
        group_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    PresenceUpdate {
        group_id: Uuid,
        user_id: Uuid,
        username: String,
        status: PresenceStatus,
    },

    /// Shared content (e.g. a note) was created in the group
    ContentCreated {
        group_id: Uuid,
        entity_id: Uuid,
        title: String,
        created_by: Uuid,
    },

    /// Shared content was changed; `changes` is passed through as sent
    ContentUpdated {
        group_id: Uuid,
        entity_id: Uuid,
        changes: serde_json::Value,
        updated_by: Uuid,
        username: String,
    },

    Notification { notification: Notification },

    AssistantStarted {
        group_id: Uuid,
        request_id: Uuid,
        user_id: Uuid,
        prompt: String,
    },

    AssistantResponse {
        group_id: Uuid,
        request_id: Uuid,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Scoped failure reply for one action of this connection
    Error {
        action: String,
        kind: ErrorKind,
        message: String,
    },
}

/// Actions sent FROM client TO server over the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ClientAction {
    JoinRoom { group_id: Uuid },

    LeaveRoom { group_id: Uuid },

    SendMessage {
        group_id: Uuid,
        content: String,
        #[serde(default)]
        kind: SendKind,
        #[serde(default)]
        thread_id: Option<Uuid>,
    },

    CreatePoll {
        group_id: Uuid,
        question: String,
        options: Vec<String>,
        #[serde(default)]
        allow_multiple: bool,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },

    React {
        message_id: Uuid,
        emoji: String,
        #[serde(default)]
        op: ReactionOp,
    },

    Vote { message_id: Uuid, option_index: usize },

    EditMessage { message_id: Uuid, content: String },

    DeleteMessage { message_id: Uuid },

    MarkRead {
        group_id: Uuid,
        message_ids: Vec<Uuid>,
    },

    Search {
        group_id: Uuid,
        query: String,
        #[serde(default)]
        limit: Option<u32>,
        #[serde(default)]
        skip: Option<u32>,
    },

    TypingStart { group_id: Uuid },

    TypingStop { group_id: Uuid },

    UpdatePresence {
        group_id: Uuid,
        status: PresenceStatus,
    },

    ContentCreated {
        group_id: Uuid,
        entity_id: Uuid,
        title: String,
    },

    ContentUpdated {
        group_id: Uuid,
        entity_id: Uuid,
        changes: serde_json::Value,
    },

    InviteMember { group_id: Uuid, user_id: Uuid },

    RequestJoin { group_id: Uuid },

    AssistantRequest {
        group_id: Uuid,
        message: String,
        #[serde(default)]
        request_id: Option<Uuid>,
    },

    AssistantCancel { request_id: Uuid },

    NotificationDelivered { notification_id: Uuid },
}

impl ClientAction {
    /// Wire name of the action, echoed back in error events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::SendMessage { .. } => "send_message",
            Self::CreatePoll { .. } => "create_poll",
            Self::React { .. } => "react",
            Self::Vote { .. } => "vote",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::MarkRead { .. } => "mark_read",
            Self::Search { .. } => "search",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::UpdatePresence { .. } => "update_presence",
            Self::ContentCreated { .. } => "content_created",
            Self::ContentUpdated { .. } => "content_updated",
            Self::InviteMember { .. } => "invite_member",
            Self::RequestJoin { .. } => "request_join",
            Self::AssistantRequest { .. } => "assistant_request",
            Self::AssistantCancel { .. } => "assistant_cancel",
            Self::NotificationDelivered { .. } => "notification_delivered",
        }
    }
}

/// Message kinds a client may send directly. Polls go through `create_poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendKind {
    #[default]
    Text,
    Announcement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionOp {
    #[default]
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    InvalidState,
    InvalidRequest,
    Internal,
}
