use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content shown in place of a soft-deleted message.
pub const DELETED_PLACEHOLDER: &str = "[deleted]";

// -- Users & groups --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub is_active: bool,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Verified identity attached to a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Admin,
    CoAdmin,
    Moderator,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::CoAdmin => "co-admin",
            Self::Moderator => "moderator",
            Self::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "co-admin" => Some(Self::CoAdmin),
            "moderator" => Some(Self::Moderator),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    /// Admins and co-admins implicitly hold every permission flag.
    pub fn is_privileged(&self) -> bool {
        matches!(self, Self::Admin | Self::CoAdmin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    CreateContent,
    EditContent,
    DeleteContent,
    InviteMembers,
    CreateSubGroups,
    ModerateChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPermissions {
    pub create_content: bool,
    pub edit_content: bool,
    pub delete_content: bool,
    pub invite_members: bool,
    pub create_sub_groups: bool,
    pub moderate_chat: bool,
}

impl Default for MemberPermissions {
    fn default() -> Self {
        Self {
            create_content: true,
            edit_content: false,
            delete_content: false,
            invite_members: false,
            create_sub_groups: false,
            moderate_chat: false,
        }
    }
}

impl MemberPermissions {
    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::CreateContent => self.create_content,
            Permission::EditContent => self.edit_content,
            Permission::DeleteContent => self.delete_content,
            Permission::InviteMembers => self.invite_members,
            Permission::CreateSubGroups => self.create_sub_groups,
            Permission::ModerateChat => self.moderate_chat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Muted,
    Banned,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Muted => "muted",
            Self::Banned => "banned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "muted" => Some(Self::Muted),
            "banned" => Some(Self::Banned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub permissions: MemberPermissions,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

impl GroupMember {
    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.is_active() && (self.role.is_privileged() || self.permissions.allows(permission))
    }
}

// -- Messages --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    System,
    Announcement,
    Poll,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::Announcement => "announcement",
            Self::Poll => "poll",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "system" => Some(Self::System),
            "announcement" => Some(Self::Announcement),
            "poll" => Some(Self::Poll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRecord {
    pub content: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub text: String,
    pub votes: Vec<Uuid>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    pub options: Vec<PollOption>,
    pub allow_multiple: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Poll {
    pub fn new(
        question: String,
        options: Vec<String>,
        allow_multiple: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            question,
            options: options
                .into_iter()
                .map(|text| PollOption {
                    text,
                    votes: Vec::new(),
                    count: 0,
                })
                .collect(),
            allow_multiple,
            expires_at,
            is_active: true,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub group_id: Uuid,
    pub author_id: Uuid,
    pub author_username: String,
    pub content: String,
    pub kind: MessageKind,
    pub thread_id: Option<Uuid>,
    pub mentions: Vec<Uuid>,
    pub edit_history: Vec<EditRecord>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub reactions: Vec<ReactionGroup>,
    pub reaction_count: usize,
    /// Thread replies posted under this message
    pub reply_count: usize,
    pub read_by: Vec<ReadReceipt>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<Uuid>,
    pub poll: Option<Poll>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// A fresh, unmutated message authored now.
    pub fn new(group_id: Uuid, author: &Identity, content: String, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            author_id: author.user_id,
            author_username: author.username.clone(),
            content,
            kind,
            thread_id: None,
            mentions: Vec::new(),
            edit_history: Vec::new(),
            is_edited: false,
            edited_at: None,
            reactions: Vec::new(),
            reaction_count: 0,
            reply_count: 0,
            read_by: Vec::new(),
            is_deleted: false,
            deleted_at: None,
            deleted_by: None,
            poll: None,
            created_at: Utc::now(),
        }
    }
}

// -- Notifications --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ChatMention,
    ChatMessage,
    ContentCreated,
    GroupInvite,
    JoinRequest,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatMention => "chat_mention",
            Self::ChatMessage => "chat_message",
            Self::ContentCreated => "content_created",
            Self::GroupInvite => "group_invite",
            Self::JoinRequest => "join_request",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "chat_mention" => Some(Self::ChatMention),
            "chat_message" => Some(Self::ChatMessage),
            "content_created" => Some(Self::ContentCreated),
            "group_invite" => Some(Self::GroupInvite),
            "join_request" => Some(Self::JoinRequest),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            "urgent" => Some(Self::Urgent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Message,
    Content,
    Group,
    User,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Content => "content",
            Self::Group => "group",
            Self::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "content" => Some(Self::Content),
            "group" => Some(Self::Group),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub kind: EntityKind,
    pub id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryChannel {
    Live,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
    Disabled,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub live: DeliveryStatus,
    pub email: DeliveryStatus,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            live: DeliveryStatus::Pending,
            email: DeliveryStatus::Disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub group_id: Option<Uuid>,
    pub related: Option<RelatedEntity>,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub delivery: Delivery,
    pub scheduled_for: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Notifications are kept for 30 days unless an explicit expiry is given.
pub const NOTIFICATION_TTL_DAYS: i64 = 30;

/// Filters for listing a recipient's notifications.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationQuery {
    #[serde(default = "default_notification_limit")]
    pub limit: u32,
    #[serde(default)]
    pub skip: u32,
    #[serde(default)]
    pub unread_only: bool,
    pub kind: Option<NotificationKind>,
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub include_archived: bool,
}

fn default_notification_limit() -> u32 {
    20
}

impl Default for NotificationQuery {
    fn default() -> Self {
        Self {
            limit: default_notification_limit(),
            skip: 0,
            unread_only: false,
            kind: None,
            group_id: None,
            include_archived: false,
        }
    }
}

/// Row selection for a bulk notification update. Always scoped to one recipient.
#[derive(Debug, Clone, Default)]
pub struct NotificationMatch {
    pub recipient_id: Uuid,
    pub ids: Option<Vec<Uuid>>,
    pub group_id: Option<Uuid>,
    pub unread_only: bool,
    pub exclude_archived: bool,
}

impl NotificationMatch {
    pub fn recipient(recipient_id: Uuid) -> Self {
        Self {
            recipient_id,
            ..Default::default()
        }
    }

    pub fn ids(recipient_id: Uuid, ids: Vec<Uuid>) -> Self {
        Self {
            recipient_id,
            ids: Some(ids),
            ..Default::default()
        }
    }

    /// Every unread, non-archived row of the recipient, optionally within one group.
    pub fn unread(recipient_id: Uuid, group_id: Option<Uuid>) -> Self {
        Self {
            recipient_id,
            ids: None,
            group_id,
            unread_only: true,
            exclude_archived: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPatch {
    Read,
    Archive,
    Delete,
}
