//! Collaborator seams of the realtime core.
//!
//! The traits are synchronous because the only shipped implementation is
//! SQLite; `Services` moves every call onto the blocking pool so no room or
//! registry lock is ever held across one.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use notez_db::Database;
use notez_types::models::{
    DeliveryChannel, DeliveryStatus, GroupMember, Message, Notification, NotificationMatch,
    NotificationPatch, NotificationQuery, Permission, Role, User,
};

use crate::error::{GatewayError, GatewayResult};

pub type Mutator<'a> = &'a mut dyn FnMut(&mut Message) -> GatewayResult<bool>;

pub trait MembershipOracle: Send + Sync {
    /// Membership row regardless of status.
    fn member(&self, group_id: Uuid, user_id: Uuid) -> Result<Option<GroupMember>>;

    /// Active members only.
    fn members(&self, group_id: Uuid) -> Result<Vec<GroupMember>>;

    fn is_member(&self, group_id: Uuid, user_id: Uuid) -> Result<bool> {
        Ok(self
            .member(group_id, user_id)?
            .is_some_and(|m| m.is_active()))
    }

    fn has_permission(&self, group_id: Uuid, user_id: Uuid, permission: Permission) -> Result<bool> {
        Ok(self
            .member(group_id, user_id)?
            .is_some_and(|m| m.has_permission(permission)))
    }

    fn role(&self, group_id: Uuid, user_id: Uuid) -> Result<Option<Role>> {
        Ok(self
            .member(group_id, user_id)?
            .filter(|m| m.is_active())
            .map(|m| m.role))
    }
}

pub trait MessageStore: Send + Sync {
    fn create_message(&self, message: &Message) -> Result<()>;

    /// Insert a thread reply and count it on the parent atomically. `None`
    /// when the parent is missing or in another group.
    fn create_reply(&self, reply: &Message) -> Result<Option<Message>>;

    fn message(&self, id: Uuid) -> Result<Option<Message>>;

    /// Atomic read-modify-write. The mutator reports whether it changed the
    /// message and may abort the whole update with an error.
    fn update_message(&self, id: Uuid, mutate: Mutator<'_>) -> GatewayResult<Option<(Message, bool)>>;

    fn recent_messages(&self, group_id: Uuid, limit: u32) -> Result<Vec<Message>>;

    fn search_messages(&self, group_id: Uuid, query: &str, limit: u32, skip: u32) -> Result<Vec<Message>>;
}

pub trait NotificationStore: Send + Sync {
    fn create_notification(&self, notification: &Notification) -> Result<()>;

    fn bulk_update(
        &self,
        selection: &NotificationMatch,
        patch: NotificationPatch,
        now: DateTime<Utc>,
    ) -> Result<usize>;

    fn query_notifications(&self, recipient_id: Uuid, filter: &NotificationQuery) -> Result<Vec<Notification>>;

    /// Point lookup scoped to the recipient.
    fn notification(&self, recipient_id: Uuid, id: Uuid) -> Result<Option<Notification>>;

    fn set_delivery(&self, id: Uuid, channel: DeliveryChannel, status: DeliveryStatus) -> Result<()>;
}

pub trait IdentityStore: Send + Sync {
    fn user(&self, id: Uuid) -> Result<Option<User>>;

    fn touch_last_active(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

// -- SQLite implementations --

impl MembershipOracle for Database {
    fn member(&self, group_id: Uuid, user_id: Uuid) -> Result<Option<GroupMember>> {
        Database::member(self, group_id, user_id)
    }

    fn members(&self, group_id: Uuid) -> Result<Vec<GroupMember>> {
        self.active_members(group_id)
    }
}

impl MessageStore for Database {
    fn create_message(&self, message: &Message) -> Result<()> {
        self.insert_message(message)
    }

    fn create_reply(&self, reply: &Message) -> Result<Option<Message>> {
        self.insert_reply(reply)
    }

    fn message(&self, id: Uuid) -> Result<Option<Message>> {
        Database::message(self, id)
    }

    fn update_message(&self, id: Uuid, mutate: Mutator<'_>) -> GatewayResult<Option<(Message, bool)>> {
        Database::update_message(self, id, |m| mutate(m))
    }

    fn recent_messages(&self, group_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        Database::recent_messages(self, group_id, limit)
    }

    fn search_messages(&self, group_id: Uuid, query: &str, limit: u32, skip: u32) -> Result<Vec<Message>> {
        Database::search_messages(self, group_id, query, limit, skip)
    }
}

impl NotificationStore for Database {
    fn create_notification(&self, notification: &Notification) -> Result<()> {
        self.insert_notification(notification)
    }

    fn bulk_update(
        &self,
        selection: &NotificationMatch,
        patch: NotificationPatch,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        self.bulk_update_notifications(selection, patch, now)
    }

    fn query_notifications(&self, recipient_id: Uuid, filter: &NotificationQuery) -> Result<Vec<Notification>> {
        self.list_notifications(recipient_id, filter)
    }

    fn notification(&self, recipient_id: Uuid, id: Uuid) -> Result<Option<Notification>> {
        Database::notification(self, recipient_id, id)
    }

    fn set_delivery(&self, id: Uuid, channel: DeliveryChannel, status: DeliveryStatus) -> Result<()> {
        self.set_delivery_status(id, channel, status)
    }
}

impl IdentityStore for Database {
    fn user(&self, id: Uuid) -> Result<Option<User>> {
        Database::user(self, id)
    }

    fn touch_last_active(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        Database::touch_last_active(self, id, at)
    }
}

/// The four collaborators, callable from async code.
#[derive(Clone)]
pub struct Services {
    pub membership: Arc<dyn MembershipOracle>,
    pub messages: Arc<dyn MessageStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub identities: Arc<dyn IdentityStore>,
}

async fn blocking<T, F>(f: F) -> GatewayResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

impl Services {
    pub fn from_database(db: Arc<Database>) -> Self {
        Self {
            membership: db.clone(),
            messages: db.clone(),
            notifications: db.clone(),
            identities: db,
        }
    }

    // -- Membership --

    /// Active membership of `user_id` in `group_id`. Oracle failures deny.
    pub async fn require_member(&self, group_id: Uuid, user_id: Uuid) -> GatewayResult<GroupMember> {
        let oracle = self.membership.clone();
        let member = blocking(move || Ok(oracle.member(group_id, user_id))).await?;
        match member {
            Ok(Some(m)) if m.is_active() => Ok(m),
            Ok(_) => Err(GatewayError::Forbidden),
            Err(e) => {
                warn!("Membership check failed for {} in {}: {:#}", user_id, group_id, e);
                Err(GatewayError::Forbidden)
            }
        }
    }

    pub async fn require_permission(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        permission: Permission,
    ) -> GatewayResult<GroupMember> {
        let member = self.require_member(group_id, user_id).await?;
        if member.has_permission(permission) {
            Ok(member)
        } else {
            Err(GatewayError::Forbidden)
        }
    }

    /// Membership row in any status, for checks that need to know about
    /// banned or muted users. Errors surface as store failures.
    pub async fn membership_record(&self, group_id: Uuid, user_id: Uuid) -> GatewayResult<Option<GroupMember>> {
        let oracle = self.membership.clone();
        blocking(move || Ok(oracle.member(group_id, user_id)?)).await
    }

    pub async fn active_members(&self, group_id: Uuid) -> GatewayResult<Vec<GroupMember>> {
        let oracle = self.membership.clone();
        blocking(move || Ok(oracle.members(group_id)?)).await
    }

    // -- Messages --

    pub async fn create_message(&self, message: Message) -> GatewayResult<Message> {
        let store = self.messages.clone();
        blocking(move || {
            store.create_message(&message)?;
            Ok(message)
        })
        .await
    }

    /// Returns the stored reply, or `None` when the parent is not in the reply's group.
    pub async fn create_reply(&self, reply: Message) -> GatewayResult<Option<Message>> {
        let store = self.messages.clone();
        blocking(move || Ok(store.create_reply(&reply)?.map(|_| reply))).await
    }

    pub async fn message(&self, id: Uuid) -> GatewayResult<Option<Message>> {
        let store = self.messages.clone();
        blocking(move || Ok(store.message(id)?)).await
    }

    pub async fn update_message<F>(&self, id: Uuid, mut mutate: F) -> GatewayResult<Option<(Message, bool)>>
    where
        F: FnMut(&mut Message) -> GatewayResult<bool> + Send + 'static,
    {
        let store = self.messages.clone();
        blocking(move || store.update_message(id, &mut mutate)).await
    }

    pub async fn recent_messages(&self, group_id: Uuid, limit: u32) -> GatewayResult<Vec<Message>> {
        let store = self.messages.clone();
        blocking(move || Ok(store.recent_messages(group_id, limit)?)).await
    }

    pub async fn search_messages(
        &self,
        group_id: Uuid,
        query: String,
        limit: u32,
        skip: u32,
    ) -> GatewayResult<Vec<Message>> {
        let store = self.messages.clone();
        blocking(move || Ok(store.search_messages(group_id, &query, limit, skip)?)).await
    }

    // -- Notifications --

    pub async fn create_notification(&self, notification: Notification) -> GatewayResult<Notification> {
        let store = self.notifications.clone();
        blocking(move || {
            store.create_notification(&notification)?;
            Ok(notification)
        })
        .await
    }

    pub async fn bulk_update_notifications(
        &self,
        selection: NotificationMatch,
        patch: NotificationPatch,
    ) -> GatewayResult<usize> {
        let store = self.notifications.clone();
        blocking(move || Ok(store.bulk_update(&selection, patch, Utc::now())?)).await
    }

    pub async fn query_notifications(
        &self,
        recipient_id: Uuid,
        filter: NotificationQuery,
    ) -> GatewayResult<Vec<Notification>> {
        let store = self.notifications.clone();
        blocking(move || Ok(store.query_notifications(recipient_id, &filter)?)).await
    }

    pub async fn notification(&self, recipient_id: Uuid, id: Uuid) -> GatewayResult<Option<Notification>> {
        let store = self.notifications.clone();
        blocking(move || Ok(store.notification(recipient_id, id)?)).await
    }

    pub async fn set_delivery(
        &self,
        id: Uuid,
        channel: DeliveryChannel,
        status: DeliveryStatus,
    ) -> GatewayResult<()> {
        let store = self.notifications.clone();
        blocking(move || Ok(store.set_delivery(id, channel, status)?)).await
    }

    // -- Identities --

    pub async fn user(&self, id: Uuid) -> GatewayResult<Option<User>> {
        let store = self.identities.clone();
        blocking(move || Ok(store.user(id)?)).await
    }

    pub async fn touch_last_active(&self, id: Uuid) -> GatewayResult<()> {
        let store = self.identities.clone();
        blocking(move || Ok(store.touch_last_active(id, Utc::now())?)).await
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use chrono::Duration;

    use notez_types::models::{
        Delivery, MemberPermissions, NOTIFICATION_TTL_DAYS, NotificationKind, Priority,
    };

    use super::*;

    struct BrokenOracle;

    impl MembershipOracle for BrokenOracle {
        fn member(&self, _: Uuid, _: Uuid) -> Result<Option<GroupMember>> {
            Err(anyhow!("membership backend unavailable"))
        }

        fn members(&self, _: Uuid) -> Result<Vec<GroupMember>> {
            Err(anyhow!("membership backend unavailable"))
        }
    }

    fn notification(recipient: Uuid, group: Option<Uuid>) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            recipient_id: recipient,
            sender_id: None,
            title: "t".into(),
            body: String::new(),
            kind: NotificationKind::ChatMessage,
            priority: Priority::Normal,
            group_id: group,
            related: None,
            is_read: false,
            read_at: None,
            is_archived: false,
            archived_at: None,
            delivery: Delivery::default(),
            scheduled_for: now,
            expires_at: now + Duration::days(NOTIFICATION_TTL_DAYS),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_oracle_failure_denies() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut services = Services::from_database(db);
        services.membership = Arc::new(BrokenOracle);

        let result = services.require_member(Uuid::new_v4(), Uuid::new_v4()).await;
        assert!(matches!(result, Err(GatewayError::Forbidden)));

        // Callers that need the raw record see the failure instead.
        let result = services.membership_record(Uuid::new_v4(), Uuid::new_v4()).await;
        assert!(matches!(result, Err(GatewayError::Store(_))));
    }

    #[tokio::test]
    async fn test_permission_check() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let admin = Uuid::new_v4();
        let member = Uuid::new_v4();
        db.create_user(admin, "admin").unwrap();
        db.create_user(member, "member").unwrap();
        let group = Uuid::new_v4();
        db.create_group(group, "g", admin).unwrap();
        db.add_member(group, member, Role::Member, &MemberPermissions::default())
            .unwrap();
        let services = Services::from_database(db);

        assert!(
            services
                .require_permission(group, member, Permission::CreateContent)
                .await
                .is_ok()
        );
        assert!(matches!(
            services
                .require_permission(group, member, Permission::ModerateChat)
                .await,
            Err(GatewayError::Forbidden)
        ));
        assert!(
            services
                .require_permission(group, admin, Permission::ModerateChat)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_mark_all_read_through_services() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let services = Services::from_database(db);
        let (me, other) = (Uuid::new_v4(), Uuid::new_v4());
        let group = Uuid::new_v4();

        for n in [
            notification(me, Some(group)),
            notification(me, None),
            notification(other, Some(group)),
        ] {
            services.create_notification(n).await.unwrap();
        }

        let updated = services
            .bulk_update_notifications(NotificationMatch::unread(me, None), NotificationPatch::Read)
            .await
            .unwrap();
        assert_eq!(updated, 2);

        let unread_only = NotificationQuery {
            unread_only: true,
            ..Default::default()
        };
        assert!(
            services
                .query_notifications(me, unread_only.clone())
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            services
                .query_notifications(other, unread_only)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
