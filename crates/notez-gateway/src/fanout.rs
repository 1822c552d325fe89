use chrono::{Duration, Utc};
use tracing::{debug, error, warn};
use uuid::Uuid;

use notez_types::events::ServerEvent;
use notez_types::models::{
    Delivery, DeliveryChannel, DeliveryStatus, NOTIFICATION_TTL_DAYS, Notification,
    NotificationKind, Priority, RelatedEntity,
};

use crate::broadcaster::Broadcaster;
use crate::error::{GatewayError, GatewayResult};
use crate::store::Services;

/// Everything about a notification except who receives it.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub sender_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub kind: NotificationKind,
    pub priority: Priority,
    pub group_id: Option<Uuid>,
    pub related: Option<RelatedEntity>,
}

impl NotificationDraft {
    pub fn new(kind: NotificationKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender_id: None,
            title: title.into(),
            body: body.into(),
            kind,
            priority: Priority::Normal,
            group_id: None,
            related: None,
        }
    }

    pub fn from_sender(mut self, sender_id: Uuid) -> Self {
        self.sender_id = Some(sender_id);
        self
    }

    pub fn in_group(mut self, group_id: Uuid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn about(mut self, related: RelatedEntity) -> Self {
        self.related = Some(related);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    fn for_recipient(&self, recipient_id: Uuid) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            recipient_id,
            sender_id: self.sender_id,
            title: self.title.clone(),
            body: self.body.clone(),
            kind: self.kind,
            priority: self.priority,
            group_id: self.group_id,
            related: self.related,
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
}

/// Persists one notification per recipient and pushes it to whoever is online.
#[derive(Clone)]
pub struct NotificationFanout {
    services: Services,
    broadcaster: Broadcaster,
}

impl NotificationFanout {
    pub fn new(services: Services, broadcaster: Broadcaster) -> Self {
        Self {
            services,
            broadcaster,
        }
    }

    /// Deliver `draft` to each distinct recipient independently. A failure for
    /// one recipient is logged and does not stop the rest. Returns the rows
    /// that were persisted, with their live delivery status.
    pub async fn notify<I>(&self, recipients: I, draft: &NotificationDraft) -> Vec<Notification>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let mut seen = Vec::new();
        let mut delivered = Vec::new();

        for recipient_id in recipients {
            if seen.contains(&recipient_id) {
                continue;
            }
            seen.push(recipient_id);

            let notification = match self
                .services
                .create_notification(draft.for_recipient(recipient_id))
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    error!(
                        "Failed to persist {} notification for {}: {}",
                        draft.kind.as_str(),
                        recipient_id,
                        e
                    );
                    continue;
                }
            };

            delivered.push(self.push(notification).await);
        }
        delivered
    }

    /// Live push of an already persisted row, recording the outcome.
    async fn push(&self, mut notification: Notification) -> Notification {
        let delivery = self
            .broadcaster
            .send_to_identity(
                notification.recipient_id,
                ServerEvent::Notification {
                    notification: notification.clone(),
                },
            )
            .await;

        let status = if delivery.delivered > 0 {
            DeliveryStatus::Sent
        } else if delivery.attempted > 0 {
            DeliveryStatus::Failed
        } else {
            // Offline: the row waits for the next query.
            return notification;
        };

        notification.delivery.live = status;
        if let Err(e) = self
            .services
            .set_delivery(notification.id, DeliveryChannel::Live, status)
            .await
        {
            warn!(
                "Failed to record live delivery of notification {}: {}",
                notification.id, e
            );
        }
        notification
    }

    /// The recipient confirms a pushed notification reached the client.
    pub async fn acknowledge(&self, recipient_id: Uuid, notification_id: Uuid) -> GatewayResult<()> {
        if self
            .services
            .notification(recipient_id, notification_id)
            .await?
            .is_none()
        {
            return Err(GatewayError::NotFound("notification"));
        }
        self.services
            .set_delivery(notification_id, DeliveryChannel::Live, DeliveryStatus::Delivered)
            .await?;
        debug!("Notification {} delivered to {}", notification_id, recipient_id);
        Ok(())
    }
}
