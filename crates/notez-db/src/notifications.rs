use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use uuid::Uuid;

use notez_types::api::NotificationStats;
use notez_types::models::{
    Delivery, DeliveryChannel, DeliveryStatus, EntityKind, Notification, NotificationKind,
    NotificationMatch, NotificationPatch, NotificationQuery, Priority, RelatedEntity,
};

use crate::Database;
use crate::rows::{enum_col, opt_uuid_col, uuid_col};

pub const MAX_NOTIFICATION_LIMIT: u32 = 100;

const NOTIFICATION_COLUMNS: &str = "id, recipient_id, sender_id, title, body, kind, priority,
    group_id, related_kind, related_id, is_read, read_at, is_archived, archived_at,
    live_status, email_status, scheduled_for, expires_at, created_at";

type SqlParams = Vec<Box<dyn ToSql>>;

impl Database {
    pub fn insert_notification(&self, n: &Notification) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notifications (
                    id, recipient_id, sender_id, title, body, kind, priority,
                    group_id, related_kind, related_id, is_read, read_at, is_archived, archived_at,
                    live_status, email_status, scheduled_for, expires_at, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                rusqlite::params![
                    n.id.to_string(),
                    n.recipient_id.to_string(),
                    n.sender_id.map(|id| id.to_string()),
                    n.title,
                    n.body,
                    n.kind.as_str(),
                    n.priority.as_str(),
                    n.group_id.map(|id| id.to_string()),
                    n.related.map(|r| r.kind.as_str()),
                    n.related.map(|r| r.id.to_string()),
                    n.is_read,
                    n.read_at,
                    n.is_archived,
                    n.archived_at,
                    n.delivery.live.as_str(),
                    n.delivery.email.as_str(),
                    n.scheduled_for,
                    n.expires_at,
                    n.created_at,
                ],
            )?;
            Ok(())
        })
    }

    /// A single notification, only if it belongs to `recipient_id`.
    pub fn notification(&self, recipient_id: Uuid, id: Uuid) -> Result<Option<Notification>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM notifications WHERE id = ?1 AND recipient_id = ?2",
                NOTIFICATION_COLUMNS
            );
            let n = conn
                .query_row(
                    &sql,
                    rusqlite::params![id.to_string(), recipient_id.to_string()],
                    map_notification,
                )
                .optional()?;
            Ok(n)
        })
    }

    /// A recipient's notifications, newest first.
    pub fn list_notifications(
        &self,
        recipient_id: Uuid,
        query: &NotificationQuery,
    ) -> Result<Vec<Notification>> {
        let mut clauses = vec!["recipient_id = ?".to_string()];
        let mut params: SqlParams = vec![Box::new(recipient_id.to_string())];

        if !query.include_archived {
            clauses.push("is_archived = 0".into());
        }
        if query.unread_only {
            clauses.push("is_read = 0".into());
        }
        if let Some(kind) = query.kind {
            clauses.push("kind = ?".into());
            params.push(Box::new(kind.as_str()));
        }
        if let Some(group_id) = query.group_id {
            clauses.push("group_id = ?".into());
            params.push(Box::new(group_id.to_string()));
        }
        params.push(Box::new(query.limit.clamp(1, MAX_NOTIFICATION_LIMIT) as i64));
        params.push(Box::new(query.skip as i64));

        let sql = format!(
            "SELECT {} FROM notifications WHERE {}
             ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?",
            NOTIFICATION_COLUMNS,
            clauses.join(" AND ")
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                    map_notification,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Unread, non-archived notifications of a recipient.
    pub fn unread_count(&self, recipient_id: Uuid, group_id: Option<Uuid>) -> Result<u64> {
        let (where_sql, params) = match_clause(&NotificationMatch::unread(recipient_id, group_id));
        let sql = format!("SELECT COUNT(*) FROM notifications WHERE {}", where_sql);
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                &sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                |r| r.get(0),
            )?;
            Ok(count as u64)
        })
    }

    /// Totals for one recipient, archived rows included.
    pub fn notification_stats(&self, recipient_id: Uuid) -> Result<NotificationStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, priority, COUNT(*), SUM(CASE WHEN is_read = 0 THEN 1 ELSE 0 END)
                 FROM notifications
                 WHERE recipient_id = ?1
                 GROUP BY kind, priority",
            )?;
            let rows = stmt.query_map([recipient_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut stats = NotificationStats::default();
            for row in rows {
                let (kind, priority, count, unread) = row?;
                let count = count as u64;
                stats.total += count;
                stats.unread += unread as u64;
                *stats.by_kind.entry(kind).or_default() += count;
                *stats.by_priority.entry(priority).or_default() += count;
            }
            Ok(stats)
        })
    }

    /// Apply one patch to every row selected by `selection` in a single statement.
    /// Returns the number of rows touched.
    pub fn bulk_update_notifications(
        &self,
        selection: &NotificationMatch,
        patch: NotificationPatch,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let (where_sql, mut params) = match_clause(selection);

        let sql = match patch {
            NotificationPatch::Read => {
                params.insert(0, Box::new(now));
                format!(
                    "UPDATE notifications SET is_read = 1, read_at = COALESCE(read_at, ?) WHERE {}",
                    where_sql
                )
            }
            NotificationPatch::Archive => {
                params.insert(0, Box::new(now));
                format!(
                    "UPDATE notifications SET is_archived = 1, archived_at = COALESCE(archived_at, ?) WHERE {}",
                    where_sql
                )
            }
            NotificationPatch::Delete => format!("DELETE FROM notifications WHERE {}", where_sql),
        };

        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let updated = tx.execute(
                &sql,
                rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
            )?;
            tx.commit()?;
            Ok(updated)
        })
    }

    pub fn set_delivery_status(
        &self,
        id: Uuid,
        channel: DeliveryChannel,
        status: DeliveryStatus,
    ) -> Result<()> {
        let column = match channel {
            DeliveryChannel::Live => "live_status",
            DeliveryChannel::Email => "email_status",
        };
        let sql = format!("UPDATE notifications SET {} = ?2 WHERE id = ?1", column);
        self.with_conn_mut(|conn| {
            conn.execute(&sql, rusqlite::params![id.to_string(), status.as_str()])?;
            Ok(())
        })
    }

    /// Remove every notification whose expiry has passed. Returns the number removed.
    pub fn delete_expired_notifications(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn_mut(|conn| purge_expired(conn, now))
    }
}

fn purge_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let removed = conn.execute("DELETE FROM notifications WHERE expires_at <= ?1", [now])?;
    Ok(removed)
}

fn match_clause(selection: &NotificationMatch) -> (String, SqlParams) {
    let mut clauses = vec!["recipient_id = ?".to_string()];
    let mut params: SqlParams = vec![Box::new(selection.recipient_id.to_string())];

    if let Some(ids) = &selection.ids {
        if ids.is_empty() {
            clauses.push("0".into());
        } else {
            let marks = vec!["?"; ids.len()].join(", ");
            clauses.push(format!("id IN ({})", marks));
            params.extend(ids.iter().map(|id| Box::new(id.to_string()) as Box<dyn ToSql>));
        }
    }
    if let Some(group_id) = selection.group_id {
        clauses.push("group_id = ?".into());
        params.push(Box::new(group_id.to_string()));
    }
    if selection.unread_only {
        clauses.push("is_read = 0".into());
    }
    if selection.exclude_archived {
        clauses.push("is_archived = 0".into());
    }

    (clauses.join(" AND "), params)
}

fn map_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let related_kind: Option<String> = row.get(8)?;
    let related = match (related_kind, opt_uuid_col(row, 9)?) {
        (Some(kind), Some(id)) => EntityKind::parse(&kind).map(|kind| RelatedEntity { kind, id }),
        _ => None,
    };

    Ok(Notification {
        id: uuid_col(row, 0)?,
        recipient_id: uuid_col(row, 1)?,
        sender_id: opt_uuid_col(row, 2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        kind: enum_col(row, 5, NotificationKind::parse)?,
        priority: enum_col(row, 6, Priority::parse)?,
        group_id: opt_uuid_col(row, 7)?,
        related,
        is_read: row.get(10)?,
        read_at: row.get(11)?,
        is_archived: row.get(12)?,
        archived_at: row.get(13)?,
        delivery: Delivery {
            live: enum_col(row, 14, DeliveryStatus::parse)?,
            email: enum_col(row, 15, DeliveryStatus::parse)?,
        },
        scheduled_for: row.get(16)?,
        expires_at: row.get(17)?,
        created_at: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use notez_types::models::NOTIFICATION_TTL_DAYS;

    fn draft(recipient: Uuid, group: Option<Uuid>) -> Notification {
        let now = Utc::now();
        Notification {
            id: Uuid::new_v4(),
            recipient_id: recipient,
            sender_id: Some(Uuid::new_v4()),
            title: "You were mentioned".into(),
            body: "hi @bob".into(),
            kind: NotificationKind::ChatMention,
            priority: Priority::Normal,
            group_id: group,
            related: Some(RelatedEntity {
                kind: EntityKind::Message,
                id: Uuid::new_v4(),
            }),
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

    #[test]
    fn test_insert_and_scoped_lookup() {
        let db = Database::open_in_memory().unwrap();
        let bob = Uuid::new_v4();
        let n = draft(bob, None);
        db.insert_notification(&n).unwrap();

        assert_eq!(db.notification(bob, n.id).unwrap(), Some(n.clone()));
        // Someone else's id lookup must not leak the row.
        assert!(db.notification(Uuid::new_v4(), n.id).unwrap().is_none());
    }

    #[test]
    fn test_mark_all_read_touches_only_recipient() {
        let db = Database::open_in_memory().unwrap();
        let (u, other) = (Uuid::new_v4(), Uuid::new_v4());
        let group = Uuid::new_v4();

        for _ in 0..3 {
            db.insert_notification(&draft(u, Some(group))).unwrap();
        }
        let mut archived = draft(u, None);
        archived.is_archived = true;
        archived.archived_at = Some(Utc::now());
        db.insert_notification(&archived).unwrap();
        db.insert_notification(&draft(other, Some(group))).unwrap();

        assert_eq!(db.unread_count(u, None).unwrap(), 3);

        let updated = db
            .bulk_update_notifications(
                &NotificationMatch::unread(u, None),
                NotificationPatch::Read,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(updated, 3);
        assert_eq!(db.unread_count(u, None).unwrap(), 0);
        assert_eq!(db.unread_count(other, None).unwrap(), 1);

        let still_unread = db.notification(u, archived.id).unwrap().unwrap();
        assert!(!still_unread.is_read);

        // Already read rows are not matched again.
        let again = db
            .bulk_update_notifications(
                &NotificationMatch::unread(u, None),
                NotificationPatch::Read,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(again, 0);
    }

    #[test]
    fn test_stats_per_recipient() {
        let db = Database::open_in_memory().unwrap();
        let u = Uuid::new_v4();
        assert_eq!(db.notification_stats(u).unwrap(), NotificationStats::default());

        let mut urgent = draft(u, None);
        urgent.kind = NotificationKind::GroupInvite;
        urgent.priority = Priority::Urgent;
        let mut read = draft(u, None);
        read.is_read = true;
        read.read_at = Some(Utc::now());
        let mut archived = draft(u, None);
        archived.is_archived = true;
        for n in [&urgent, &read, &archived, &draft(Uuid::new_v4(), None)] {
            db.insert_notification(n).unwrap();
        }

        let stats = db.notification_stats(u).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.unread, 2);
        assert_eq!(stats.by_kind.get("chat_mention"), Some(&2));
        assert_eq!(stats.by_kind.get("group_invite"), Some(&1));
        assert_eq!(stats.by_priority.get("normal"), Some(&2));
        assert_eq!(stats.by_priority.get("urgent"), Some(&1));
    }

    #[test]
    fn test_bulk_by_ids_and_delete() {
        let db = Database::open_in_memory().unwrap();
        let u = Uuid::new_v4();
        let a = draft(u, None);
        let b = draft(u, None);
        let foreign = draft(Uuid::new_v4(), None);
        for n in [&a, &b, &foreign] {
            db.insert_notification(n).unwrap();
        }

        let archived = db
            .bulk_update_notifications(
                &NotificationMatch::ids(u, vec![a.id, foreign.id]),
                NotificationPatch::Archive,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(archived, 1);

        let listed = db.list_notifications(u, &NotificationQuery::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b.id);

        let all = db
            .list_notifications(
                u,
                &NotificationQuery {
                    include_archived: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(all.len(), 2);

        let deleted = db
            .bulk_update_notifications(
                &NotificationMatch::ids(u, vec![b.id]),
                NotificationPatch::Delete,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(db.notification(u, b.id).unwrap().is_none());

        let none = db
            .bulk_update_notifications(
                &NotificationMatch::ids(u, Vec::new()),
                NotificationPatch::Delete,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(none, 0);
    }

    #[test]
    fn test_list_filters_and_order() {
        let db = Database::open_in_memory().unwrap();
        let u = Uuid::new_v4();
        let group = Uuid::new_v4();

        let first = draft(u, Some(group));
        db.insert_notification(&first).unwrap();
        let mut invite = draft(u, None);
        invite.kind = NotificationKind::GroupInvite;
        db.insert_notification(&invite).unwrap();

        let listed = db.list_notifications(u, &NotificationQuery::default()).unwrap();
        assert_eq!(listed[0].id, invite.id);

        let invites = db
            .list_notifications(
                u,
                &NotificationQuery {
                    kind: Some(NotificationKind::GroupInvite),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(invites.len(), 1);

        let in_group = db
            .list_notifications(
                u,
                &NotificationQuery {
                    group_id: Some(group),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(in_group[0].id, first.id);
    }

    #[test]
    fn test_delivery_status_and_expiry() {
        let db = Database::open_in_memory().unwrap();
        let u = Uuid::new_v4();
        let live = draft(u, None);
        let mut stale = draft(u, None);
        stale.expires_at = Utc::now() - Duration::minutes(1);
        db.insert_notification(&live).unwrap();
        db.insert_notification(&stale).unwrap();

        db.set_delivery_status(live.id, DeliveryChannel::Live, DeliveryStatus::Sent)
            .unwrap();
        let stored = db.notification(u, live.id).unwrap().unwrap();
        assert_eq!(stored.delivery.live, DeliveryStatus::Sent);
        assert_eq!(stored.delivery.email, DeliveryStatus::Disabled);

        assert_eq!(db.delete_expired_notifications(Utc::now()).unwrap(), 1);
        assert!(db.notification(u, stale.id).unwrap().is_none());
        assert!(db.notification(u, live.id).unwrap().is_some());
    }
}
