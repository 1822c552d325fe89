use anyhow::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, Row};
use uuid::Uuid;

use notez_types::models::{GroupMember, MemberPermissions, MemberStatus, Role};

use crate::Database;
use crate::rows::{enum_col, uuid_col};

const MEMBER_COLUMNS: &str = "m.group_id, m.user_id, u.username, m.role,
    m.can_create_content, m.can_edit_content, m.can_delete_content,
    m.can_invite_members, m.can_create_sub_groups, m.can_moderate_chat,
    m.status, m.joined_at";

impl Database {
    /// Create a group and enrol its admin as the first member.
    pub fn create_group(&self, id: Uuid, name: &str, admin_id: Uuid) -> Result<()> {
        let now = Utc::now();
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO groups (id, name, admin_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![id.to_string(), name, admin_id.to_string(), now],
            )?;
            insert_member(&tx, id, admin_id, Role::Admin, &MemberPermissions::default())?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn add_member(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        role: Role,
        permissions: &MemberPermissions,
    ) -> Result<()> {
        self.with_conn_mut(|conn| insert_member(conn, group_id, user_id, role, permissions))
    }

    pub fn set_member_status(&self, group_id: Uuid, user_id: Uuid, status: MemberStatus) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE group_members SET status = ?3 WHERE group_id = ?1 AND user_id = ?2",
                rusqlite::params![group_id.to_string(), user_id.to_string(), status.as_str()],
            )?;
            Ok(())
        })
    }

    /// Membership row regardless of status.
    pub fn member(&self, group_id: Uuid, user_id: Uuid) -> Result<Option<GroupMember>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM group_members m JOIN users u ON u.id = m.user_id
                 WHERE m.group_id = ?1 AND m.user_id = ?2",
                MEMBER_COLUMNS
            );
            let member = conn
                .query_row(
                    &sql,
                    rusqlite::params![group_id.to_string(), user_id.to_string()],
                    map_member,
                )
                .optional()?;
            Ok(member)
        })
    }

    /// Active members of a group, in join order.
    pub fn active_members(&self, group_id: Uuid) -> Result<Vec<GroupMember>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM group_members m JOIN users u ON u.id = m.user_id
                 WHERE m.group_id = ?1 AND m.status = 'active'
                 ORDER BY m.joined_at, m.rowid",
                MEMBER_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let members = stmt
                .query_map([group_id.to_string()], map_member)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(members)
        })
    }
}

fn insert_member(
    conn: &rusqlite::Connection,
    group_id: Uuid,
    user_id: Uuid,
    role: Role,
    p: &MemberPermissions,
) -> Result<()> {
    conn.execute(
        "INSERT INTO group_members (
            group_id, user_id, role,
            can_create_content, can_edit_content, can_delete_content,
            can_invite_members, can_create_sub_groups, can_moderate_chat,
            status, joined_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'active', ?10)",
        rusqlite::params![
            group_id.to_string(),
            user_id.to_string(),
            role.as_str(),
            p.create_content,
            p.edit_content,
            p.delete_content,
            p.invite_members,
            p.create_sub_groups,
            p.moderate_chat,
            Utc::now(),
        ],
    )?;
    Ok(())
}

fn map_member(row: &Row<'_>) -> rusqlite::Result<GroupMember> {
    Ok(GroupMember {
        group_id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        username: row.get(2)?,
        role: enum_col(row, 3, Role::parse)?,
        permissions: MemberPermissions {
            create_content: row.get(4)?,
            edit_content: row.get(5)?,
            delete_content: row.get(6)?,
            invite_members: row.get(7)?,
            create_sub_groups: row.get(8)?,
            moderate_chat: row.get(9)?,
        },
        status: enum_col(row, 10, MemberStatus::parse)?,
        joined_at: row.get(11)?,
    })
}
