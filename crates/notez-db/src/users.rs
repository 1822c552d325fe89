use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use notez_types::models::User;

use crate::Database;
use crate::rows::uuid_col;

const USER_COLUMNS: &str = "id, username, is_active, last_active_at, created_at";

impl Database {
    pub fn create_user(&self, id: Uuid, username: &str) -> Result<User> {
        let user = User {
            id,
            username: username.to_string(),
            is_active: true,
            last_active_at: None,
            created_at: Utc::now(),
        };

        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, is_active, created_at) VALUES (?1, ?2, 1, ?3)",
                rusqlite::params![user.id.to_string(), user.username, user.created_at],
            )?;
            Ok(())
        })?;

        Ok(user)
    }

    pub fn user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, "id", &id.to_string()))
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn set_user_active(&self, id: Uuid, active: bool) -> Result<()> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users SET is_active = ?2 WHERE id = ?1",
                rusqlite::params![id.to_string(), active],
            )?;
            if changed == 0 {
                return Err(anyhow!("User not found: {}", id));
            }
            Ok(())
        })
    }

    pub fn touch_last_active(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE users SET last_active_at = ?2 WHERE id = ?1",
                rusqlite::params![id.to_string(), at],
            )?;
            Ok(())
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column);
    let user = conn.query_row(&sql, [value], map_user).optional()?;
    Ok(user)
}

fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_col(row, 0)?,
        username: row.get(1)?,
        is_active: row.get(2)?,
        last_active_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}
