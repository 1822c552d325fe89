use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use uuid::Uuid;

use notez_types::api::MessageStats;
use notez_types::models::{Message, MessageKind};

use crate::Database;
use crate::rows::{enum_col, json_col, opt_json_col, opt_uuid_col, uuid_col};

pub const MAX_HISTORY_LIMIT: u32 = 100;
pub const DEFAULT_SEARCH_LIMIT: u32 = 20;
pub const MAX_SEARCH_LIMIT: u32 = 50;

const MESSAGE_COLUMNS: &str = "id, group_id, author_id, author_username, content, kind,
    thread_id, mentions, edit_history, is_edited, edited_at, reactions, reaction_count,
    read_by, is_deleted, deleted_at, deleted_by, poll, created_at, reply_count";

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        self.with_conn_mut(|conn| insert_row(conn, message))
    }

    /// Insert a thread reply and bump its parent's reply count in one transaction.
    ///
    /// Returns the updated parent, or `None` (and inserts nothing) when the
    /// parent does not exist or belongs to another group.
    pub fn insert_reply(&self, reply: &Message) -> Result<Option<Message>> {
        let parent_id = reply
            .thread_id
            .ok_or_else(|| anyhow!("Reply {} has no parent", reply.id))?;

        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let Some(mut parent) = load_message(&tx, parent_id)? else {
                return Ok(None);
            };
            if parent.group_id != reply.group_id {
                return Ok(None);
            }

            parent.reply_count += 1;
            store_message_state(&tx, &parent)?;
            insert_row(&tx, reply)?;
            tx.commit()?;
            Ok(Some(parent))
        })
    }

    pub fn message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| load_message(conn, id))
    }

    /// Read-modify-write of one message inside a transaction.
    ///
    /// `mutate` returns whether it changed anything; unchanged messages are not
    /// written back. An error from `mutate` rolls back and is returned as-is.
    /// Returns `None` when the message does not exist.
    pub fn update_message<E, F>(&self, id: Uuid, mutate: F) -> std::result::Result<Option<(Message, bool)>, E>
    where
        E: From<anyhow::Error>,
        F: FnOnce(&mut Message) -> std::result::Result<bool, E>,
    {
        let conn = self.lock().map_err(E::from)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| E::from(anyhow::Error::from(e)))?;

        let Some(mut message) = load_message(&tx, id).map_err(E::from)? else {
            return Ok(None);
        };

        // Dropping `tx` on the error path rolls back.
        let changed = mutate(&mut message)?;
        if changed {
            store_message_state(&tx, &message).map_err(E::from)?;
        }
        tx.commit().map_err(|e| E::from(anyhow::Error::from(e)))?;

        Ok(Some((message, changed)))
    }

    /// Most recent visible top-level messages of a group, oldest first.
    pub fn recent_messages(&self, group_id: Uuid, limit: u32) -> Result<Vec<Message>> {
        self.group_messages(group_id, limit, None, None)
    }

    /// A page of visible history, oldest first.
    ///
    /// Without `thread` only top-level messages are returned; with it, only
    /// replies to that parent. `before` pages backwards from a timestamp.
    pub fn group_messages(
        &self,
        group_id: Uuid,
        limit: u32,
        before: Option<DateTime<Utc>>,
        thread: Option<Uuid>,
    ) -> Result<Vec<Message>> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);

        let mut clauses = vec!["group_id = ?".to_string(), "is_deleted = 0".to_string()];
        let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(group_id.to_string())];

        match thread {
            Some(parent) => {
                clauses.push("thread_id = ?".into());
                params.push(Box::new(parent.to_string()));
            }
            None => clauses.push("thread_id IS NULL".into()),
        }
        if let Some(before) = before {
            clauses.push("created_at < ?".into());
            params.push(Box::new(before));
        }
        params.push(Box::new(limit as i64));

        let sql = format!(
            "SELECT {} FROM messages WHERE {} ORDER BY created_at DESC, rowid DESC LIMIT ?",
            MESSAGE_COLUMNS,
            clauses.join(" AND ")
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut messages = stmt
                .query_map(
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                    map_message,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            messages.reverse();
            Ok(messages)
        })
    }

    /// Counts over the group's visible messages, replies included.
    pub fn message_stats(&self, group_id: Uuid) -> Result<MessageStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, COUNT(*), COALESCE(SUM(reaction_count), 0), COALESCE(SUM(reply_count), 0)
                 FROM messages
                 WHERE group_id = ?1 AND is_deleted = 0
                 GROUP BY kind",
            )?;
            let rows = stmt.query_map([group_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut stats = MessageStats::default();
            for row in rows {
                let (kind, count, reactions, replies) = row?;
                stats.total_messages += count as u64;
                stats.total_reactions += reactions as u64;
                stats.total_replies += replies as u64;
                stats.by_kind.insert(kind, count as u64);
            }
            Ok(stats)
        })
    }

    /// Case-insensitive token search over visible messages of a group,
    /// most relevant first, ties broken by recency.
    pub fn search_messages(
        &self,
        group_id: Uuid,
        query: &str,
        limit: u32,
        skip: u32,
    ) -> Result<Vec<Message>> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Err(anyhow!("Search query is empty"));
        }
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT) as usize;

        // SQLite only folds ASCII case, so matching happens on the Rust side.
        let sql = format!(
            "SELECT {} FROM messages
             WHERE group_id = ?1 AND is_deleted = 0
             ORDER BY created_at DESC, rowid DESC",
            MESSAGE_COLUMNS
        );

        let candidates = self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([group_id.to_string()], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        let mut scored: Vec<(usize, Message)> = candidates
            .into_iter()
            .map(|m| (relevance(&m.content, &tokens), m))
            .filter(|(score, _)| *score > 0)
            .collect();
        // Stable sort keeps the recency order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .skip(skip as usize)
            .take(limit)
            .map(|(_, m)| m)
            .collect())
    }
}

fn insert_row(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (
            id, group_id, author_id, author_username, content, kind,
            thread_id, mentions, edit_history, is_edited, edited_at, reactions,
            reaction_count, read_by, is_deleted, deleted_at, deleted_by, poll, created_at,
            reply_count
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        rusqlite::params![
            message.id.to_string(),
            message.group_id.to_string(),
            message.author_id.to_string(),
            message.author_username,
            message.content,
            message.kind.as_str(),
            message.thread_id.map(|id| id.to_string()),
            serde_json::to_string(&message.mentions)?,
            serde_json::to_string(&message.edit_history)?,
            message.is_edited,
            message.edited_at,
            serde_json::to_string(&message.reactions)?,
            message.reaction_count as i64,
            serde_json::to_string(&message.read_by)?,
            message.is_deleted,
            message.deleted_at,
            message.deleted_by.map(|id| id.to_string()),
            message.poll.as_ref().map(serde_json::to_string).transpose()?,
            message.created_at,
            message.reply_count as i64,
        ],
    )?;
    Ok(())
}

fn load_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let sql = format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS);
    let message = conn
        .query_row(&sql, [id.to_string()], map_message)
        .optional()?;
    Ok(message)
}

/// Writes back every mutable column. Identity, author and kind never change.
fn store_message_state(conn: &Connection, message: &Message) -> Result<()> {
    let poll = message.poll.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "UPDATE messages SET
            content = ?2, mentions = ?3, edit_history = ?4, is_edited = ?5, edited_at = ?6,
            reactions = ?7, reaction_count = ?8, read_by = ?9, is_deleted = ?10,
            deleted_at = ?11, deleted_by = ?12, poll = ?13, reply_count = ?14
         WHERE id = ?1",
        rusqlite::params![
            message.id.to_string(),
            message.content,
            serde_json::to_string(&message.mentions)?,
            serde_json::to_string(&message.edit_history)?,
            message.is_edited,
            message.edited_at,
            serde_json::to_string(&message.reactions)?,
            message.reaction_count as i64,
            serde_json::to_string(&message.read_by)?,
            message.is_deleted,
            message.deleted_at,
            message.deleted_by.map(|id| id.to_string()),
            poll,
            message.reply_count as i64,
        ],
    )?;
    Ok(())
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        group_id: uuid_col(row, 1)?,
        author_id: uuid_col(row, 2)?,
        author_username: row.get(3)?,
        content: row.get(4)?,
        kind: enum_col(row, 5, MessageKind::parse)?,
        thread_id: opt_uuid_col(row, 6)?,
        mentions: json_col(row, 7)?,
        edit_history: json_col(row, 8)?,
        is_edited: row.get(9)?,
        edited_at: row.get(10)?,
        reactions: json_col(row, 11)?,
        reaction_count: row.get::<_, i64>(12)? as usize,
        read_by: json_col(row, 13)?,
        is_deleted: row.get(14)?,
        deleted_at: row.get(15)?,
        deleted_by: opt_uuid_col(row, 16)?,
        poll: opt_json_col(row, 17)?,
        created_at: row.get(18)?,
        reply_count: row.get::<_, i64>(19)? as usize,
    })
}

fn tokenize(query: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in query.split_whitespace().map(str::to_lowercase) {
        if !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

/// Total number of (non-overlapping) token occurrences in `content`.
fn relevance(content: &str, tokens: &[String]) -> usize {
    let haystack = content.to_lowercase();
    tokens
        .iter()
        .map(|t| haystack.matches(t.as_str()).count())
        .sum()
}
