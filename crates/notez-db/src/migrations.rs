use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                username        TEXT NOT NULL UNIQUE,
                is_active       INTEGER NOT NULL DEFAULT 1,
                last_active_at  TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE groups (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                admin_id    TEXT NOT NULL REFERENCES users(id),
                created_at  TEXT NOT NULL
            );

            CREATE TABLE group_members (
                group_id                TEXT NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
                user_id                 TEXT NOT NULL REFERENCES users(id),
                role                    TEXT NOT NULL DEFAULT 'member',
                can_create_content      INTEGER NOT NULL DEFAULT 1,
                can_edit_content        INTEGER NOT NULL DEFAULT 0,
                can_delete_content      INTEGER NOT NULL DEFAULT 0,
                can_invite_members      INTEGER NOT NULL DEFAULT 0,
                can_create_sub_groups   INTEGER NOT NULL DEFAULT 0,
                can_moderate_chat       INTEGER NOT NULL DEFAULT 0,
                status                  TEXT NOT NULL DEFAULT 'active',
                joined_at               TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );

            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                group_id        TEXT NOT NULL REFERENCES groups(id),
                author_id       TEXT NOT NULL REFERENCES users(id),
                author_username TEXT NOT NULL,
                content         TEXT NOT NULL,
                kind            TEXT NOT NULL DEFAULT 'text',
                thread_id       TEXT,
                mentions        TEXT NOT NULL DEFAULT '[]',
                edit_history    TEXT NOT NULL DEFAULT '[]',
                is_edited       INTEGER NOT NULL DEFAULT 0,
                edited_at       TEXT,
                reactions       TEXT NOT NULL DEFAULT '[]',
                reaction_count  INTEGER NOT NULL DEFAULT 0,
                read_by         TEXT NOT NULL DEFAULT '[]',
                is_deleted      INTEGER NOT NULL DEFAULT 0,
                deleted_at      TEXT,
                deleted_by      TEXT,
                poll            TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_messages_group
                ON messages(group_id, created_at);

            CREATE INDEX idx_messages_thread
                ON messages(thread_id);

            CREATE TABLE notifications (
                id              TEXT PRIMARY KEY,
                recipient_id    TEXT NOT NULL,
                sender_id       TEXT,
                title           TEXT NOT NULL,
                body            TEXT NOT NULL,
                kind            TEXT NOT NULL,
                priority        TEXT NOT NULL DEFAULT 'normal',
                group_id        TEXT,
                related_kind    TEXT,
                related_id      TEXT,
                is_read         INTEGER NOT NULL DEFAULT 0,
                read_at         TEXT,
                is_archived     INTEGER NOT NULL DEFAULT 0,
                archived_at     TEXT,
                live_status     TEXT NOT NULL DEFAULT 'pending',
                email_status    TEXT NOT NULL DEFAULT 'disabled',
                scheduled_for   TEXT NOT NULL,
                expires_at      TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX idx_notifications_recipient
                ON notifications(recipient_id, created_at);

            CREATE INDEX idx_notifications_expiry
                ON notifications(expires_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    if version < 2 {
        info!("Running migration v2 (message reply counts)");
        conn.execute_batch(
            "
            ALTER TABLE messages ADD COLUMN reply_count INTEGER NOT NULL DEFAULT 0;

            UPDATE messages SET reply_count = (
                SELECT COUNT(*) FROM messages AS r WHERE r.thread_id = messages.id
            );

            INSERT INTO schema_version (version) VALUES (2);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
