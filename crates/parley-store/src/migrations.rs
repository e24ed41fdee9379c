use rusqlite::Connection;
use tracing::info;

use crate::Result;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS channels (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            name        TEXT NOT NULL UNIQUE,
            creator_id  INTEGER NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            channel_id  INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            user_id     INTEGER NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
            PRIMARY KEY (channel_id, user_id)
        );

        -- AUTOINCREMENT keeps message ids monotonic; the id is the ordering
        -- key for anchored windows and read-marker ranges.
        CREATE TABLE IF NOT EXISTS messages (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id       INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            sender_id        INTEGER NOT NULL,
            content          TEXT NOT NULL,
            rendered_content TEXT NOT NULL,
            sent_at          TEXT NOT NULL
        );

        -- Used when windowing and when flipping read flags over an id range
        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, id);

        CREATE TABLE IF NOT EXISTS read_markers (
            user_id     INTEGER NOT NULL,
            message_id  INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
            is_read     INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, message_id)
        );

        CREATE INDEX IF NOT EXISTS idx_read_markers_unread
            ON read_markers(user_id, is_read, message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
