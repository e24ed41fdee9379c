use chrono::Utc;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension};

use parley_types::api::{Anchor, ChannelOverview};
use parley_types::models::{Channel, Message};

use crate::models::{channel_from_row, message_from_row};
use crate::{Database, Result, StoreError};

const MESSAGE_COLS: &str = "id, channel_id, sender_id, content, rendered_content, sent_at";

impl Database {
    // -- Channels & subscriber set --

    pub fn create_channel(&self, name: &str, creator_id: i64) -> Result<Channel> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (name, creator_id) VALUES (?1, ?2)",
                (name, creator_id),
            )?;
            let id = conn.last_insert_rowid();
            let channel = conn.query_row(
                "SELECT id, name, creator_id, created_at FROM channels WHERE id = ?1",
                [id],
                channel_from_row,
            )?;
            Ok(channel)
        })
    }

    pub fn get_channel(&self, channel_id: i64) -> Result<Option<Channel>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, creator_id, created_at FROM channels WHERE id = ?1",
                    [channel_id],
                    channel_from_row,
                )
                .optional()?)
        })
    }

    pub fn subscribe(&self, channel_id: i64, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            if !channel_exists(conn, channel_id)? {
                return Err(StoreError::ChannelNotFound(channel_id));
            }
            if query_is_subscriber(conn, channel_id, user_id)? {
                return Err(StoreError::AlreadySubscribed { user_id, channel_id });
            }
            conn.execute(
                "INSERT INTO subscriptions (channel_id, user_id) VALUES (?1, ?2)",
                (channel_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn unsubscribe(&self, channel_id: i64, user_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM subscriptions WHERE channel_id = ?1 AND user_id = ?2",
                (channel_id, user_id),
            )?;
            if removed == 0 {
                return Err(StoreError::NotSubscribed { user_id, channel_id });
            }
            Ok(())
        })
    }

    /// The set of user ids entitled to receive the channel's events. Consulted
    /// both for fan-out and for authorization checks.
    pub fn subscribers(&self, channel_id: i64) -> Result<Vec<i64>> {
        self.with_conn(|conn| query_subscribers(conn, channel_id))
    }

    pub fn is_subscriber(&self, channel_id: i64, user_id: i64) -> Result<bool> {
        self.with_conn(|conn| query_is_subscriber(conn, channel_id, user_id))
    }

    /// The caller's subscriptions with subscriber lists, unread counts and the
    /// most recent message they can see.
    pub fn subscription_overview(&self, user_id: i64) -> Result<Vec<ChannelOverview>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.name, c.creator_id, c.created_at
                 FROM channels c
                 JOIN subscriptions s ON s.channel_id = c.id
                 WHERE s.user_id = ?1
                 ORDER BY c.id",
            )?;
            let channels = stmt
                .query_map([user_id], channel_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut overview = Vec::with_capacity(channels.len());
            for channel in channels {
                let subscribers = query_subscribers(conn, channel.id)?;
                let unread_count = query_unread_count(conn, user_id, channel.id)?;
                let last_message = match query_newest_marker(conn, user_id, channel.id)? {
                    Some(message_id) => query_message(conn, message_id)?,
                    None => None,
                };
                overview.push(ChannelOverview {
                    channel_id: channel.id,
                    name: channel.name,
                    creator_id: channel.creator_id,
                    subscribers,
                    unread_count,
                    last_message,
                });
            }
            Ok(overview)
        })
    }

    // -- Messages --

    /// Persist a new message. The id comes back monotonic; rendering happens
    /// here so every reader sees the same render-safe form.
    pub fn append_message(&self, channel_id: i64, sender_id: i64, content: &str) -> Result<Message> {
        self.with_conn(|conn| {
            if !channel_exists(conn, channel_id)? {
                return Err(StoreError::ChannelNotFound(channel_id));
            }

            let rendered = render_content(content);
            let sent_at = Utc::now();
            conn.execute(
                "INSERT INTO messages (channel_id, sender_id, content, rendered_content, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![channel_id, sender_id, content, rendered, sent_at.to_rfc3339()],
            )?;

            Ok(Message {
                id: conn.last_insert_rowid(),
                channel_id,
                sender_id,
                content: content.to_string(),
                rendered_content: rendered,
                sent_at,
            })
        })
    }

    pub fn get_message(&self, message_id: i64) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, message_id))
    }

    /// Resolve a symbolic anchor against the user's read markers. Numeric
    /// anchors pass through verbatim — an absent id later yields an empty
    /// window rather than an error.
    pub fn resolve_anchor(&self, channel_id: i64, user_id: i64, anchor: Anchor) -> Result<i64> {
        self.with_conn(|conn| match anchor {
            Anchor::Id(id) => Ok(id),
            Anchor::Newest => query_newest_marker(conn, user_id, channel_id)?
                .ok_or(StoreError::NoAnchor(channel_id)),
            Anchor::Oldest => query_oldest_marker(conn, user_id, channel_id)?
                .ok_or(StoreError::NoAnchor(channel_id)),
            Anchor::FirstUnread => {
                if let Some(id) = query_first_unread_marker(conn, user_id, channel_id)? {
                    return Ok(id);
                }
                query_newest_marker(conn, user_id, channel_id)?
                    .ok_or(StoreError::NoAnchor(channel_id))
            }
        })
    }

    /// Raw window around an anchor: up to `num_before` ids below it, the
    /// anchor itself, up to `num_after` above it, ascending. Empty when the
    /// anchor message is not in the channel.
    pub fn window(
        &self,
        channel_id: i64,
        anchor_id: i64,
        num_before: u32,
        num_after: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_window(conn, channel_id, anchor_id, num_before, num_after))
    }

    /// Window clipped to the join fence: messages older than the user's
    /// oldest marker in the channel were sent before they joined and stay
    /// invisible. The fence is re-derived on every call.
    pub fn visible_window(
        &self,
        channel_id: i64,
        user_id: i64,
        anchor_id: i64,
        num_before: u32,
        num_after: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let Some(fence) = query_oldest_marker(conn, user_id, channel_id)? else {
                return Ok(vec![]);
            };
            let mut messages = query_window(conn, channel_id, anchor_id, num_before, num_after)?;
            messages.retain(|m| m.id >= fence);
            Ok(messages)
        })
    }

    // -- Read state --

    /// Create unread markers for a freshly sent message, one per subscriber.
    /// The sender's own marker starts read.
    pub fn mark_subscribed(&self, message_id: i64, user_ids: &[i64], sender_id: i64) -> Result<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let rows: Vec<String> = (0..user_ids.len())
                .map(|i| format!("(?{}, ?{}, ?{})", i * 3 + 1, i * 3 + 2, i * 3 + 3))
                .collect();
            let sql = format!(
                "INSERT OR IGNORE INTO read_markers (user_id, message_id, is_read) VALUES {}",
                rows.join(", ")
            );

            let mut owned: Vec<Box<dyn ToSql>> = Vec::with_capacity(user_ids.len() * 3);
            for &user_id in user_ids {
                owned.push(Box::new(user_id));
                owned.push(Box::new(message_id));
                owned.push(Box::new(user_id == sender_id));
            }
            let params: Vec<&dyn ToSql> = owned.iter().map(|b| b.as_ref()).collect();
            conn.execute(&sql, params.as_slice())?;
            Ok(())
        })
    }

    /// Flip the user's unread markers inside the anchor window to read and
    /// return the ids that actually flipped. Re-marking an already-read range
    /// is a no-op that returns an empty list.
    pub fn mark_read(
        &self,
        user_id: i64,
        channel_id: i64,
        anchor_id: i64,
        num_before: u32,
        num_after: u32,
    ) -> Result<Vec<i64>> {
        self.with_conn(|conn| {
            let mut ids = query_ids_before(conn, channel_id, anchor_id, num_before)?;
            ids.push(anchor_id);
            ids.extend(query_ids_after(conn, channel_id, anchor_id, num_after)?);

            let placeholders: Vec<String> =
                (2..=ids.len() + 1).map(|i| format!("?{i}")).collect();
            let in_list = placeholders.join(", ");

            let mut params: Vec<&dyn ToSql> = Vec::with_capacity(ids.len() + 1);
            params.push(&user_id);
            params.extend(ids.iter().map(|id| id as &dyn ToSql));

            let select_sql = format!(
                "SELECT message_id FROM read_markers
                 WHERE user_id = ?1 AND is_read = 0 AND message_id IN ({in_list})"
            );
            let mut stmt = conn.prepare(&select_sql)?;
            let mut flipped = stmt
                .query_map(params.as_slice(), |row| row.get::<_, i64>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if !flipped.is_empty() {
                let update_sql = format!(
                    "UPDATE read_markers SET is_read = 1
                     WHERE user_id = ?1 AND message_id IN ({in_list})"
                );
                conn.execute(&update_sql, params.as_slice())?;
            }

            flipped.sort_unstable();
            Ok(flipped)
        })
    }

    pub fn unread_count(&self, user_id: i64, channel_id: i64) -> Result<i64> {
        self.with_conn(|conn| query_unread_count(conn, user_id, channel_id))
    }
}

// -- Free query helpers --

fn channel_exists(conn: &Connection, channel_id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM channels WHERE id = ?1", [channel_id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(found.is_some())
}

fn query_subscribers(conn: &Connection, channel_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM subscriptions WHERE channel_id = ?1 ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map([channel_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_is_subscriber(conn: &Connection, channel_id: i64, user_id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM subscriptions WHERE channel_id = ?1 AND user_id = ?2",
            (channel_id, user_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn query_message(conn: &Connection, message_id: i64) -> Result<Option<Message>> {
    let sql = format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1");
    Ok(conn
        .query_row(&sql, [message_id], message_from_row)
        .optional()?)
}

fn query_newest_marker(conn: &Connection, user_id: i64, channel_id: i64) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT rm.message_id FROM read_markers rm
             JOIN messages m ON m.id = rm.message_id
             WHERE rm.user_id = ?1 AND m.channel_id = ?2
             ORDER BY rm.message_id DESC
             LIMIT 1",
            (user_id, channel_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn query_oldest_marker(conn: &Connection, user_id: i64, channel_id: i64) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT rm.message_id FROM read_markers rm
             JOIN messages m ON m.id = rm.message_id
             WHERE rm.user_id = ?1 AND m.channel_id = ?2
             ORDER BY rm.message_id ASC
             LIMIT 1",
            (user_id, channel_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn query_first_unread_marker(
    conn: &Connection,
    user_id: i64,
    channel_id: i64,
) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT rm.message_id FROM read_markers rm
             JOIN messages m ON m.id = rm.message_id
             WHERE rm.user_id = ?1 AND rm.is_read = 0 AND m.channel_id = ?2
             ORDER BY rm.message_id ASC
             LIMIT 1",
            (user_id, channel_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn query_unread_count(conn: &Connection, user_id: i64, channel_id: i64) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM read_markers rm
         JOIN messages m ON m.id = rm.message_id
         WHERE rm.user_id = ?1 AND rm.is_read = 0 AND m.channel_id = ?2",
        (user_id, channel_id),
        |row| row.get(0),
    )?;
    Ok(count)
}

fn query_window(
    conn: &Connection,
    channel_id: i64,
    anchor_id: i64,
    num_before: u32,
    num_after: u32,
) -> Result<Vec<Message>> {
    let anchor_sql = format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1 AND channel_id = ?2");
    let anchor: Option<Message> = conn
        .query_row(&anchor_sql, (anchor_id, channel_id), message_from_row)
        .optional()?;
    let Some(anchor) = anchor else {
        return Ok(vec![]);
    };

    let before_sql = format!(
        "SELECT {MESSAGE_COLS} FROM messages
         WHERE channel_id = ?1 AND id < ?2
         ORDER BY id DESC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&before_sql)?;
    let mut before = stmt
        .query_map(
            rusqlite::params![channel_id, anchor_id, num_before],
            message_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    before.reverse();

    let after_sql = format!(
        "SELECT {MESSAGE_COLS} FROM messages
         WHERE channel_id = ?1 AND id > ?2
         ORDER BY id ASC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare(&after_sql)?;
    let after = stmt
        .query_map(
            rusqlite::params![channel_id, anchor_id, num_after],
            message_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut messages = before;
    messages.push(anchor);
    messages.extend(after);
    Ok(messages)
}

fn query_ids_before(
    conn: &Connection,
    channel_id: i64,
    anchor_id: i64,
    limit: u32,
) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM messages
         WHERE channel_id = ?1 AND id < ?2
         ORDER BY id DESC
         LIMIT ?3",
    )?;
    let ids = stmt
        .query_map(rusqlite::params![channel_id, anchor_id, limit], |row| {
            row.get(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn query_ids_after(
    conn: &Connection,
    channel_id: i64,
    anchor_id: i64,
    limit: u32,
) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM messages
         WHERE channel_id = ?1 AND id > ?2
         ORDER BY id ASC
         LIMIT ?3",
    )?;
    let ids = stmt
        .query_map(rusqlite::params![channel_id, anchor_id, limit], |row| {
            row.get(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// HTML-escape message content once at write time so every reader gets the
/// same render-safe form.
fn render_content(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}
