use chrono::{DateTime, Utc};
use rusqlite::Row;
use tracing::warn;

use parley_types::models::{Channel, Message};

/// Map a `SELECT id, channel_id, sender_id, content, rendered_content, sent_at`
/// row into a domain message.
pub fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let sent_at_raw: String = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        sender_id: row.get(2)?,
        content: row.get(3)?,
        rendered_content: row.get(4)?,
        sent_at: parse_timestamp(&sent_at_raw),
    })
}

/// Map a `SELECT id, name, creator_id, created_at` row into a channel.
pub fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let created_at_raw: String = row.get(3)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        creator_id: row.get(2)?,
        created_at: parse_timestamp(&created_at_raw),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        warn!("Corrupt timestamp '{}': {}", raw, e);
        DateTime::default()
    })
}
