use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted chat message. Ids are store-assigned and monotonic, so the id
/// doubles as the ordering key for windowed retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub channel_id: i64,
    pub sender_id: i64,
    pub content: String,
    /// HTML-escaped form of `content`, safe to render verbatim.
    pub rendered_content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub creator_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Per-(user, message) read state. One row is created for every subscriber
/// when a message is sent; the flag flips exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadMarker {
    pub user_id: i64,
    pub message_id: i64,
    pub is_read: bool,
}
