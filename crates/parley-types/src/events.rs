use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::models::Message;

/// Maximum length, in characters, of the human-readable preview attached to
/// push notifications.
const PREVIEW_MAX_CHARS: usize = 80;

/// Event categories carried over the live channel. The wire tag is the
/// lowercase name (`stream`, `user`, `location`, `read`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A chat message posted to a channel.
    Stream,
    /// A user-level notification (profile/account changes).
    User,
    /// A transient location update, delivered live-only.
    Location,
    /// A read receipt, delivered live-only.
    Read,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::User => "user",
            Self::Location => "location",
            Self::Read => "read",
        }
    }
}

/// An event as appended to a recipient's queue: a kind tag plus an opaque
/// payload. The queue assigns the resumption id; it is not part of the
/// envelope itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: Value,
}

impl EventEnvelope {
    /// Envelope for a freshly sent chat message.
    pub fn stream_message(channel_id: i64, message: &Message) -> Self {
        Self {
            kind: EventKind::Stream,
            data: json!({
                "id": message.id,
                "channel_id": channel_id,
                "sender_id": message.sender_id,
                "content": message.content,
                "rendered_content": message.rendered_content,
                "sent_at": message.sent_at.timestamp(),
                "is_read": false,
            }),
        }
    }

    /// Envelope announcing that `user_id` has read `message_ids` in a channel.
    pub fn read_receipt(channel_id: i64, user_id: i64, message_ids: &[i64]) -> Self {
        Self {
            kind: EventKind::Read,
            data: json!({
                "channel_id": channel_id,
                "user_id": user_id,
                "message_ids": message_ids,
            }),
        }
    }

    /// Envelope for a live location update within a channel.
    pub fn location(channel_id: i64, user_id: i64, lat: f64, lng: f64) -> Self {
        Self {
            kind: EventKind::Location,
            data: json!({
                "channel_id": channel_id,
                "user_id": user_id,
                "lat": lat,
                "lng": lng,
            }),
        }
    }

    /// Short human-readable preview used as a push-notification body.
    pub fn preview(&self) -> String {
        let text = match self.kind {
            EventKind::Stream => self.data.get("content").and_then(Value::as_str),
            _ => None,
        };
        let text = text.unwrap_or("New message");
        if text.chars().count() <= PREVIEW_MAX_CHARS {
            text.to_string()
        } else {
            let mut preview: String = text.chars().take(PREVIEW_MAX_CHARS).collect();
            preview.push('…');
            preview
        }
    }
}

/// The frame written to a live client: the envelope plus the queue id the
/// client should present as its cursor when resuming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(flatten)]
    pub envelope: EventEnvelope,
    pub last_event_id: String,
}

impl WireEvent {
    pub fn new(envelope: EventEnvelope, last_event_id: String) -> Self {
        Self { envelope, last_event_id }
    }
}

/// Payload handed to the push-notification collaborator when a recipient has
/// no live view of the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMessage {
    pub user_id: i64,
    pub title: String,
    pub body: String,
    pub event: EventEnvelope,
}

impl PushMessage {
    pub fn new(user_id: i64, envelope: EventEnvelope) -> Self {
        Self {
            user_id,
            title: "New message".to_string(),
            body: envelope.preview(),
            event: envelope,
        }
    }
}
