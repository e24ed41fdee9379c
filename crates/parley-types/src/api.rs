use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::Message;

// -- Anchors --

/// Reference point around which a page of messages is windowed. Symbolic
/// anchors are resolved against the caller's read markers; a numeric anchor
/// is taken verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Newest,
    Oldest,
    FirstUnread,
    Id(i64),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid anchor: {0:?}")]
pub struct InvalidAnchor(pub String);

impl FromStr for Anchor {
    type Err = InvalidAnchor;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            "first_unread" => Ok(Self::FirstUnread),
            other => other
                .parse::<i64>()
                .map(Self::Id)
                .map_err(|_| InvalidAnchor(other.to_string())),
        }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Newest => f.write_str("newest"),
            Self::Oldest => f.write_str("oldest"),
            Self::FirstUnread => f.write_str("first_unread"),
            Self::Id(id) => write!(f, "{id}"),
        }
    }
}

impl<'de> Deserialize<'de> for Anchor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for Anchor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub channel_id: i64,
    pub content: String,
}

fn default_anchor() -> Anchor {
    Anchor::FirstUnread
}

fn default_window_count() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub channel_id: i64,
    #[serde(default = "default_anchor")]
    pub anchor: Anchor,
    #[serde(default = "default_window_count")]
    pub num_before: u32,
    #[serde(default = "default_window_count")]
    pub num_after: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateFlagsRequest {
    pub channel_id: i64,
    pub anchor: Anchor,
    #[serde(default = "default_window_count")]
    pub num_before: u32,
    #[serde(default = "default_window_count")]
    pub num_after: u32,
}

/// Ids whose read flag actually flipped. A repeated identical request
/// returns an empty list.
#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateFlagsResponse {
    pub messages: Vec<i64>,
}

// -- Channels --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
}

/// One entry of the caller's subscription list, with enough state to render
/// a conversation list without further round-trips.
#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelOverview {
    pub channel_id: i64,
    pub name: String,
    pub creator_id: i64,
    pub subscribers: Vec<i64>,
    pub unread_count: i64,
    pub last_message: Option<Message>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationRequest {
    pub lat: f64,
    pub lng: f64,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_parses_symbolic_and_numeric() {
        assert_eq!("newest".parse::<Anchor>().unwrap(), Anchor::Newest);
        assert_eq!("oldest".parse::<Anchor>().unwrap(), Anchor::Oldest);
        assert_eq!(
            "first_unread".parse::<Anchor>().unwrap(),
            Anchor::FirstUnread
        );
        assert_eq!("42".parse::<Anchor>().unwrap(), Anchor::Id(42));
        assert!("latest".parse::<Anchor>().is_err());
    }

    #[test]
    fn messages_query_defaults() {
        let query: MessagesQuery = serde_json::from_str(r#"{"channel_id": 7}"#).unwrap();
        assert_eq!(query.anchor, Anchor::FirstUnread);
        assert_eq!(query.num_before, 100);
        assert_eq!(query.num_after, 100);
    }
}
