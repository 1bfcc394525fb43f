use std::fmt;

use serde::{Deserialize, Serialize};

use crate::timestamps::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sender {
    Owner,
    Other,
}

impl Sender {
    /// `was_me` is 1 for the account holder and 0 for everyone else; nothing else is valid.
    pub fn from_flag(flag: i64) -> Option<Sender> {
        match flag {
            1 => Some(Sender::Owner),
            0 => Some(Sender::Other),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::Owner => "OWNER",
            Sender::Other => "OTHER",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Private,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Private => "PRIVATE",
            ConversationKind::Group => "GROUP",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub partner_jid: Option<String>,
    pub body: String,
    pub timestamp: Timestamp,
    pub conversation_kind: ConversationKind,
    pub participants: Vec<String>,
    pub content_id: Option<String>,
    /// Join/leave and other system text; many status rows have no body.
    pub status_message: Option<String>,
    pub status_user_jid: Option<String>,
    pub friend_attr_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: String,
    pub member_jid: String,
}

/// What the export knows about a content item's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "file_name", rename_all = "snake_case")]
pub enum ImageRef {
    NoImageData,
    File(String),
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::NoImageData => f.write_str("no image data"),
            ImageRef::File(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub timestamp: Timestamp,
    pub content_id: String,
    pub content_names: Vec<String>,
    pub content_uri: Option<String>,
    /// Key into the image table: the `preview` attribute when present, else the content id.
    pub image_id: String,
    pub image: ImageRef,
    pub retain_count: Option<i64>,
}
