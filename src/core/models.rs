use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::CacheError;

/// A cached user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub profile_picture_url: Option<String>,
    pub is_online: bool,
    pub last_seen: i64,
    pub push_token: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// A conversation row. Written wholesale on every sync, never field-merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub participants: BTreeSet<String>,
    /// Denormalized copy of the latest message; may lag until the next sync.
    pub last_message: Option<String>,
    pub last_message_timestamp: Option<i64>,
    pub group_picture_url: Option<String>,
    pub created_at: i64,
    pub created_by: String,
}

impl Conversation {
    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.contains(user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
}

/// Delivery state of a message as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// `sending` and `failed` messages exist only locally until the server
    /// echoes them back.
    pub fn is_unconfirmed(self) -> bool {
        matches!(self, MessageStatus::Sending | MessageStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Server id once confirmed; the local id while still optimistic.
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    /// Text body, or the caption of an image.
    pub content: String,
    pub image_url: Option<String>,
    pub timestamp: i64,
    pub status: MessageStatus,
    pub delivered_to: BTreeSet<String>,
    pub read_by: BTreeSet<String>,
    pub local_id: Option<String>,
}

impl Message {
    /// Build the optimistic row for a locally originated message.
    pub fn optimistic(
        local_id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &OutgoingContent,
        timestamp: i64,
    ) -> Self {
        Message {
            id: local_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            kind: content.kind(),
            content: content.text().to_string(),
            image_url: content.image_url().map(str::to_string),
            timestamp,
            status: MessageStatus::Sending,
            delivered_to: BTreeSet::new(),
            read_by: BTreeSet::new(),
            local_id: Some(local_id.to_string()),
        }
    }

    /// A message the server has not confirmed yet.
    pub fn is_local_only(&self) -> bool {
        self.status.is_unconfirmed() && self.local_id.as_deref() == Some(self.id.as_str())
    }
}

/// Payload of a locally originated write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingContent {
    Text(String),
    Image {
        image_url: String,
        caption: String,
    },
}

impl OutgoingContent {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutgoingContent::Text(_) => MessageKind::Text,
            OutgoingContent::Image { .. } => MessageKind::Image,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            OutgoingContent::Text(text) => text,
            OutgoingContent::Image { caption, .. } => caption,
        }
    }

    pub fn image_url(&self) -> Option<&str> {
        match self {
            OutgoingContent::Text(_) => None,
            OutgoingContent::Image { image_url, .. } => Some(image_url),
        }
    }

    /// Rebuild the payload from a stored kind/content/image triple.
    pub fn from_parts(
        kind: MessageKind,
        content: String,
        image_url: Option<String>,
    ) -> Result<Self, CacheError> {
        match (kind, image_url) {
            (MessageKind::Text, _) => Ok(OutgoingContent::Text(content)),
            (MessageKind::Image, Some(image_url)) => Ok(OutgoingContent::Image {
                image_url,
                caption: content,
            }),
            (MessageKind::Image, None) => Err(CacheError::Decode(
                "image write without an image reference".into(),
            )),
        }
    }
}

/// A durable outbox entry for a write that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub local_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: OutgoingContent,
    pub created_at: i64,
    pub retry_count: u32,
    pub last_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    /// Parked entries are skipped by drains until a manual retry.
    pub parked: bool,
}

impl PendingWrite {
    pub fn new(
        local_id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: OutgoingContent,
        created_at: i64,
    ) -> Self {
        PendingWrite {
            local_id: local_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content,
            created_at,
            retry_count: 0,
            last_attempt_at: None,
            last_error: None,
            parked: false,
        }
    }
}

/// Device connectivity as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    /// `None` when the platform has not determined internet reachability.
    pub reachable: Option<bool>,
}

impl NetworkStatus {
    pub const fn online() -> Self {
        NetworkStatus {
            connected: true,
            reachable: Some(true),
        }
    }

    pub const fn offline() -> Self {
        NetworkStatus {
            connected: false,
            reachable: Some(false),
        }
    }

    /// Unknown reachability counts as online; a wasted attempt only costs a
    /// retry.
    pub fn is_online(&self) -> bool {
        self.connected && self.reachable != Some(false)
    }
}

// ---------------------------------------------------------------------------
// Column encodings
// ---------------------------------------------------------------------------

macro_rules! column_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = CacheError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(CacheError::Decode(format!(
                        "invalid {} value: {other:?}",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

column_enum!(ConversationKind { Direct => "direct", Group => "group" });
column_enum!(MessageKind { Text => "text", Image => "image" });
column_enum!(MessageStatus {
    Sending => "sending",
    Sent => "sent",
    Delivered => "delivered",
    Read => "read",
    Failed => "failed",
});
