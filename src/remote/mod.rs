//! Boundary to the hosted document store.
//!
//! Documents arrive loosely typed: fields the server has not resolved yet
//! (pending server timestamps, receipts nobody wrote) are simply absent. The
//! `normalize_*` functions turn them into cache models.

pub mod memory;

use std::cmp::Reverse;
use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::core::error::RemoteError;
use crate::core::models::{
    Conversation, ConversationKind, Message, MessageKind, MessageStatus, OutgoingContent,
};

/// A stream of full snapshots for one live query.
pub type Snapshots<T> = BoxStream<'static, Result<Vec<T>, RemoteError>>;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageDoc {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub kind: Option<MessageKind>,
    pub content: Option<String>,
    pub image_url: Option<String>,
    pub timestamp: Option<i64>,
    pub status: Option<MessageStatus>,
    pub delivered_to: Option<Vec<String>>,
    pub read_by: Option<Vec<String>>,
    pub local_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationDoc {
    pub id: String,
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: Option<String>,
    pub participants: Vec<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_timestamp: Option<i64>,
    #[serde(default)]
    pub group_picture_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
    pub created_by: String,
}

/// A locally originated message on its way to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub local_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: OutgoingContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub participants: BTreeSet<String>,
    pub created_by: String,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Live query over the conversations `user_id` participates in.
    fn watch_conversations(&self, user_id: &str) -> Snapshots<ConversationDoc>;

    /// Live query over one conversation's messages.
    fn watch_messages(&self, conversation_id: &str) -> Snapshots<MessageDoc>;

    /// Create the message document. Returns the server-assigned id.
    async fn send_message(&self, message: &NewMessage) -> Result<String, RemoteError>;

    async fn create_conversation(
        &self,
        conversation: &NewConversation,
    ) -> Result<String, RemoteError>;

    /// Add `user_id` to the delivery set of every listed message.
    async fn mark_delivered(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        user_id: &str,
    ) -> Result<(), RemoteError>;

    /// Add `user_id` to the read set of every listed message, in one batch.
    async fn mark_read(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        user_id: &str,
    ) -> Result<(), RemoteError>;
}

pub fn normalize_message(doc: MessageDoc, now: i64) -> Message {
    Message {
        kind: doc.kind.unwrap_or(MessageKind::Text),
        content: doc.content.unwrap_or_default(),
        timestamp: doc.timestamp.unwrap_or(now),
        status: doc.status.unwrap_or(MessageStatus::Sent),
        delivered_to: doc.delivered_to.unwrap_or_default().into_iter().collect(),
        read_by: doc.read_by.unwrap_or_default().into_iter().collect(),
        id: doc.id,
        conversation_id: doc.conversation_id,
        sender_id: doc.sender_id,
        image_url: doc.image_url,
        local_id: doc.local_id,
    }
}

/// Normalize a message snapshot, oldest first. Ties keep id order.
pub fn normalize_messages(docs: Vec<MessageDoc>, now: i64) -> Vec<Message> {
    let mut messages: Vec<Message> = docs
        .into_iter()
        .map(|doc| normalize_message(doc, now))
        .collect();
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    messages
}

pub fn normalize_conversation(doc: ConversationDoc, now: i64) -> Conversation {
    Conversation {
        id: doc.id,
        kind: doc.kind,
        name: doc.name,
        participants: doc.participants.into_iter().collect(),
        last_message: doc.last_message,
        last_message_timestamp: doc.last_message_timestamp,
        group_picture_url: doc.group_picture_url,
        created_at: doc.created_at.unwrap_or(now),
        created_by: doc.created_by,
    }
}

/// Normalize a conversation snapshot, newest activity first. Conversations
/// without any message go last.
pub fn normalize_conversations(docs: Vec<ConversationDoc>, now: i64) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = docs
        .into_iter()
        .map(|doc| normalize_conversation(doc, now))
        .collect();
    conversations.sort_by_key(|c| {
        (
            c.last_message_timestamp.is_none(),
            Reverse(c.last_message_timestamp),
            Reverse(c.created_at),
        )
    });
    conversations
}
