//! In-process document store with live queries.
//!
//! Mirrors the behaviour the engine relies on from the hosted backend:
//! server-assigned ids and timestamps, full-snapshot listeners, batched
//! array-union receipts. Failures can be injected for tests and demos.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use parking_lot::Mutex;

use super::{
    ConversationDoc, MessageDoc, NewConversation, NewMessage, RemoteStore, Snapshots,
};
use crate::core::error::RemoteError;
use crate::core::ids::now_millis;
use crate::core::models::MessageStatus;

type Listener<T> = UnboundedSender<Result<Vec<T>, RemoteError>>;

#[derive(Default)]
struct State {
    conversations: BTreeMap<String, ConversationDoc>,
    messages: BTreeMap<String, Vec<MessageDoc>>,
    conversation_listeners: Vec<(String, Listener<ConversationDoc>)>,
    message_listeners: Vec<(String, Listener<MessageDoc>)>,
    next_id: u64,
    clock: i64,

    offline: bool,
    permission_denied: bool,
    failing_sends: u32,

    send_attempts: u32,
    read_batches: Vec<Vec<String>>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Server timestamps never go backwards.
    fn tick(&mut self) -> i64 {
        self.clock = now_millis().max(self.clock + 1);
        self.clock
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Unavailable("backend unreachable".into()));
        }
        if self.permission_denied {
            return Err(RemoteError::PermissionDenied("missing or insufficient permissions".into()));
        }
        Ok(())
    }

    fn conversation_snapshot(&self, user_id: &str) -> Vec<ConversationDoc> {
        self.conversations
            .values()
            .filter(|c| c.participants.iter().any(|p| p == user_id))
            .cloned()
            .collect()
    }

    fn message_snapshot(&self, conversation_id: &str) -> Vec<MessageDoc> {
        self.messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    fn notify_messages(&mut self, conversation_id: &str) {
        let snapshot = self.message_snapshot(conversation_id);
        self.message_listeners.retain(|(key, tx)| {
            key != conversation_id || tx.unbounded_send(Ok(snapshot.clone())).is_ok()
        });
    }

    fn notify_conversations(&mut self, participants: &[String]) {
        let mut listeners = std::mem::take(&mut self.conversation_listeners);
        listeners.retain(|(user, tx)| {
            if !participants.contains(user) {
                return !tx.is_closed();
            }
            tx.unbounded_send(Ok(self.conversation_snapshot(user))).is_ok()
        });
        self.conversation_listeners = listeners;
    }
}

#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a conversation document.
    pub fn put_conversation(&self, doc: ConversationDoc) {
        let mut state = self.state.lock();
        let participants = doc.participants.clone();
        state.conversations.insert(doc.id.clone(), doc);
        state.notify_conversations(&participants);
    }

    /// Write a message document as-is, as another client would. Fields left
    /// out stay out of the snapshot.
    pub fn put_message(&self, doc: MessageDoc) {
        let mut state = self.state.lock();
        let conversation_id = doc.conversation_id.clone();
        let list = state.messages.entry(conversation_id.clone()).or_default();
        match list.iter_mut().find(|m| m.id == doc.id) {
            Some(existing) => *existing = doc,
            None => list.push(doc),
        }
        state.notify_messages(&conversation_id);
    }

    /// Push an error to every listener of the conversation's messages.
    pub fn fail_message_listeners(&self, conversation_id: &str, error: RemoteError) {
        let mut state = self.state.lock();
        state.message_listeners.retain(|(key, tx)| {
            key != conversation_id || tx.unbounded_send(Err(error.clone())).is_ok()
        });
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    pub fn set_permission_denied(&self, denied: bool) {
        self.state.lock().permission_denied = denied;
    }

    /// The next `n` sends fail with a transient error.
    pub fn fail_next_sends(&self, n: u32) {
        self.state.lock().failing_sends = n;
    }

    pub fn send_attempts(&self) -> u32 {
        self.state.lock().send_attempts
    }

    pub fn read_batches(&self) -> Vec<Vec<String>> {
        self.state.lock().read_batches.clone()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<MessageDoc> {
        self.state.lock().message_snapshot(conversation_id)
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationDoc> {
        self.state.lock().conversations.get(id).cloned()
    }

    /// Live message listeners for a conversation. Dropped streams are
    /// pruned first.
    pub fn message_listener_count(&self, conversation_id: &str) -> usize {
        let mut state = self.state.lock();
        state.message_listeners.retain(|(_, tx)| !tx.is_closed());
        state
            .message_listeners
            .iter()
            .filter(|(key, _)| key == conversation_id)
            .count()
    }

    pub fn conversation_listener_count(&self, user_id: &str) -> usize {
        let mut state = self.state.lock();
        state.conversation_listeners.retain(|(_, tx)| !tx.is_closed());
        state
            .conversation_listeners
            .iter()
            .filter(|(key, _)| key == user_id)
            .count()
    }

    fn add_receipts(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        user_id: &str,
        read: bool,
    ) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        state.check_reachable()?;

        let list = state
            .messages
            .get_mut(conversation_id)
            .ok_or_else(|| RemoteError::NotFound(conversation_id.to_string()))?;

        // A batch commits all updates or none
        if let Some(missing) = message_ids.iter().find(|id| !list.iter().any(|m| &m.id == *id)) {
            return Err(RemoteError::NotFound(missing.clone()));
        }
        for doc in list.iter_mut().filter(|m| message_ids.contains(&m.id)) {
            let set = if read {
                doc.read_by.get_or_insert_with(Vec::new)
            } else {
                doc.delivered_to.get_or_insert_with(Vec::new)
            };
            if !set.iter().any(|u| u == user_id) {
                set.push(user_id.to_string());
            }
        }

        if read {
            state.read_batches.push(message_ids.to_vec());
        }
        state.notify_messages(conversation_id);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    fn watch_conversations(&self, user_id: &str) -> Snapshots<ConversationDoc> {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock();
        let first = match state.check_reachable() {
            Err(e @ RemoteError::PermissionDenied(_)) => Err(e),
            _ => Ok(state.conversation_snapshot(user_id)),
        };
        if tx.unbounded_send(first).is_ok() {
            state.conversation_listeners.push((user_id.to_string(), tx));
        }
        rx.boxed()
    }

    fn watch_messages(&self, conversation_id: &str) -> Snapshots<MessageDoc> {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock();
        let first = match state.check_reachable() {
            Err(e @ RemoteError::PermissionDenied(_)) => Err(e),
            _ => Ok(state.message_snapshot(conversation_id)),
        };
        if tx.unbounded_send(first).is_ok() {
            state.message_listeners.push((conversation_id.to_string(), tx));
        }
        rx.boxed()
    }

    async fn send_message(&self, message: &NewMessage) -> Result<String, RemoteError> {
        let mut state = self.state.lock();
        state.send_attempts += 1;
        state.check_reachable()?;
        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return Err(RemoteError::Unavailable("injected send failure".into()));
        }

        let id = state.next_id("msg");
        let timestamp = state.tick();
        let doc = MessageDoc {
            id: id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            kind: Some(message.content.kind()),
            content: Some(message.content.text().to_string()),
            image_url: message.content.image_url().map(str::to_string),
            timestamp: Some(timestamp),
            status: Some(MessageStatus::Sent),
            delivered_to: Some(Vec::new()),
            read_by: Some(Vec::new()),
            local_id: Some(message.local_id.clone()),
        };
        state
            .messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(doc);

        let participants = match state.conversations.get_mut(&message.conversation_id) {
            Some(conv) => {
                conv.last_message = Some(message.content.text().to_string());
                conv.last_message_timestamp = Some(timestamp);
                conv.participants.clone()
            }
            None => Vec::new(),
        };

        state.notify_messages(&message.conversation_id);
        state.notify_conversations(&participants);
        Ok(id)
    }

    async fn create_conversation(
        &self,
        conversation: &NewConversation,
    ) -> Result<String, RemoteError> {
        let mut state = self.state.lock();
        state.check_reachable()?;
        if conversation.participants.is_empty() {
            return Err(RemoteError::Rejected("conversation needs participants".into()));
        }

        let id = state.next_id("conv");
        let created_at = state.tick();
        let participants: Vec<String> = conversation.participants.iter().cloned().collect();
        state.conversations.insert(
            id.clone(),
            ConversationDoc {
                id: id.clone(),
                kind: conversation.kind,
                name: conversation.name.clone(),
                participants: participants.clone(),
                last_message: None,
                last_message_timestamp: None,
                group_picture_url: None,
                created_at: Some(created_at),
                created_by: conversation.created_by.clone(),
            },
        );
        state.notify_conversations(&participants);
        Ok(id)
    }

    async fn mark_delivered(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        user_id: &str,
    ) -> Result<(), RemoteError> {
        self.add_receipts(conversation_id, message_ids, user_id, false)
    }

    async fn mark_read(
        &self,
        conversation_id: &str,
        message_ids: &[String],
        user_id: &str,
    ) -> Result<(), RemoteError> {
        self.add_receipts(conversation_id, message_ids, user_id, true)
    }
}
