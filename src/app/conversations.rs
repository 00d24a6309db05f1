use std::collections::BTreeSet;
use std::sync::Arc;

use super::ChatSession;
use crate::core::error::SyncError;
use crate::core::models::{Conversation, ConversationKind};
use crate::remote::NewConversation;
use crate::sync::bridge::SubscriptionKey;

impl ChatSession {
    /// Serve the cached conversation list, then (re)attach the live listener
    /// that keeps it current.
    pub async fn load_conversations(&self) -> Result<Vec<Conversation>, SyncError> {
        let cached = self.cache.conversations_for_user(&self.user_id).await?;
        {
            let mut views = self.views.lock();
            views.conversations = cached.clone();
            views.conversations_error = None;
        }

        let on_change_views = Arc::clone(&self.views);
        let on_error_views = Arc::clone(&self.views);
        self.subscriptions
            .replace(SubscriptionKey::Conversations(self.user_id.clone()), || {
                self.bridge.subscribe_conversations(
                    &self.user_id,
                    move |conversations| {
                        let mut views = on_change_views.lock();
                        views.conversations = conversations;
                        views.conversations_error = None;
                    },
                    move |e| {
                        on_error_views.lock().conversations_error = Some(e.to_string());
                    },
                )
            });

        Ok(cached)
    }

    /// Create a conversation on the server. The listener picks it up; the
    /// new id is returned right away.
    pub async fn create_conversation(
        &self,
        participants: &[&str],
        kind: ConversationKind,
        name: Option<&str>,
    ) -> Result<String, SyncError> {
        if !self.monitor.is_online() {
            return Err(SyncError::Offline);
        }

        let mut members: BTreeSet<String> = participants.iter().map(|p| p.to_string()).collect();
        members.insert(self.user_id.clone());

        let id = self
            .remote
            .create_conversation(&NewConversation {
                kind,
                name: name.map(str::to_string),
                participants: members,
                created_by: self.user_id.clone(),
            })
            .await?;
        log::info!("Created {} conversation {}", kind, id);
        Ok(id)
    }
}
