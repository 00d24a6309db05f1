use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatSession, SendOutcome};
use crate::core::error::{RemoteError, SyncError};
use crate::core::ids::now_millis;
use crate::core::models::{Message, MessageStatus, OutgoingContent, PendingWrite};
use crate::remote::{NewMessage, RemoteStore};
use crate::sync::bridge::SubscriptionKey;
use crate::sync::receipts::{ReadReceiptBatcher, ReceiptSink};

/// Sends one conversation's read receipts for one reader.
struct ConversationReceipts {
    remote: Arc<dyn RemoteStore>,
    conversation_id: String,
    reader_id: String,
}

#[async_trait]
impl ReceiptSink for ConversationReceipts {
    async fn mark_read(&self, message_ids: Vec<String>) -> Result<(), RemoteError> {
        self.remote
            .mark_read(&self.conversation_id, &message_ids, &self.reader_id)
            .await
    }
}

impl ChatSession {
    /// Serve the cached messages, then replace the conversation's live
    /// listener. Calling this again for the same conversation never leaves
    /// two listeners behind.
    pub async fn load_messages(&self, conversation_id: &str) -> Result<Vec<Message>, SyncError> {
        let cached = self.cache.messages_for_conversation(conversation_id).await?;
        {
            let mut views = self.views.lock();
            let view = views.open.entry(conversation_id.to_string()).or_default();
            view.messages = cached.clone();
            view.error = None;
        }

        let on_change_views = Arc::clone(&self.views);
        let on_error_views = Arc::clone(&self.views);
        let change_id = conversation_id.to_string();
        let error_id = conversation_id.to_string();
        self.subscriptions
            .replace(SubscriptionKey::Messages(conversation_id.to_string()), || {
                self.bridge.subscribe_messages(
                    conversation_id,
                    move |messages| {
                        let mut views = on_change_views.lock();
                        // Closed in the meantime
                        if let Some(view) = views.open.get_mut(&change_id) {
                            view.messages = messages;
                            view.error = None;
                            view.revision += 1;
                        }
                    },
                    move |e| {
                        if let Some(view) = on_error_views.lock().open.get_mut(&error_id) {
                            view.error = Some(e.to_string());
                        }
                    },
                )
            });

        Ok(cached)
    }

    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<SendOutcome, SyncError> {
        self.send_content(conversation_id, OutgoingContent::Text(text.to_string()))
            .await
    }

    /// `image_url` is a reference to an already uploaded image.
    pub async fn send_image(
        &self,
        conversation_id: &str,
        image_url: &str,
        caption: Option<&str>,
    ) -> Result<SendOutcome, SyncError> {
        self.send_content(
            conversation_id,
            OutgoingContent::Image {
                image_url: image_url.to_string(),
                caption: caption.unwrap_or_default().to_string(),
            },
        )
        .await
    }

    async fn send_content(
        &self,
        conversation_id: &str,
        content: OutgoingContent,
    ) -> Result<SendOutcome, SyncError> {
        let local_id = self.ids.next_id();
        let message = Message::optimistic(
            &local_id,
            conversation_id,
            &self.user_id,
            &content,
            now_millis(),
        );

        if !self.monitor.is_online() {
            let entry = PendingWrite::new(
                &local_id,
                conversation_id,
                &self.user_id,
                content,
                message.timestamp,
            );
            self.cache.stage_outgoing(message.clone(), Some(entry)).await?;
            self.show_local(message);
            log::debug!("Offline, queued {}", local_id);
            return Ok(SendOutcome::Queued { local_id });
        }

        self.cache.stage_outgoing(message.clone(), None).await?;
        self.show_local(message);

        let outgoing = NewMessage {
            local_id: local_id.clone(),
            conversation_id: conversation_id.to_string(),
            sender_id: self.user_id.clone(),
            content,
        };
        match self.remote.send_message(&outgoing).await {
            Ok(server_id) => Ok(SendOutcome::Sent {
                local_id,
                server_id,
            }),
            Err(e) if e.is_transient() => {
                log::warn!("Send failed, queueing {}: {}", local_id, e);
                self.outbox
                    .enqueue(&local_id, conversation_id, &self.user_id, outgoing.content)
                    .await?;
                Ok(SendOutcome::Queued { local_id })
            }
            Err(e) => {
                log::error!("Send of {} rejected: {}", local_id, e);
                self.cache
                    .set_local_status(&local_id, MessageStatus::Failed)
                    .await?;
                self.show_status(conversation_id, &local_id, MessageStatus::Failed);
                Err(e.into())
            }
        }
    }

    /// Manually retry a message that has not been confirmed, typically one
    /// marked `failed`.
    pub async fn retry_message(&self, local_id: &str) -> Result<(), SyncError> {
        let message = self
            .cache
            .get_message_by_local_id(local_id)
            .await?
            .filter(Message::is_local_only)
            .ok_or_else(|| SyncError::UnknownMessage(local_id.to_string()))?;

        let content = OutgoingContent::from_parts(
            message.kind,
            message.content.clone(),
            message.image_url.clone(),
        )?;
        self.outbox
            .requeue(local_id, &message.conversation_id, &message.sender_id, content)
            .await?;
        self.show_status(&message.conversation_id, local_id, MessageStatus::Sending);
        log::info!("Retrying {}", local_id);

        self.outbox.drain().await?;
        Ok(())
    }

    /// Queue a read receipt. Receipts for one conversation go out together
    /// once reading pauses.
    pub fn mark_read(&self, conversation_id: &str, message_id: &str) {
        let mut receipts = self.receipts.lock();
        let batcher = receipts
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                ReadReceiptBatcher::new(
                    Arc::new(ConversationReceipts {
                        remote: self.remote.clone(),
                        conversation_id: conversation_id.to_string(),
                        reader_id: self.user_id.clone(),
                    }),
                    self.config.read_receipt_window(),
                )
            });
        batcher.add(message_id);
    }

    /// Send any queued read receipts for the conversation now.
    pub async fn flush_read_receipts(&self, conversation_id: &str) -> Result<usize, SyncError> {
        // Take the batcher out so the lock is not held across the flush
        let batcher = self.receipts.lock().remove(conversation_id);
        let Some(batcher) = batcher else {
            return Ok(0);
        };
        let result = batcher.flush().await;
        self.receipts
            .lock()
            .entry(conversation_id.to_string())
            .or_insert(batcher);
        Ok(result?)
    }

    /// Tell the server this user received every message from others shown
    /// in the conversation. Returns how many were acknowledged.
    pub async fn acknowledge_delivery(&self, conversation_id: &str) -> Result<usize, SyncError> {
        let ids: Vec<String> = self
            .messages(conversation_id)
            .into_iter()
            .filter(|m| {
                m.sender_id != self.user_id
                    && !m.is_local_only()
                    && !m.delivered_to.contains(&self.user_id)
            })
            .map(|m| m.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        self.remote
            .mark_delivered(conversation_id, &ids, &self.user_id)
            .await?;
        Ok(ids.len())
    }

    /// Leave a conversation: stop its listener, send pending receipts, drop
    /// its view state.
    pub async fn close_conversation(&self, conversation_id: &str) {
        self.subscriptions
            .release(&SubscriptionKey::Messages(conversation_id.to_string()));

        let batcher = self.receipts.lock().remove(conversation_id);
        if let Some(batcher) = batcher {
            if let Err(e) = batcher.close().await {
                log::warn!("Failed to flush read receipts for {}: {}", conversation_id, e);
            }
        }

        self.views.lock().open.remove(conversation_id);
    }

    fn show_local(&self, message: Message) {
        let mut views = self.views.lock();
        if let Some(view) = views.open.get_mut(&message.conversation_id) {
            // Keep the view in (timestamp, id) order
            let at = view
                .messages
                .partition_point(|m| (m.timestamp, &m.id) <= (message.timestamp, &message.id));
            view.messages.insert(at, message);
            view.revision += 1;
        }
    }

    fn show_status(&self, conversation_id: &str, local_id: &str, status: MessageStatus) {
        let mut views = self.views.lock();
        if let Some(view) = views.open.get_mut(conversation_id) {
            if let Some(m) = view.messages.iter_mut().find(|m| m.id == local_id) {
                m.status = status;
                view.revision += 1;
            }
        }
    }
}
