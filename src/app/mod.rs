mod conversations;
mod messages;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::core::ids::LocalIdGenerator;
use crate::core::models::{Conversation, Message};
use crate::core::store::CacheHandle;
use crate::remote::RemoteStore;
use crate::sync::bridge::{SubscriptionRegistry, SyncBridge};
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::outbox::SyncManager;
use crate::sync::receipts::ReadReceiptBatcher;

/// What a send did with the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the server.
    Sent { local_id: String, server_id: String },
    /// Stored in the outbox for a later drain.
    Queued { local_id: String },
}

impl SendOutcome {
    pub fn local_id(&self) -> &str {
        match self {
            SendOutcome::Sent { local_id, .. } | SendOutcome::Queued { local_id } => local_id,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConversationView {
    pub(crate) messages: Vec<Message>,
    pub(crate) error: Option<String>,
    /// Bumped on every change to `messages`.
    pub(crate) revision: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Views {
    pub(crate) conversations: Vec<Conversation>,
    pub(crate) conversations_error: Option<String>,
    pub(crate) open: HashMap<String, ConversationView>,
}

/// One signed-in user's view of the chat data: cache first, live remote
/// listeners on top, outbox for anything written while offline.
pub struct ChatSession {
    pub(super) user_id: String,
    pub(super) config: Config,

    pub(super) cache: CacheHandle,
    pub(super) remote: Arc<dyn RemoteStore>,
    pub(super) monitor: ConnectivityMonitor,
    pub(super) ids: Arc<dyn LocalIdGenerator>,

    pub(super) bridge: SyncBridge,
    pub(super) outbox: SyncManager,
    pub(super) subscriptions: SubscriptionRegistry,
    pub(super) receipts: Mutex<HashMap<String, ReadReceiptBatcher>>,

    pub(super) views: Arc<Mutex<Views>>,
}

impl ChatSession {
    /// Wire up the engine and start the outbox, which drains once right away.
    pub fn open(
        user_id: &str,
        config: Config,
        cache: CacheHandle,
        remote: Arc<dyn RemoteStore>,
        monitor: ConnectivityMonitor,
        ids: Arc<dyn LocalIdGenerator>,
    ) -> Self {
        let bridge = SyncBridge::new(cache.clone(), remote.clone());
        let outbox = SyncManager::new(
            cache.clone(),
            remote.clone(),
            monitor.clone(),
            config.max_delivery_attempts,
        );
        outbox.start();
        log::info!("Chat session opened for {}", user_id);

        ChatSession {
            user_id: user_id.to_string(),
            config,
            cache,
            remote,
            monitor,
            ids,
            bridge,
            outbox,
            subscriptions: SubscriptionRegistry::new(),
            receipts: Mutex::new(HashMap::new()),
            views: Arc::new(Mutex::new(Views::default())),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn cache(&self) -> &CacheHandle {
        &self.cache
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn outbox(&self) -> &SyncManager {
        &self.outbox
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.views.lock().conversations.clone()
    }

    pub fn conversations_error(&self) -> Option<String> {
        self.views.lock().conversations_error.clone()
    }

    /// Messages currently shown for an open conversation.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.views
            .lock()
            .open
            .get(conversation_id)
            .map(|v| v.messages.clone())
            .unwrap_or_default()
    }

    /// Last listener error of an open conversation.
    pub fn view_error(&self, conversation_id: &str) -> Option<String> {
        self.views
            .lock()
            .open
            .get(conversation_id)
            .and_then(|v| v.error.clone())
    }

    pub fn view_revision(&self, conversation_id: &str) -> u64 {
        self.views
            .lock()
            .open
            .get(conversation_id)
            .map_or(0, |v| v.revision)
    }

    /// Release every listener, flush pending receipts and stop the outbox.
    pub async fn shutdown(&self) {
        self.subscriptions.release_all();

        let batchers: Vec<(String, ReadReceiptBatcher)> = self.receipts.lock().drain().collect();
        for (conversation_id, batcher) in batchers {
            if let Err(e) = batcher.close().await {
                log::warn!("Failed to flush read receipts for {}: {}", conversation_id, e);
            }
        }

        self.outbox.stop();
        self.views.lock().open.clear();
        log::info!("Chat session closed for {}", self.user_id);
    }
}
