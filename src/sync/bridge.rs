//! Live remote queries written through to the cache.
//!
//! Every snapshot is the complete state of its scope. It is applied to the
//! cache in one transaction, then the resulting cached slice is handed to
//! the caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::core::error::{CacheError, SyncError};
use crate::core::ids::now_millis;
use crate::core::models::{Conversation, Message};
use crate::core::store::CacheHandle;
use crate::remote::{normalize_conversations, normalize_messages, RemoteStore, Snapshots};

/// A live listener. Unsubscribes when dropped.
pub struct Subscription {
    label: String,
    active: Arc<AtomicBool>,
    task: AbortHandle,
}

impl Subscription {
    /// Stop the listener. No cache write or callback starts afterwards.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.task.abort();
            log::debug!("Unsubscribed {}", self.label);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[derive(Clone)]
pub struct SyncBridge {
    cache: CacheHandle,
    remote: Arc<dyn RemoteStore>,
}

impl SyncBridge {
    pub fn new(cache: CacheHandle, remote: Arc<dyn RemoteStore>) -> Self {
        SyncBridge { cache, remote }
    }

    /// Mirror a conversation's messages into the cache. Local messages the
    /// server has not echoed yet survive each snapshot.
    pub fn subscribe_messages<F, E>(
        &self,
        conversation_id: &str,
        on_change: F,
        on_error: E,
    ) -> Subscription
    where
        F: Fn(Vec<Message>) + Send + 'static,
        E: Fn(SyncError) + Send + 'static,
    {
        let cache = self.cache.clone();
        let id = conversation_id.to_string();
        spawn_listener(
            format!("messages/{conversation_id}"),
            self.remote.watch_messages(conversation_id),
            move |docs| {
                let cache = cache.clone();
                let id = id.clone();
                async move {
                    let messages = normalize_messages(docs, now_millis());
                    cache.reconcile_messages(&id, messages).await
                }
            },
            on_change,
            on_error,
        )
    }

    /// Mirror the user's conversation list into the cache.
    pub fn subscribe_conversations<F, E>(
        &self,
        user_id: &str,
        on_change: F,
        on_error: E,
    ) -> Subscription
    where
        F: Fn(Vec<Conversation>) + Send + 'static,
        E: Fn(SyncError) + Send + 'static,
    {
        let cache = self.cache.clone();
        let id = user_id.to_string();
        spawn_listener(
            format!("conversations/{user_id}"),
            self.remote.watch_conversations(user_id),
            move |docs| {
                let cache = cache.clone();
                let id = id.clone();
                async move {
                    let conversations = normalize_conversations(docs, now_millis());
                    cache.replace_conversations_for_user(&id, conversations).await
                }
            },
            on_change,
            on_error,
        )
    }
}

/// Run a listener task: each snapshot goes through `apply`, which writes it
/// to the cache and returns the cached slice for `on_change`. Snapshots are
/// applied strictly in order.
fn spawn_listener<D, T, A, Fut, F, E>(
    label: String,
    mut stream: Snapshots<D>,
    apply: A,
    on_change: F,
    on_error: E,
) -> Subscription
where
    D: Send + 'static,
    T: Send + 'static,
    A: Fn(Vec<D>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>, CacheError>> + Send + 'static,
    F: Fn(Vec<T>) + Send + 'static,
    E: Fn(SyncError) + Send + 'static,
{
    let active = Arc::new(AtomicBool::new(true));
    let flag = active.clone();
    let task_label = label.clone();

    let task = tokio::spawn(async move {
        while let Some(snapshot) = stream.next().await {
            if !flag.load(Ordering::SeqCst) {
                break;
            }
            let docs = match snapshot {
                Ok(docs) => docs,
                Err(e) => {
                    log::warn!("Listener {} failed: {}", task_label, e);
                    on_error(e.into());
                    continue;
                }
            };

            match apply(docs).await {
                Ok(cached) => {
                    if flag.load(Ordering::SeqCst) {
                        on_change(cached);
                    }
                }
                Err(e) => {
                    log::error!("Failed to apply snapshot for {}: {}", task_label, e);
                    on_error(e.into());
                }
            }
        }
        log::debug!("Listener {} ended", task_label);
    });

    log::debug!("Subscribed {}", label);
    Subscription {
        label,
        active,
        task: task.abort_handle(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Conversations(String),
    Messages(String),
}

/// At most one live subscription per key.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: Mutex<HashMap<SubscriptionKey, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unsubscribe whatever is registered under `key`, then register the
    /// subscription `factory` creates.
    pub fn replace(&self, key: SubscriptionKey, factory: impl FnOnce() -> Subscription) {
        let mut subs = self.subs.lock();
        if let Some(old) = subs.remove(&key) {
            old.unsubscribe();
        }
        subs.insert(key, factory());
    }

    pub fn release(&self, key: &SubscriptionKey) -> bool {
        let old = self.subs.lock().remove(key);
        match old {
            Some(sub) => {
                sub.unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let drained: Vec<Subscription> = self.subs.lock().drain().map(|(_, s)| s).collect();
        for sub in drained {
            sub.unsubscribe();
        }
    }

    pub fn is_active(&self, key: &SubscriptionKey) -> bool {
        self.subs
            .lock()
            .get(key)
            .is_some_and(Subscription::is_active)
    }

    pub fn len(&self) -> usize {
        self.subs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
