use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::core::models::NetworkStatus;

type Callback = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

struct Inner {
    status: watch::Sender<NetworkStatus>,
    listeners: Mutex<BTreeMap<u64, Callback>>,
    next_listener: AtomicU64,
}

/// Tracks device connectivity as reported by the platform and fans changes
/// out to listeners.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<Inner>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    /// Starts disconnected with unknown reachability until the first report.
    pub fn new() -> Self {
        Self::with_status(NetworkStatus {
            connected: false,
            reachable: None,
        })
    }

    pub fn with_status(initial: NetworkStatus) -> Self {
        let (status, _) = watch::channel(initial);
        ConnectivityMonitor {
            inner: Arc::new(Inner {
                status,
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.inner.status.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status().is_online()
    }

    /// Feed a platform connectivity signal. Listeners only hear about actual
    /// changes. Returns whether the status changed.
    pub fn report(&self, status: NetworkStatus) -> bool {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if !changed {
            return false;
        }

        log::info!(
            "Network status: connected={} reachable={:?}",
            status.connected,
            status.reachable
        );

        // Call outside the lock so a callback may (un)subscribe
        let callbacks: Vec<Callback> = self.inner.listeners.lock().values().cloned().collect();
        for callback in callbacks {
            callback(status);
        }
        true
    }

    pub fn subscribe(&self, callback: impl Fn(NetworkStatus) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, Arc::new(callback));
        ListenerHandle {
            id,
            monitor: Arc::downgrade(&self.inner),
        }
    }

    pub fn watch(&self) -> watch::Receiver<NetworkStatus> {
        self.inner.status.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

/// Removes its listener on `unsubscribe` or drop.
pub struct ListenerHandle {
    id: u64,
    monitor: Weak<Inner>,
}

impl ListenerHandle {
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner.listeners.lock().remove(&self.id);
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
