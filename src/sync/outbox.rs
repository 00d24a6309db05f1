//! Durable outbox for writes made while the remote was unreachable.
//!
//! Entries live in the cache, so they survive restarts. A drain walks them
//! oldest first and delivers each one. There is no backoff: reconnecting is
//! the retry trigger.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::error::SyncError;
use crate::core::ids::now_millis;
use crate::core::models::{MessageStatus, OutgoingContent, PendingWrite};
use crate::core::store::CacheHandle;
use crate::remote::{NewMessage, RemoteStore};
use crate::sync::connectivity::{ConnectivityMonitor, ListenerHandle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Failures that parked their entry.
    pub parked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Offline,
    AlreadyRunning,
    Completed(DrainReport),
}

/// The reconnect trigger: a task fed by a connectivity listener.
struct Trigger {
    task: JoinHandle<()>,
    _listener: ListenerHandle,
}

struct Inner {
    cache: CacheHandle,
    remote: Arc<dyn RemoteStore>,
    monitor: ConnectivityMonitor,
    max_attempts: Option<u32>,
    draining: AtomicBool,
    trigger: Mutex<Option<Trigger>>,
}

/// Clears the in-progress flag when a drain ends, however it ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<Inner>,
}

impl SyncManager {
    pub fn new(
        cache: CacheHandle,
        remote: Arc<dyn RemoteStore>,
        monitor: ConnectivityMonitor,
        max_attempts: Option<u32>,
    ) -> Self {
        SyncManager {
            inner: Arc::new(Inner {
                cache,
                remote,
                monitor,
                max_attempts,
                draining: AtomicBool::new(false),
                trigger: Mutex::new(None),
            }),
        }
    }

    /// Queue a write for delivery. Re-queuing a local id replaces its payload.
    pub async fn enqueue(
        &self,
        local_id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: OutgoingContent,
    ) -> Result<(), SyncError> {
        let entry = PendingWrite::new(local_id, conversation_id, sender_id, content, now_millis());
        self.inner.cache.enqueue_pending(entry).await?;
        log::debug!("Queued {} for {}", local_id, conversation_id);
        Ok(())
    }

    /// Put a failed message back in line: it shows as `sending` again and
    /// its entry is unparked, or recreated if it was never queued.
    pub async fn requeue(
        &self,
        local_id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: OutgoingContent,
    ) -> Result<(), SyncError> {
        let cache = &self.inner.cache;
        cache.set_local_status(local_id, MessageStatus::Sending).await?;
        if cache.get_pending(local_id).await?.is_some() {
            cache.unpark_pending(local_id).await?;
        } else {
            self.enqueue(local_id, conversation_id, sender_id, content)
                .await?;
        }
        Ok(())
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Attempt delivery of every unparked entry, oldest first.
    ///
    /// A drain requested while another runs is skipped, not queued: it
    /// returns `AlreadyRunning` and changes nothing. Entries queued during a
    /// drain wait for the next trigger.
    pub async fn drain(&self) -> Result<DrainOutcome, SyncError> {
        let inner = &self.inner;
        if !inner.monitor.is_online() {
            log::debug!("Skipping drain: offline");
            return Ok(DrainOutcome::Offline);
        }
        if inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Skipping drain: already running");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard(&inner.draining);

        let mut report = DrainReport::default();
        let entries: Vec<PendingWrite> = inner.cache.pending_entries().await?;
        if !entries.is_empty() {
            log::info!("Draining {} queued message(s)", entries.len());
        }

        for entry in entries {
            if !inner.monitor.is_online() {
                log::info!("Connection lost mid-drain, {} attempted", report.attempted);
                return Ok(DrainOutcome::Completed(report));
            }
            self.deliver(&entry, &mut report).await?;
        }

        if report.attempted > 0 {
            log::info!(
                "Drain finished: {} delivered, {} failed, {} parked",
                report.delivered,
                report.failed,
                report.parked
            );
        }
        Ok(DrainOutcome::Completed(report))
    }

    async fn deliver(&self, entry: &PendingWrite, report: &mut DrainReport) -> Result<(), SyncError> {
        let inner = &self.inner;
        report.attempted += 1;

        let message = NewMessage {
            local_id: entry.local_id.clone(),
            conversation_id: entry.conversation_id.clone(),
            sender_id: entry.sender_id.clone(),
            content: entry.content.clone(),
        };
        match inner.remote.send_message(&message).await {
            Ok(server_id) => {
                report.delivered += 1;
                match inner.cache.remove_pending(&entry.local_id).await {
                    Ok(_) => log::debug!("Delivered {} as {}", entry.local_id, server_id),
                    // The next drain sends it again
                    Err(e) => log::error!(
                        "Delivered {} as {} but could not remove it from the outbox: {}",
                        entry.local_id,
                        server_id,
                        e
                    ),
                }
            }
            Err(e) => {
                report.failed += 1;
                let attempts = inner
                    .cache
                    .record_delivery_failure(&entry.local_id, now_millis(), &e.to_string())
                    .await?;

                let exhausted = matches!(
                    (inner.max_attempts, attempts),
                    (Some(max), Some(n)) if n >= max
                );
                if !e.is_transient() || exhausted {
                    inner.cache.park_pending(&entry.local_id).await?;
                    report.parked += 1;
                    log::warn!("Giving up on {} for now: {}", entry.local_id, e);
                } else {
                    log::warn!("Failed to deliver {}: {}", entry.local_id, e);
                }
            }
        }
        Ok(())
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.drain().await {
            log::error!("Outbox drain failed: {}", e);
        }
    }

    /// Drain once now, then again on every offline → online transition.
    ///
    /// Every status change is queued to the trigger task, so reconnects
    /// that land while it is busy or not yet scheduled each get a drain.
    pub fn start(&self) {
        let mut trigger = self.inner.trigger.lock();
        if trigger.is_some() {
            return;
        }

        let (tx, mut changes) = mpsc::unbounded_channel();
        let listener = self.inner.monitor.subscribe(move |status| {
            let _ = tx.send(status);
        });
        let mut was_online = self.inner.monitor.is_online();

        let manager = self.clone();
        let task = tokio::spawn(async move {
            manager.drain_logged().await;

            while let Some(status) = changes.recv().await {
                let online = status.is_online();
                if online && !was_online {
                    manager.drain_logged().await;
                }
                was_online = online;
            }
        });

        *trigger = Some(Trigger {
            task,
            _listener: listener,
        });
        log::debug!("Outbox trigger started");
    }

    pub fn stop(&self) {
        if let Some(trigger) = self.inner.trigger.lock().take() {
            trigger.task.abort();
            log::debug!("Outbox trigger stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.trigger.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{Message, NetworkStatus};
    use crate::remote::memory::MemoryRemote;
    use std::time::Duration;

    fn setup(max_attempts: Option<u32>) -> (CacheHandle, Arc<MemoryRemote>, ConnectivityMonitor, SyncManager) {
        let cache = CacheHandle::open_in_memory().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let monitor = ConnectivityMonitor::new();
        let manager = SyncManager::new(cache.clone(), remote.clone(), monitor.clone(), max_attempts);
        (cache, remote, monitor, manager)
    }

    fn text(s: &str) -> OutgoingContent {
        OutgoingContent::Text(s.into())
    }

    fn completed(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Completed(report) => report,
            other => panic!("expected a completed drain, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_drain_is_a_noop() {
        let (cache, remote, _monitor, manager) = setup(None);
        manager.enqueue("l1", "c1", "u1", text("hi")).await.unwrap();

        assert_eq!(manager.drain().await.unwrap(), DrainOutcome::Offline);
        assert_eq!(remote.send_attempts(), 0);
        assert_eq!(cache.get_pending("l1").await.unwrap().unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn each_entry_removed_or_retried() {
        let (cache, remote, monitor, manager) = setup(None);
        monitor.report(NetworkStatus::online());
        for id in ["l1", "l2", "l3"] {
            manager.enqueue(id, "c1", "u1", text(id)).await.unwrap();
        }
        remote.fail_next_sends(1);

        let report = completed(manager.drain().await.unwrap());
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);

        let left = cache.all_pending().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].local_id, "l1");
        assert_eq!(left[0].retry_count, 1);
        assert!(left[0].last_error.is_some());
    }

    #[tokio::test]
    async fn drains_in_creation_order() {
        let (cache, remote, monitor, manager) = setup(None);
        for (id, at) in [("b", 20), ("a", 10), ("c", 30)] {
            cache
                .enqueue_pending(PendingWrite::new(id, "c1", "u1", text(id), at))
                .await
                .unwrap();
        }
        monitor.report(NetworkStatus::online());
        completed(manager.drain().await.unwrap());

        let order: Vec<_> = remote
            .messages("c1")
            .into_iter()
            .filter_map(|d| d.local_id)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn concurrent_drains_deliver_once() {
        let (cache, remote, monitor, manager) = setup(None);
        monitor.report(NetworkStatus::online());
        manager.enqueue("l1", "c1", "u1", text("a")).await.unwrap();
        manager.enqueue("l2", "c1", "u1", text("b")).await.unwrap();

        let (first, second) = tokio::join!(manager.drain(), manager.drain());
        let outcomes = [first.unwrap(), second.unwrap()];
        assert!(outcomes.contains(&DrainOutcome::AlreadyRunning));
        assert_eq!(remote.send_attempts(), 2);
        assert_eq!(remote.messages("c1").len(), 2);
        assert_eq!(cache.pending_count().await.unwrap(), 0);
        assert!(!manager.is_draining());
    }

    #[tokio::test]
    async fn skipped_drain_is_not_queued() {
        let (cache, remote, monitor, manager) = setup(None);
        monitor.report(NetworkStatus::online());
        manager.enqueue("l1", "c1", "u1", text("a")).await.unwrap();

        // Another drain holds the flag
        manager.inner.draining.store(true, Ordering::Release);
        assert_eq!(manager.drain().await.unwrap(), DrainOutcome::AlreadyRunning);
        manager.inner.draining.store(false, Ordering::Release);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(remote.send_attempts(), 0);
        assert_eq!(cache.pending_count().await.unwrap(), 1);

        assert_eq!(completed(manager.drain().await.unwrap()).delivered, 1);
    }

    #[tokio::test]
    async fn delivered_entry_that_cannot_be_removed_does_not_stop_drain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let cache = CacheHandle::open(&path).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let monitor = ConnectivityMonitor::with_status(NetworkStatus::online());
        let manager = SyncManager::new(cache.clone(), remote.clone(), monitor, None);
        manager.enqueue("l1", "c1", "u1", text("a")).await.unwrap();
        manager.enqueue("l2", "c1", "u1", text("b")).await.unwrap();

        let side = rusqlite::Connection::open(&path).unwrap();
        side.execute_batch(
            "CREATE TRIGGER keep_l1 BEFORE DELETE ON pending_messages
             WHEN OLD.local_id = 'l1'
             BEGIN SELECT RAISE(ABORT, 'locked'); END;",
        )
        .unwrap();

        let report = completed(manager.drain().await.unwrap());
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(remote.send_attempts(), 2);

        let left: Vec<_> = cache
            .all_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.local_id)
            .collect();
        assert_eq!(left, vec!["l1"]);
    }

    #[tokio::test]
    async fn permission_denied_parks_and_fails_message() {
        let (cache, remote, monitor, manager) = setup(None);
        monitor.report(NetworkStatus::online());
        let content = text("hi");
        cache
            .stage_outgoing(
                Message::optimistic("l1", "c1", "u1", &content, 1),
                Some(PendingWrite::new("l1", "c1", "u1", content, 1)),
            )
            .await
            .unwrap();
        remote.set_permission_denied(true);

        let report = completed(manager.drain().await.unwrap());
        assert_eq!(report.parked, 1);
        assert_eq!(
            cache.get_message("l1").await.unwrap().unwrap().status,
            MessageStatus::Failed
        );

        // Parked entries sit out later drains
        remote.set_permission_denied(false);
        let report = completed(manager.drain().await.unwrap());
        assert_eq!(report.attempted, 0);

        manager.requeue("l1", "c1", "u1", text("hi")).await.unwrap();
        assert_eq!(
            cache.get_message("l1").await.unwrap().unwrap().status,
            MessageStatus::Sending
        );
        let report = completed(manager.drain().await.unwrap());
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn attempt_limit_parks_entry() {
        let (cache, remote, monitor, manager) = setup(Some(2));
        monitor.report(NetworkStatus::online());
        manager.enqueue("l1", "c1", "u1", text("a")).await.unwrap();
        remote.fail_next_sends(5);

        assert_eq!(completed(manager.drain().await.unwrap()).parked, 0);
        assert_eq!(completed(manager.drain().await.unwrap()).parked, 1);
        let entry = cache.get_pending("l1").await.unwrap().unwrap();
        assert!(entry.parked);
        assert_eq!(entry.retry_count, 2);
    }

    #[tokio::test]
    async fn reconnect_triggers_drain() {
        let (cache, remote, monitor, manager) = setup(None);
        manager.enqueue("l1", "c1", "u1", text("a")).await.unwrap();
        manager.start();
        manager.start();
        assert!(manager.is_running());

        monitor.report(NetworkStatus::online());
        for _ in 0..200 {
            if cache.pending_count().await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(cache.pending_count().await.unwrap(), 0);
        assert_eq!(remote.send_attempts(), 1);

        manager.stop();
        assert!(!manager.is_running());
        assert_eq!(monitor.listener_count(), 0);
    }

    async fn wait_for_attempts(remote: &MemoryRemote, n: u32) {
        for _ in 0..200 {
            if remote.send_attempts() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn back_to_back_reconnect_still_drains() {
        let (cache, remote, monitor, manager) = setup(None);
        monitor.report(NetworkStatus::online());
        remote.set_offline(true);
        manager.enqueue("l1", "c1", "u1", text("a")).await.unwrap();
        manager.start();

        // Startup drain fails against the unreachable backend
        wait_for_attempts(&remote, 1).await;
        assert_eq!(remote.send_attempts(), 1);
        remote.set_offline(false);

        // A blip the trigger task does not get to run in between
        monitor.report(NetworkStatus::offline());
        monitor.report(NetworkStatus::online());

        wait_for_attempts(&remote, 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(remote.send_attempts(), 2);
        assert_eq!(cache.pending_count().await.unwrap(), 0);
        manager.stop();
    }

    #[tokio::test]
    async fn every_queued_reconnect_gets_a_drain() {
        let (cache, remote, monitor, manager) = setup(None);
        monitor.report(NetworkStatus::online());
        remote.set_offline(true);
        manager.enqueue("l1", "c1", "u1", text("a")).await.unwrap();
        manager.start();
        wait_for_attempts(&remote, 1).await;

        // Two reconnects before the trigger task runs again
        monitor.report(NetworkStatus::offline());
        monitor.report(NetworkStatus::online());
        monitor.report(NetworkStatus::offline());
        monitor.report(NetworkStatus::online());

        wait_for_attempts(&remote, 3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(remote.send_attempts(), 3);
        assert_eq!(cache.get_pending("l1").await.unwrap().unwrap().retry_count, 3);
        manager.stop();
    }
}
