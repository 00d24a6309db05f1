use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::core::error::RemoteError;

/// Destination of a batch of read receipts.
#[async_trait]
pub trait ReceiptSink: Send + Sync {
    async fn mark_read(&self, message_ids: Vec<String>) -> Result<(), RemoteError>;
}

type FlushReply = oneshot::Sender<Result<usize, RemoteError>>;

enum BatchCmd {
    Add(String),
    Flush(FlushReply),
    Close(FlushReply),
}

/// Collects read receipts and sends them as one batch once no new id has
/// arrived for the quiescence window.
pub struct ReadReceiptBatcher {
    tx: mpsc::UnboundedSender<BatchCmd>,
}

impl ReadReceiptBatcher {
    pub fn new(sink: Arc<dyn ReceiptSink>, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_loop(sink, window, rx));
        ReadReceiptBatcher { tx }
    }

    /// Queue a message id. Restarts the window.
    pub fn add(&self, message_id: &str) {
        if self.tx.send(BatchCmd::Add(message_id.to_string())).is_err() {
            log::warn!("Dropping read receipt for {}: batcher closed", message_id);
        }
    }

    /// Send everything queued now. Returns the number of ids sent; zero and
    /// no remote call when nothing was queued.
    pub async fn flush(&self) -> Result<usize, RemoteError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(BatchCmd::Flush(reply)).is_err() {
            return Ok(0);
        }
        rx.await.unwrap_or(Ok(0))
    }

    /// Final flush, then stop.
    pub async fn close(self) -> Result<usize, RemoteError> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(BatchCmd::Close(reply)).is_err() {
            return Ok(0);
        }
        rx.await.unwrap_or(Ok(0))
    }

    async fn run_loop(
        sink: Arc<dyn ReceiptSink>,
        window: Duration,
        mut rx: mpsc::UnboundedReceiver<BatchCmd>,
    ) {
        let mut pending = BTreeSet::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let cmd = match deadline {
                Some(at) => tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        if let Err(e) = Self::send_batch(sink.as_ref(), &mut pending).await {
                            log::warn!("Failed to send read receipts: {}", e);
                        }
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match cmd {
                Some(BatchCmd::Add(id)) => {
                    pending.insert(id);
                    deadline = Some(Instant::now() + window);
                }
                Some(BatchCmd::Flush(reply)) => {
                    deadline = None;
                    let _ = reply.send(Self::send_batch(sink.as_ref(), &mut pending).await);
                }
                Some(BatchCmd::Close(reply)) => {
                    let _ = reply.send(Self::send_batch(sink.as_ref(), &mut pending).await);
                    break;
                }
                None => {
                    // Handle dropped without close
                    if let Err(e) = Self::send_batch(sink.as_ref(), &mut pending).await {
                        log::warn!("Failed to send read receipts: {}", e);
                    }
                    break;
                }
            }
        }
        if !pending.is_empty() {
            log::warn!("Discarding {} unsent read receipt(s)", pending.len());
        }
    }

    /// Failed ids go back into `pending`.
    async fn send_batch(
        sink: &dyn ReceiptSink,
        pending: &mut BTreeSet<String>,
    ) -> Result<usize, RemoteError> {
        if pending.is_empty() {
            return Ok(0);
        }
        let batch: Vec<String> = std::mem::take(pending).into_iter().collect();
        let count = batch.len();
        match sink.mark_read(batch.clone()).await {
            Ok(()) => {
                log::debug!("Sent {} read receipt(s)", count);
                Ok(count)
            }
            Err(e) => {
                pending.extend(batch);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<String>>>,
        failing: Mutex<bool>,
    }

    #[async_trait]
    impl ReceiptSink for RecordingSink {
        async fn mark_read(&self, message_ids: Vec<String>) -> Result<(), RemoteError> {
            if *self.failing.lock() {
                return Err(RemoteError::Unavailable("offline".into()));
            }
            self.batches.lock().push(message_ids);
            Ok(())
        }
    }

    const WINDOW: Duration = Duration::from_millis(1000);

    fn batcher() -> (Arc<RecordingSink>, ReadReceiptBatcher) {
        let sink = Arc::new(RecordingSink::default());
        let batcher = ReadReceiptBatcher::new(sink.clone(), WINDOW);
        (sink, batcher)
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_window_sends_one_deduplicated_batch() {
        let (sink, batcher) = batcher();
        batcher.add("a");
        batcher.add("b");
        batcher.add("a");

        tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
        assert_eq!(*sink.batches.lock(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[tokio::test(start_paused = true)]
    async fn each_add_restarts_the_window() {
        let (sink, batcher) = batcher();
        batcher.add("a");
        tokio::time::sleep(Duration::from_millis(800)).await;
        batcher.add("b");
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(sink.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_is_idempotent() {
        let (sink, batcher) = batcher();
        batcher.add("a");
        assert_eq!(batcher.flush().await.unwrap(), 1);
        assert_eq!(batcher.flush().await.unwrap(), 0);

        tokio::time::sleep(WINDOW * 2).await;
        assert_eq!(sink.batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_keeps_ids() {
        let (sink, batcher) = batcher();
        *sink.failing.lock() = true;
        batcher.add("a");
        assert!(batcher.flush().await.is_err());

        *sink.failing.lock() = false;
        batcher.add("b");
        assert_eq!(batcher.close().await.unwrap(), 2);
        assert_eq!(*sink.batches.lock(), vec![vec!["a".to_string(), "b".to_string()]]);
    }
}
