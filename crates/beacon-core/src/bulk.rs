//! Background batching pipeline for index writes.
//!
//! Items are queued and grouped by a fixed pool of workers. A worker sends
//! its buffer as one bulk request when the buffer reaches `flush_bytes`, when
//! the flush ticker fires, and when the indexer shuts down. Every accepted
//! item resolves exactly one of its two callbacks exactly once.
//!
//! ```text
//!  add() ──▶ [ bounded queue ] ──▶ worker 0 ──┐
//!                               └─▶ worker 1 ──┼──▶ IndexStore::bulk
//!           ticker ──(flush)──────▶ all ───────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::store::{BulkAction, BulkItemResponse, BulkOperation, IndexStore, StoreError};

/// Callback for a successful item.
pub type SuccessFn = Box<dyn FnOnce(BulkItemResponse) + Send>;

/// Callback for a failed item: the item's response, or the request-level error.
pub type FailureFn = Box<dyn FnOnce(Option<BulkItemResponse>, Option<Arc<StoreError>>) + Send>;

/// Bulk indexer errors.
#[derive(Debug, Error)]
pub enum BulkError {
    /// The indexer no longer accepts items.
    #[error("Bulk indexer is closed")]
    Closed,
}

/// Bulk indexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkIndexerConfig {
    /// Number of worker tasks.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Flush a worker's buffer once it holds this many encoded bytes.
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
    /// Periodic flush interval in milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Queue capacity before `add` waits.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Retries for a bulk request that failed with a transient error.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

fn default_num_workers() -> usize {
    2
}

fn default_flush_bytes() -> usize {
    5 * 1024 * 1024 // 5 MiB
}

fn default_flush_interval_ms() -> u64 {
    3_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_retries() -> usize {
    3
}

impl Default for BulkIndexerConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            flush_bytes: default_flush_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            queue_capacity: default_queue_capacity(),
            max_retries: default_max_retries(),
        }
    }
}

impl BulkIndexerConfig {
    /// The flush interval as a `Duration`.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

struct Callbacks {
    on_success: Option<SuccessFn>,
    on_failure: Option<FailureFn>,
}

impl Callbacks {
    fn succeed(self, response: BulkItemResponse) {
        if let Some(f) = self.on_success {
            f(response);
        }
    }

    fn fail(self, response: Option<BulkItemResponse>, error: Option<Arc<StoreError>>) {
        if let Some(f) = self.on_failure {
            f(response, error);
        }
    }
}

/// One queued operation with its completion callbacks.
pub struct BulkItem {
    operation: BulkOperation,
    callbacks: Callbacks,
}

impl BulkItem {
    fn new(action: BulkAction, document_id: String, body: Option<Bytes>) -> Self {
        Self {
            operation: BulkOperation {
                action,
                document_id,
                body,
            },
            callbacks: Callbacks {
                on_success: None,
                on_failure: None,
            },
        }
    }

    /// Upsert `body` under `document_id`.
    #[must_use]
    pub fn index(document_id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(BulkAction::Index, document_id.into(), Some(body.into()))
    }

    /// Delete `document_id`.
    #[must_use]
    pub fn delete(document_id: impl Into<String>) -> Self {
        Self::new(BulkAction::Delete, document_id.into(), None)
    }

    /// Set the success callback.
    #[must_use]
    pub fn on_success(mut self, f: impl FnOnce(BulkItemResponse) + Send + 'static) -> Self {
        self.callbacks.on_success = Some(Box::new(f));
        self
    }

    /// Set the failure callback.
    #[must_use]
    pub fn on_failure(
        mut self,
        f: impl FnOnce(Option<BulkItemResponse>, Option<Arc<StoreError>>) + Send + 'static,
    ) -> Self {
        self.callbacks.on_failure = Some(Box::new(f));
        self
    }

    /// The queued operation.
    #[must_use]
    pub fn operation(&self) -> &BulkOperation {
        &self.operation
    }

    fn encoded_len(&self) -> usize {
        // action line overhead + id + body + newlines
        32 + self.operation.document_id.len() + self.operation.body.as_ref().map_or(0, Bytes::len)
    }
}

/// Snapshot of indexer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    /// Items accepted by `add`.
    pub num_added: u64,
    /// Items sent to the store.
    pub num_flushed: u64,
    /// Items that resolved through `on_failure`.
    pub num_failed: u64,
    /// Index items that succeeded.
    pub num_indexed: u64,
    /// Delete items that succeeded.
    pub num_deleted: u64,
    /// Bulk requests issued, retries excluded.
    pub num_requests: u64,
}

#[derive(Debug, Default)]
struct Counters {
    added: AtomicU64,
    flushed: AtomicU64,
    failed: AtomicU64,
    indexed: AtomicU64,
    deleted: AtomicU64,
    requests: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BulkStats {
        BulkStats {
            num_added: self.added.load(Ordering::Relaxed),
            num_flushed: self.flushed.load(Ordering::Relaxed),
            num_failed: self.failed.load(Ordering::Relaxed),
            num_indexed: self.indexed.load(Ordering::Relaxed),
            num_deleted: self.deleted.load(Ordering::Relaxed),
            num_requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

/// Shared state of the worker pool.
struct Worker {
    id: usize,
    index: String,
    store: Arc<dyn IndexStore>,
    config: BulkIndexerConfig,
    queue: Arc<Mutex<mpsc::Receiver<BulkItem>>>,
    counters: Arc<Counters>,
}

impl Worker {
    async fn run(self, mut ticks: broadcast::Receiver<()>) {
        let mut buffer: Vec<BulkItem> = Vec::new();
        let mut buffered_bytes = 0usize;
        let mut ticking = true;

        loop {
            tokio::select! {
                item = next_item(&self.queue) => match item {
                    Some(item) => {
                        buffered_bytes += item.encoded_len();
                        buffer.push(item);
                        if buffered_bytes >= self.config.flush_bytes {
                            trace!(worker = self.id, bytes = buffered_bytes, "Flush threshold reached");
                            self.flush(std::mem::take(&mut buffer)).await;
                            buffered_bytes = 0;
                        }
                    }
                    None => {
                        self.flush(std::mem::take(&mut buffer)).await;
                        break;
                    }
                },
                tick = ticks.recv(), if ticking => match tick {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if !buffer.is_empty() {
                            trace!(worker = self.id, items = buffer.len(), "Periodic flush");
                            self.flush(std::mem::take(&mut buffer)).await;
                            buffered_bytes = 0;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => ticking = false,
                },
            }
        }

        debug!(worker = self.id, "Bulk worker stopped");
    }

    async fn flush(&self, items: Vec<BulkItem>) {
        if items.is_empty() {
            return;
        }

        let (operations, callbacks): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|item| (item.operation, item.callbacks))
            .unzip();

        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        self.counters
            .flushed
            .fetch_add(operations.len() as u64, Ordering::Relaxed);

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.config.max_retries)
            .with_jitter();

        let result = (|| async { self.store.bulk(&self.index, &operations).await })
            .retry(backoff)
            .when(StoreError::is_transient)
            .notify(|err: &StoreError, dur: Duration| {
                warn!(worker = self.id, error = %err, retry_in = ?dur, "Bulk request failed, retrying");
            })
            .await;

        match result {
            Ok(responses) => {
                let mut responses = responses.into_iter();
                let mut missing: Option<Arc<StoreError>> = None;
                for (operation, callbacks) in operations.iter().zip(callbacks) {
                    match responses.next() {
                        Some(response) if response.is_success() => {
                            let counter = match operation.action {
                                BulkAction::Index => &self.counters.indexed,
                                BulkAction::Delete => &self.counters.deleted,
                            };
                            counter.fetch_add(1, Ordering::Relaxed);
                            callbacks.succeed(response);
                        }
                        Some(response) => {
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            callbacks.fail(Some(response), None);
                        }
                        None => {
                            self.counters.failed.fetch_add(1, Ordering::Relaxed);
                            let err = missing
                                .get_or_insert_with(|| {
                                    Arc::new(StoreError::InvalidResponse(
                                        "bulk response is missing items".into(),
                                    ))
                                })
                                .clone();
                            callbacks.fail(None, Some(err));
                        }
                    }
                }
            }
            Err(err) => {
                warn!(worker = self.id, error = %err, items = callbacks.len(), "Bulk request failed");
                self.counters
                    .failed
                    .fetch_add(callbacks.len() as u64, Ordering::Relaxed);
                let err = Arc::new(err);
                for callbacks in callbacks {
                    callbacks.fail(None, Some(err.clone()));
                }
            }
        }
    }
}

async fn next_item(queue: &Mutex<mpsc::Receiver<BulkItem>>) -> Option<BulkItem> {
    queue.lock().await.recv().await
}

/// Batching pipeline in front of an [`IndexStore`].
pub struct BulkIndexer {
    index: String,
    sender: Mutex<Option<mpsc::Sender<BulkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ticker: JoinHandle<()>,
    counters: Arc<Counters>,
    config: BulkIndexerConfig,
}

impl BulkIndexer {
    /// Start the worker pool and flush ticker for `index`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        store: Arc<dyn IndexStore>,
        index: impl Into<String>,
        config: BulkIndexerConfig,
    ) -> Self {
        let index = index.into();
        let num_workers = config.num_workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let queue = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());
        let (tick_tx, _) = broadcast::channel(1);

        let workers = (0..num_workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    index: index.clone(),
                    store: store.clone(),
                    config: config.clone(),
                    queue: queue.clone(),
                    counters: counters.clone(),
                };
                tokio::spawn(worker.run(tick_tx.subscribe()))
            })
            .collect();

        let interval = config.flush_interval();
        let ticker = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                // No receivers means every worker has exited.
                if tick_tx.send(()).is_err() {
                    break;
                }
            }
        });

        info!(
            index = %index,
            store = store.name(),
            workers = num_workers,
            flush_interval_ms = config.flush_interval_ms,
            "Bulk indexer started"
        );

        Self {
            index,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            ticker,
            counters,
            config,
        }
    }

    /// Queue an item.
    ///
    /// Waits while the queue is full. Once this returns `Ok`, exactly one of
    /// the item's callbacks will run.
    ///
    /// # Errors
    ///
    /// Returns [`BulkError::Closed`] if the indexer has been closed; no callback runs.
    pub async fn add(&self, item: BulkItem) -> Result<(), BulkError> {
        let sender = self.sender.lock().await.clone().ok_or(BulkError::Closed)?;
        sender.send(item).await.map_err(|_| BulkError::Closed)?;
        self.counters.added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> BulkStats {
        self.counters.snapshot()
    }

    /// The target index.
    #[must_use]
    pub fn index(&self) -> &str {
        &self.index
    }

    /// The indexer's configuration.
    #[must_use]
    pub fn config(&self) -> &BulkIndexerConfig {
        &self.config
    }

    /// Stop accepting items, flush everything queued and wait for the workers.
    pub async fn close(&self) {
        if self.sender.lock().await.take().is_none() {
            return;
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if let Err(e) = handle.await {
                warn!(error = %e, "Bulk worker terminated abnormally");
            }
        }
        self.ticker.abort();

        info!(index = %self.index, stats = ?self.stats(), "Bulk indexer closed");
    }
}

impl Drop for BulkIndexer {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}
