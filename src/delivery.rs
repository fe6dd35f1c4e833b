use crate::bulk::{BulkOptions, BulkProcessor, BulkStats};
use crate::client::{IndexClient, IndexRequest};
use crate::error::{report, ErrorLogger, HookError};
use crate::formatter::Document;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub(crate) const SEND_FAILED: &str = "couldn't send log to elastic";

/// Where documents go, shared by every strategy of one hook.
pub(crate) struct Target {
    pub client: Arc<dyn IndexClient>,
    pub index: String,
    pub doc_type: String,
    pub error_logger: Option<ErrorLogger>,
    pub cancel: CancellationToken,
}

impl Target {
    pub fn request(&self, document: &Document) -> Result<IndexRequest, HookError> {
        Ok(IndexRequest::new(&self.index, &self.doc_type, document)?)
    }

    /// Index one document, giving up early if the hook is cancelled.
    pub async fn index_one(&self, document: &Document) -> Result<(), HookError> {
        let request = self.request(document)?;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HookError::Cancelled),
            res = self.client.index(&request) => res.map_err(|source| HookError::Delivery {
                index: self.index.clone(),
                source,
            }),
        }
    }

    pub fn report(&self, context: &str, err: &HookError) {
        report(self.error_logger.as_ref(), context, err);
    }
}

/// What `enqueue` does when the async queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wait for a free slot.
    Block,
    /// Drop the document and report [`HookError::QueueFull`].
    #[default]
    Reject,
}

/// Worker pool settings for asynchronous delivery.
#[derive(Debug, Clone)]
pub struct AsyncOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// How long `close` waits for queued documents to be sent.
    pub shutdown_timeout: Duration,
}

impl Default for AsyncOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            overflow: OverflowPolicy::Reject,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl AsyncOptions {
    pub(crate) fn validate(&self) -> Result<(), HookError> {
        if self.workers == 0 {
            return Err(HookError::InvalidOptions("async workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(HookError::InvalidOptions("async queue capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Delivery policy chosen while the hook is being configured.
#[derive(Debug, Clone, Default)]
pub enum DeliveryMode {
    /// Index each document before `fire` returns.
    #[default]
    Sync,
    /// Hand documents to a bounded worker pool.
    Async(AsyncOptions),
    /// Buffer documents and ship them through `_bulk`.
    Bulk(BulkOptions),
}

/// Running strategy, started from a [`DeliveryMode`] on the first record.
pub(crate) enum Strategy {
    Sync,
    Async(AsyncPool),
    Bulk(BulkProcessor),
}

impl Strategy {
    pub fn start(mode: &DeliveryMode, target: &Arc<Target>) -> Self {
        match mode {
            DeliveryMode::Sync => Strategy::Sync,
            DeliveryMode::Async(options) => {
                Strategy::Async(AsyncPool::start(options.clone(), Arc::clone(target)))
            }
            DeliveryMode::Bulk(options) => {
                Strategy::Bulk(BulkProcessor::start(options.clone(), Arc::clone(target)))
            }
        }
    }

    pub async fn deliver(&self, target: &Target, document: Document) -> Result<(), HookError> {
        match self {
            Strategy::Sync => target.index_one(&document).await,
            Strategy::Async(pool) => {
                pool.enqueue(target, document).await;
                Ok(())
            }
            Strategy::Bulk(processor) => {
                match target.request(&document) {
                    Ok(request) => processor.add(request),
                    Err(e) => target.report(SEND_FAILED, &e),
                }
                Ok(())
            }
        }
    }

    pub async fn flush(&self) {
        if let Strategy::Bulk(processor) = self {
            processor.flush().await;
        }
    }

    pub fn bulk_stats(&self) -> Option<BulkStats> {
        match self {
            Strategy::Bulk(processor) => processor.stats(),
            _ => None,
        }
    }

    /// Two-phase shutdown: stop accepting, then drain within the
    /// configured timeout. Failures are reported, never returned.
    pub async fn close(&self, target: &Target) {
        let result = match self {
            Strategy::Sync => Ok(()),
            Strategy::Async(pool) => pool.close().await,
            Strategy::Bulk(processor) => processor.close().await,
        };
        if let Err(e) = result {
            target.report("couldn't close", &e);
        }
    }
}

/// Fixed set of workers draining a bounded queue of documents.
pub(crate) struct AsyncPool {
    sender: Mutex<Option<mpsc::Sender<Document>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    options: AsyncOptions,
    dropped: AtomicU64,
}

impl AsyncPool {
    fn start(options: AsyncOptions, target: Arc<Target>) -> Self {
        let (tx, rx) = mpsc::channel::<Document>(options.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..options.workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let target = Arc::clone(&target);
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            _ = target.cancel.cancelled() => None,
                            doc = async { rx.lock().await.recv().await } => doc,
                        };
                        let Some(document) = next else { break };
                        if let Err(e) = target.index_one(&document).await {
                            target.report(SEND_FAILED, &e);
                        }
                    }
                    debug!(worker = id, "async delivery worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            options,
            dropped: AtomicU64::new(0),
        }
    }

    async fn enqueue(&self, target: &Target, document: Document) {
        let sender = lock(&self.sender).clone();
        let Some(sender) = sender else {
            target.report(SEND_FAILED, &HookError::Closed);
            return;
        };

        let result = match self.options.overflow {
            OverflowPolicy::Block => sender.send(document).await.map_err(|_| HookError::Closed),
            OverflowPolicy::Reject => sender.try_send(document).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => HookError::QueueFull {
                    capacity: self.options.queue_capacity,
                },
                mpsc::error::TrySendError::Closed(_) => HookError::Closed,
            }),
        };

        if let Err(e) = result {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            target.report(SEND_FAILED, &e);
        }
    }

    async fn close(&self) -> Result<(), HookError> {
        // Dropping the last sender lets workers drain the queue and exit.
        lock(&self.sender).take();
        let handles = std::mem::take(&mut *lock(&self.workers));
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            debug!(dropped, "async delivery dropped documents on overflow");
        }

        tokio::time::timeout(self.options.shutdown_timeout, drain)
            .await
            .map_err(|_| HookError::shutdown_timeout("async delivery workers", self.options.shutdown_timeout))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
