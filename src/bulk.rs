//! Buffered `_bulk` delivery.
//!
//! Producers append [`IndexRequest`]s to a shared buffer. Once the buffer
//! crosses `bulk_actions` or `bulk_size`, or the flush interval elapses, the
//! whole buffer is cut into a batch and queued for a fixed pool of workers.
//! A worker commits its batch, keeps the items that failed with a retryable
//! status and resubmits them after the backoff delay until the policy gives
//! up. A request is either in the buffer or in exactly one batch.

use crate::backoff::Backoff;
use crate::client::{BulkResponse, IndexRequest};
use crate::delivery::{lock, Target, SEND_FAILED};
use crate::error::{ClientError, HookError};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Called with the execution id and the requests right before a commit.
pub type BulkBeforeFn = Arc<dyn Fn(u64, &[IndexRequest]) + Send + Sync>;

/// Called after every commit with either the backend response or the
/// error that prevented one.
pub type BulkAfterFn =
    Arc<dyn Fn(u64, &[IndexRequest], Option<&BulkResponse>, Option<&HookError>) + Send + Sync>;

/// Thresholds and callbacks for bulk delivery.
#[derive(Clone)]
pub struct BulkOptions {
    /// Label used in diagnostics.
    pub name: String,
    pub workers: usize,
    /// Flush once this many requests are buffered. Zero disables.
    pub bulk_actions: usize,
    /// Flush once the buffered payload reaches this many bytes. Zero disables.
    pub bulk_size: usize,
    /// Flush at least this often, even below the thresholds.
    pub flush_interval: Option<Duration>,
    pub backoff: Backoff,
    /// Item statuses that are retried; anything else is dropped.
    pub retry_item_status_codes: Vec<u16>,
    pub before: Option<BulkBeforeFn>,
    pub after: Option<BulkAfterFn>,
    /// Expose counters through [`Hook::bulk_stats`](crate::hook::Hook::bulk_stats).
    pub stats: bool,
    /// Upper bound on how long `close` waits for the final drain.
    pub shutdown_timeout: Duration,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            name: "elastic-hook".to_string(),
            workers: 1,
            bulk_actions: 1000,
            bulk_size: 5 << 20,
            flush_interval: None,
            backoff: Backoff::default(),
            retry_item_status_codes: vec![408, 429, 503, 507],
            before: None,
            after: None,
            stats: false,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for BulkOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkOptions")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .field("bulk_actions", &self.bulk_actions)
            .field("bulk_size", &self.bulk_size)
            .field("flush_interval", &self.flush_interval)
            .field("backoff", &self.backoff)
            .field("retry_item_status_codes", &self.retry_item_status_codes)
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("stats", &self.stats)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl BulkOptions {
    pub(crate) fn validate(&self) -> Result<(), HookError> {
        if self.workers == 0 {
            return Err(HookError::InvalidOptions("bulk workers must be at least 1".into()));
        }
        if self.flush_interval == Some(Duration::ZERO) {
            return Err(HookError::InvalidOptions("flush interval must be positive".into()));
        }
        Ok(())
    }
}

/// Snapshot of bulk delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkStats {
    /// Batches cut from the buffer.
    pub flushed: u64,
    /// `_bulk` requests sent, retries included.
    pub committed: u64,
    /// Documents handed to a worker.
    pub indexed: u64,
    pub succeeded: u64,
    /// Documents dropped after a non-retryable failure or exhausted retries.
    pub failed: u64,
    /// Document resubmissions.
    pub retried: u64,
}

#[derive(Default)]
struct Counters {
    flushed: AtomicU64,
    committed: AtomicU64,
    indexed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BulkStats {
        BulkStats {
            flushed: self.flushed.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Buffer {
    requests: Vec<IndexRequest>,
    bytes: usize,
    closed: bool,
}

impl Buffer {
    fn take(&mut self) -> Vec<IndexRequest> {
        self.bytes = 0;
        std::mem::take(&mut self.requests)
    }
}

type Batch = Vec<IndexRequest>;

struct Shared {
    options: BulkOptions,
    target: Arc<Target>,
    buffer: Mutex<Buffer>,
    batches: Mutex<Option<mpsc::UnboundedSender<Batch>>>,
    /// Batches queued or being committed.
    outstanding: AtomicUsize,
    idle: Notify,
    execution_id: AtomicU64,
    counters: Counters,
    stop: CancellationToken,
}

impl Shared {
    fn threshold_reached(&self, buffer: &Buffer) -> bool {
        let actions = self.options.bulk_actions;
        let size = self.options.bulk_size;
        (actions > 0 && buffer.requests.len() >= actions) || (size > 0 && buffer.bytes >= size)
    }

    /// Queue a batch for the workers. Callers hold the buffer lock, which
    /// keeps batches ordered with respect to `close`.
    fn dispatch(&self, batch: Batch) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Counters::add(&self.counters.flushed, 1);

        let sent = match lock(&self.batches).as_ref() {
            Some(tx) => tx.send(batch).is_ok(),
            None => false,
        };
        if !sent {
            self.finish_batch();
            Counters::add(&self.counters.failed, count);
            self.target.report(SEND_FAILED, &HookError::Closed);
        }
    }

    fn flush_buffer(&self) {
        let mut buffer = lock(&self.buffer);
        let batch = buffer.take();
        self.dispatch(batch);
    }

    fn finish_batch(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn is_retryable(&self, status: u16) -> bool {
        self.options.retry_item_status_codes.contains(&status)
    }

    /// Whether a failed commit should be resubmitted as a whole.
    fn is_retryable_error(&self, err: &ClientError) -> bool {
        match err {
            ClientError::Transport(_) => true,
            ClientError::Status { status, .. } => self.is_retryable(*status),
            ClientError::Decode(_) => false,
        }
    }

    fn drop_requests(&self, count: usize, err: HookError) {
        if count == 0 {
            return;
        }
        Counters::add(&self.counters.failed, count);
        self.target.report("couldn't flush", &err);
    }

    async fn commit(&self, batch: Batch) {
        Counters::add(&self.counters.indexed, batch.len());
        let mut pending = batch;
        let mut retry: u32 = 0;

        loop {
            if self.stop.is_cancelled() {
                self.drop_requests(pending.len(), HookError::Cancelled);
                return;
            }

            let id = self.execution_id.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(before) = &self.options.before {
                before(id, &pending);
            }
            Counters::add(&self.counters.committed, 1);

            let result = tokio::select! {
                _ = self.stop.cancelled() => None,
                res = self.target.client.bulk(&pending) => Some(res),
            };

            let retry_next = match result {
                None => {
                    let err = HookError::Cancelled;
                    if let Some(after) = &self.options.after {
                        after(id, &pending, None, Some(&err));
                    }
                    self.drop_requests(pending.len(), err);
                    return;
                }
                Some(Err(source)) => {
                    let retryable = self.is_retryable_error(&source);
                    let err = HookError::Flush(source.to_string());
                    if let Some(after) = &self.options.after {
                        after(id, &pending, None, Some(&err));
                    }
                    if !retryable {
                        self.drop_requests(pending.len(), err);
                        return;
                    }
                    warn!(bulk = %self.options.name, items = pending.len(), error = %err, "bulk commit failed");
                    pending
                }
                Some(Ok(response)) => {
                    if let Some(after) = &self.options.after {
                        after(id, &pending, Some(&response), None);
                    }
                    self.partition(pending, &response)
                }
            };

            if retry_next.is_empty() {
                return;
            }

            let Some(delay) = self.options.backoff.next(retry) else {
                let err = HookError::Flush(format!(
                    "giving up on {} documents after {} retries",
                    retry_next.len(),
                    retry
                ));
                self.drop_requests(retry_next.len(), err);
                return;
            };

            debug!(bulk = %self.options.name, items = retry_next.len(), ?delay, retry, "retrying bulk items");
            retry += 1;
            Counters::add(&self.counters.retried, retry_next.len());
            tokio::select! {
                _ = self.stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            pending = retry_next;
        }
    }

    /// Split a response into the requests worth retrying; count and report
    /// the rest.
    fn partition(&self, requests: Batch, response: &BulkResponse) -> Batch {
        let mut retry_next = Vec::new();
        let mut rejected = 0usize;
        let mut first_error: Option<String> = None;
        // Requests past the end of the response never got a status.
        let unanswered = requests.len().saturating_sub(response.items.len());

        for (request, item) in requests.into_iter().zip(response.items.iter()) {
            if item.is_success() {
                Counters::add(&self.counters.succeeded, 1);
            } else if self.is_retryable(item.status) {
                retry_next.push(request);
            } else {
                rejected += 1;
                if first_error.is_none() {
                    first_error = Some(format!(
                        "status {}: {}",
                        item.status,
                        item.error.as_deref().unwrap_or("unknown error")
                    ));
                }
            }
        }

        if rejected + unanswered > 0 {
            let detail = first_error.unwrap_or_else(|| "missing from bulk response".to_string());
            self.drop_requests(
                rejected + unanswered,
                HookError::Flush(format!(
                    "{} documents rejected by index {} ({})",
                    rejected + unanswered,
                    self.target.index,
                    detail
                )),
            );
        }
        retry_next
    }
}

/// Handle to a running bulk delivery engine.
pub(crate) struct BulkProcessor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BulkProcessor {
    pub fn start(options: BulkOptions, target: Arc<Target>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Batch>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stop = target.cancel.child_token();

        let shared = Arc::new(Shared {
            options,
            target,
            buffer: Mutex::new(Buffer::default()),
            batches: Mutex::new(Some(tx)),
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            execution_id: AtomicU64::new(0),
            counters: Counters::default(),
            stop,
        });

        let workers = (0..shared.options.workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            _ = shared.stop.cancelled() => None,
                            batch = async { rx.lock().await.recv().await } => batch,
                        };
                        let Some(batch) = next else { break };
                        shared.commit(batch).await;
                        shared.finish_batch();
                    }
                    debug!(bulk = %shared.options.name, worker = id, "bulk worker stopped");
                })
            })
            .collect();

        let ticker = shared.options.flush_interval.map(|interval| {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = shared.stop.cancelled() => break,
                        _ = ticker.tick() => shared.flush_buffer(),
                    }
                }
            })
        });

        Self {
            shared,
            workers: Mutex::new(workers),
            ticker: Mutex::new(ticker),
            closed: AtomicBool::new(false),
        }
    }

    /// Buffer a request. Never blocks on I/O; failures surface through the
    /// callbacks and the error logger.
    pub fn add(&self, request: IndexRequest) {
        let size = request.size_in_bytes();
        let mut buffer = lock(&self.shared.buffer);
        if buffer.closed {
            drop(buffer);
            self.shared.drop_requests(1, HookError::Closed);
            return;
        }
        buffer.bytes += size;
        buffer.requests.push(request);
        if self.shared.threshold_reached(&buffer) {
            let batch = buffer.take();
            self.shared.dispatch(batch);
        }
    }

    /// Send whatever is buffered and wait until every queued batch has
    /// been committed.
    pub async fn flush(&self) {
        self.shared.flush_buffer();
        self.shared.wait_idle().await;
    }

    pub fn stats(&self) -> Option<BulkStats> {
        self.shared
            .options
            .stats
            .then(|| self.shared.counters.snapshot())
    }

    /// Stop the ticker and refuse new requests, queue the remaining buffer
    /// as a final batch, then wait for the workers up to `shutdown_timeout`.
    /// Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), HookError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }

        {
            let mut buffer = lock(&self.shared.buffer);
            buffer.closed = true;
            let batch = buffer.take();
            self.shared.dispatch(batch);
            // Workers exit once the queue is drained.
            lock(&self.shared.batches).take();
        }

        let handles = std::mem::take(&mut *lock(&self.workers));
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        let timeout = self.shared.options.shutdown_timeout;
        match tokio::time::timeout(timeout, drain).await {
            Ok(()) => {
                debug!(bulk = %self.shared.options.name, "bulk processor closed");
                Ok(())
            }
            Err(_) => {
                self.shared.stop.cancel();
                Err(HookError::shutdown_timeout("bulk workers", timeout))
            }
        }
    }
}

impl Drop for BulkProcessor {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::IndexClient;
    use crate::error::ErrorLogger;
    use crate::formatter::Document;
    use crate::memory::MemoryClient;

    fn target(client: &Arc<MemoryClient>, logger: Option<ErrorLogger>) -> Arc<Target> {
        client.create_index("logs");
        Arc::new(Target {
            client: Arc::clone(client) as Arc<dyn IndexClient>,
            index: "logs".to_string(),
            doc_type: "_doc".to_string(),
            error_logger: logger,
            cancel: CancellationToken::new(),
        })
    }

    fn request(n: usize) -> IndexRequest {
        let mut doc = Document::new();
        doc.insert("message".into(), format!("message {}", n).into());
        IndexRequest::new("logs", "_doc", &doc).unwrap()
    }

    fn options() -> BulkOptions {
        BulkOptions {
            stats: true,
            backoff: Backoff::Constant {
                interval: Duration::from_millis(5),
                max_retries: 3,
            },
            ..BulkOptions::default()
        }
    }

    fn collecting_logger() -> (ErrorLogger, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let logger: ErrorLogger = Arc::new(move |context: &str, err: &HookError| {
            sink.lock().unwrap().push(format!("{}: {}", context, err));
        });
        (logger, seen)
    }

    #[tokio::test]
    async fn holds_documents_until_close() {
        let client = Arc::new(MemoryClient::new());
        let processor = BulkProcessor::start(options(), target(&client, None));

        for n in 0..10 {
            processor.add(request(n));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.count("logs"), 0);
        assert_eq!(client.bulk_calls(), 0);

        processor.close().await.unwrap();
        assert_eq!(client.count("logs"), 10);
        assert_eq!(client.bulk_calls(), 1);
    }

    #[tokio::test]
    async fn count_threshold_cuts_batches() {
        let client = Arc::new(MemoryClient::new());
        let processor = BulkProcessor::start(
            BulkOptions {
                bulk_actions: 10,
                workers: 2,
                ..options()
            },
            target(&client, None),
        );

        for n in 0..25 {
            processor.add(request(n));
        }
        processor.flush().await;
        assert_eq!(client.count("logs"), 25);

        let stats = processor.stats().unwrap();
        assert_eq!(stats.flushed, 3);
        assert_eq!(stats.succeeded, 25);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn size_threshold_cuts_batches() {
        let client = Arc::new(MemoryClient::new());
        let size = request(0).size_in_bytes();
        let processor = BulkProcessor::start(
            BulkOptions {
                bulk_actions: 0,
                bulk_size: size * 2,
                ..options()
            },
            target(&client, None),
        );

        processor.add(request(1));
        processor.add(request(2));
        processor.add(request(3));
        // Two requests crossed the byte threshold; the third stays buffered.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.count("logs"), 2);

        processor.close().await.unwrap();
        assert_eq!(client.count("logs"), 3);
    }

    #[tokio::test]
    async fn flush_interval_ships_partial_buffers() {
        let client = Arc::new(MemoryClient::new());
        let processor = BulkProcessor::start(
            BulkOptions {
                flush_interval: Some(Duration::from_millis(20)),
                ..options()
            },
            target(&client, None),
        );

        processor.add(request(1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(client.count("logs"), 1);
        processor.close().await.unwrap();
        assert_eq!(client.count("logs"), 1);
    }

    #[tokio::test]
    async fn retries_retryable_items_and_drops_the_rest() {
        let client = Arc::new(MemoryClient::new());
        let (logger, errors) = collecting_logger();
        let responses = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&responses);
        let processor = BulkProcessor::start(
            BulkOptions {
                after: Some(Arc::new(
                    move |_: u64,
                          requests: &[IndexRequest],
                          resp: Option<&BulkResponse>,
                          _: Option<&HookError>| {
                        let failed = resp.map_or(0, |r| r.failed().count());
                        seen.lock().unwrap().push((requests.len(), failed));
                    },
                )),
                ..options()
            },
            target(&client, Some(logger)),
        );

        // First item is throttled once, second is rejected for good.
        client.fail_bulk_items([429, 400]);
        for n in 0..4 {
            processor.add(request(n));
        }
        processor.flush().await;

        assert_eq!(client.count("logs"), 3);
        assert_eq!(*responses.lock().unwrap(), vec![(4, 2), (1, 0)]);

        let stats = processor.stats().unwrap();
        assert_eq!(stats.committed, 2);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 1);

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("status 400"), "{}", errors[0]);
    }

    #[tokio::test]
    async fn gives_up_after_backoff_is_exhausted() {
        let client = Arc::new(MemoryClient::new());
        let (logger, errors) = collecting_logger();
        let processor = BulkProcessor::start(options(), target(&client, Some(logger)));

        client.fail_bulk_items([503, 503, 503, 503]);
        processor.add(request(1));
        processor.flush().await;

        assert_eq!(client.count("logs"), 0);
        assert_eq!(client.bulk_calls(), 4);
        assert_eq!(processor.stats().unwrap().failed, 1);
        assert!(errors.lock().unwrap()[0].contains("giving up on 1 documents after 3 retries"));
    }

    #[tokio::test]
    async fn transport_failures_resubmit_the_whole_batch() {
        let client = Arc::new(MemoryClient::new());
        let before_calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&before_calls);
        let processor = BulkProcessor::start(
            BulkOptions {
                before: Some(Arc::new(move |_: u64, _: &[IndexRequest]| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..options()
            },
            target(&client, None),
        );

        client.fail_transport(2);
        for n in 0..5 {
            processor.add(request(n));
        }
        processor.flush().await;

        assert_eq!(client.count("logs"), 5);
        assert_eq!(before_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_refuses_late_documents() {
        let client = Arc::new(MemoryClient::new());
        let (logger, errors) = collecting_logger();
        let processor = BulkProcessor::start(options(), target(&client, Some(logger)));

        processor.add(request(1));
        processor.close().await.unwrap();
        processor.close().await.unwrap();
        assert_eq!(client.count("logs"), 1);
        assert_eq!(client.bulk_calls(), 1);

        processor.add(request(2));
        assert_eq!(client.count("logs"), 1);
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_gives_up_after_the_shutdown_timeout() {
        let client = Arc::new(MemoryClient::with_latency(Duration::from_secs(30)));
        let processor = BulkProcessor::start(
            BulkOptions {
                shutdown_timeout: Duration::from_millis(50),
                ..options()
            },
            target(&client, None),
        );

        processor.add(request(1));
        let started = std::time::Instant::now();
        let err = processor.close().await.err().unwrap();
        assert!(matches!(err, HookError::Shutdown(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
