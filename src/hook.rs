use crate::bulk::{BulkOptions, BulkStats};
use crate::client::{IndexClient, DEFAULT_DOC_TYPE};
use crate::delivery::{AsyncOptions, DeliveryMode, Strategy, Target, SEND_FAILED};
use crate::error::{report, ErrorLogger, HookError};
use crate::formatter::{self, Document, Formatter};
use crate::record::{LogRecord, ALL_LEVELS};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};

/// Lifecycle of a [`Hook`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    /// Constructed and verified; configuration calls are allowed.
    Ready,
    /// At least one record was delivered; configuration is frozen.
    Active,
    /// Terminal.
    Closed,
}

impl HookState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HookState::Ready,
            1 => HookState::Active,
            _ => HookState::Closed,
        }
    }

    fn name(self) -> &'static str {
        match self {
            HookState::Ready => "ready",
            HookState::Active => "active",
            HookState::Closed => "closed",
        }
    }
}

struct Running {
    target: Arc<Target>,
    strategy: Strategy,
}

/// Ships [`LogRecord`]s to one index of a search backend.
///
/// Configure it with the `&mut self` setters right after [`Hook::new`], then
/// share it (usually behind an `Arc`) with the logging framework. The
/// delivery strategy starts on the first record passed to [`Hook::fire`];
/// from then on the configuration is frozen and setters return
/// [`HookError::NotConfigurable`].
pub struct Hook {
    client: Arc<dyn IndexClient>,
    index: String,
    doc_type: String,
    levels: Vec<Level>,
    formatter: Formatter,
    mode: DeliveryMode,
    error_logger: Option<ErrorLogger>,
    cancel: CancellationToken,
    state: AtomicU8,
    running: OnceLock<Running>,
}

impl Hook {
    /// Create a hook for `index`, failing if the index cannot be checked or
    /// does not exist. The hook starts in sync mode at every level.
    pub async fn new(
        client: Arc<dyn IndexClient>,
        index: impl Into<String>,
    ) -> Result<Self, HookError> {
        let index = index.into();
        let exists = client
            .index_exists(&index)
            .await
            .map_err(|source| HookError::Construction {
                index: index.clone(),
                source,
            })?;
        if !exists {
            return Err(HookError::IndexNotFound { index });
        }

        Ok(Self {
            client,
            index,
            doc_type: DEFAULT_DOC_TYPE.to_string(),
            levels: ALL_LEVELS.to_vec(),
            formatter: formatter::default(),
            mode: DeliveryMode::Sync,
            error_logger: None,
            cancel: CancellationToken::new(),
            state: AtomicU8::new(HookState::Ready as u8),
            running: OnceLock::new(),
        })
    }

    pub fn state(&self) -> HookState {
        HookState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn document_type(&self) -> &str {
        &self.doc_type
    }

    pub fn mode(&self) -> &DeliveryMode {
        &self.mode
    }

    /// Levels this hook forwards, most severe first.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    fn configurable(&mut self) -> Result<(), HookError> {
        match HookState::from_u8(*self.state.get_mut()) {
            HookState::Ready => Ok(()),
            other => Err(HookError::NotConfigurable(other.name())),
        }
    }

    /// Forward `level` and everything more severe.
    pub fn set_level(&mut self, level: Level) -> Result<(), HookError> {
        self.configurable()?;
        self.levels = ALL_LEVELS.iter().copied().filter(|l| *l <= level).collect();
        Ok(())
    }

    pub fn set_formatter<F>(&mut self, formatter: F) -> Result<(), HookError>
    where
        F: Fn(&mut LogRecord) -> Document + Send + Sync + 'static,
    {
        self.configurable()?;
        self.formatter = Arc::new(formatter);
        Ok(())
    }

    pub fn set_document_type(&mut self, doc_type: impl Into<String>) -> Result<(), HookError> {
        self.configurable()?;
        self.doc_type = doc_type.into();
        Ok(())
    }

    pub fn set_error_logger<F>(&mut self, logger: F) -> Result<(), HookError>
    where
        F: Fn(&str, &HookError) + Send + Sync + 'static,
    {
        self.configurable()?;
        self.error_logger = Some(Arc::new(logger));
        Ok(())
    }

    pub fn enable_sync_flush(&mut self) -> Result<(), HookError> {
        self.configurable()?;
        self.mode = DeliveryMode::Sync;
        Ok(())
    }

    /// Deliver through a bounded worker pool; `fire` no longer waits for
    /// the backend and failures go to the error logger.
    pub fn enable_async_flush(&mut self, options: AsyncOptions) -> Result<(), HookError> {
        self.configurable()?;
        options.validate()?;
        self.mode = DeliveryMode::Async(options);
        Ok(())
    }

    /// Buffer documents and ship them through the bulk API.
    pub fn enable_bulk_flush(&mut self, options: BulkOptions) -> Result<(), HookError> {
        self.configurable()?;
        options.validate()?;
        self.mode = DeliveryMode::Bulk(options);
        Ok(())
    }

    fn running(&self) -> &Running {
        self.running.get_or_init(|| {
            let target = Arc::new(Target {
                client: Arc::clone(&self.client),
                index: self.index.clone(),
                doc_type: self.doc_type.clone(),
                error_logger: self.error_logger.clone(),
                cancel: self.cancel.clone(),
            });
            let strategy = Strategy::start(&self.mode, &target);
            debug!(index = %self.index, mode = ?self.mode, "delivery started");
            Running { target, strategy }
        })
    }

    /// Move Ready to Active and start the strategy. Once this succeeds,
    /// `close` sees the hook as Active and closes the same strategy.
    fn activate(&self) -> Result<&Running, HookError> {
        match self.state.compare_exchange(
            HookState::Ready as u8,
            HookState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {}
            Err(current) if HookState::from_u8(current) == HookState::Active => {}
            Err(_) => return Err(HookError::Closed),
        }
        Ok(self.running())
    }

    /// Forward one record: filter by level, format, hand to the active
    /// strategy. Only sync delivery can return a backend error here.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn fire(&self, mut record: LogRecord) -> Result<(), HookError> {
        if self.state() == HookState::Closed {
            return Err(HookError::Closed);
        }
        if !self.levels.contains(&record.level) {
            return Ok(());
        }

        let running = self.activate()?;
        let document = (self.formatter)(&mut record);
        // A concurrent close may have finished; its strategy reports late documents.
        running.strategy.deliver(&running.target, document).await
    }

    /// Push out anything buffered and wait for it to be committed. Only
    /// bulk delivery buffers.
    pub async fn flush(&self) {
        if self.state() == HookState::Closed {
            return;
        }
        if let Some(running) = self.running.get() {
            running.strategy.flush().await;
        }
    }

    /// Route an error the caller cannot handle to the error logger.
    pub fn report_error(&self, err: &HookError) {
        report(self.error_logger.as_ref(), SEND_FAILED, err);
    }

    /// Counters of the bulk engine, if bulk delivery with stats is running.
    pub fn bulk_stats(&self) -> Option<BulkStats> {
        self.running.get().and_then(|r| r.strategy.bulk_stats())
    }

    /// Drain the active strategy within its shutdown timeout, then cancel
    /// in-flight requests. Errors go to the error logger. Idempotent.
    pub async fn close(&self) {
        let previous = self.state.swap(HookState::Closed as u8, Ordering::SeqCst);
        if HookState::from_u8(previous) == HookState::Closed {
            return;
        }
        if HookState::from_u8(previous) == HookState::Active {
            // Waits for a strategy another `fire` is still starting.
            let running = self.running();
            running.strategy.close(&running.target).await;
        }
        self.cancel.cancel();
        debug!(index = %self.index, "hook closed");
    }
}

impl Drop for Hook {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryClient;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    async fn hook(index: &str) -> (Arc<MemoryClient>, Hook) {
        let client = Arc::new(MemoryClient::new());
        client.create_index(index);
        let hook = Hook::new(client.clone(), index).await.unwrap();
        (client, hook)
    }

    #[tokio::test]
    async fn missing_index_fails_construction() {
        let client = Arc::new(MemoryClient::new());
        let err = Hook::new(client, "nope").await.err().unwrap();
        assert!(matches!(err, HookError::IndexNotFound { .. }));
    }

    #[tokio::test]
    async fn failing_existence_check_fails_construction() {
        let client = Arc::new(MemoryClient::new());
        client.fail_exists_check(true);
        let err = Hook::new(client, "logs").await.err().unwrap();
        assert!(matches!(err, HookError::Construction { .. }));
    }

    #[tokio::test]
    async fn set_level_keeps_level_and_more_severe() {
        let (_, mut hook) = hook("logs").await;
        assert_eq!(hook.levels().len(), 5);
        hook.set_level(Level::WARN).unwrap();
        assert_eq!(hook.levels(), &[Level::ERROR, Level::WARN]);
    }

    #[tokio::test]
    async fn records_below_threshold_are_not_formatted() {
        let (client, mut hook) = hook("logs").await;
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        hook.set_level(Level::WARN).unwrap();
        hook.set_formatter(move |record| {
            seen.fetch_add(1, Ordering::SeqCst);
            formatter::default_formatter(record)
        })
        .unwrap();

        hook.fire(LogRecord::new(Level::INFO, "quiet")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(hook.state(), HookState::Ready);

        hook.fire(LogRecord::new(Level::ERROR, "loud")).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.count("logs"), 1);
        assert_eq!(hook.state(), HookState::Active);
    }

    #[tokio::test]
    async fn configuration_is_frozen_once_active() {
        let (_, mut hook) = hook("logs").await;
        hook.fire(LogRecord::new(Level::INFO, "first")).await.unwrap();
        let err = hook.enable_bulk_flush(BulkOptions::default()).err().unwrap();
        assert!(matches!(err, HookError::NotConfigurable("active")));
        assert!(hook.set_document_type("doc").is_err());
    }

    #[tokio::test]
    async fn sync_errors_reach_the_caller() {
        let (client, hook) = hook("logs").await;
        client.fail_transport(1);
        let err = hook.fire(LogRecord::new(Level::INFO, "x")).await.err().unwrap();
        assert!(matches!(err, HookError::Delivery { .. }));
    }

    #[tokio::test]
    async fn fire_after_close_is_rejected_and_close_is_idempotent() {
        let (_, hook) = hook("logs").await;
        hook.close().await;
        hook.close().await;
        assert_eq!(hook.state(), HookState::Closed);
        let err = hook.fire(LogRecord::new(Level::INFO, "late")).await.err().unwrap();
        assert!(matches!(err, HookError::Closed));
    }

    #[tokio::test]
    async fn close_before_activation_refuses_the_pending_fire() {
        let (client, mut hook) = hook("logs").await;
        hook.enable_bulk_flush(BulkOptions::default()).unwrap();

        hook.close().await;
        assert!(matches!(hook.activate(), Err(HookError::Closed)));
        assert!(hook.running.get().is_none());
        assert_eq!(client.bulk_calls(), 0);
    }

    #[tokio::test]
    async fn close_during_activation_closes_the_started_strategy() {
        let (client, mut hook) = hook("logs").await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        hook.set_error_logger(move |context, err| {
            sink.lock().unwrap().push(format!("{}: {}", context, err));
        })
        .unwrap();
        hook.enable_bulk_flush(BulkOptions::default()).unwrap();

        // A fire has moved the hook to Active but not yet started delivery.
        hook.state.store(HookState::Active as u8, Ordering::SeqCst);
        hook.close().await;

        // That fire now resumes and hands over its document.
        let running = hook.running.get().expect("close starts the strategy");
        let mut document = Document::new();
        document.insert("message".into(), json!("late"));
        running
            .strategy
            .deliver(&running.target, document)
            .await
            .unwrap();

        assert_eq!(client.count("logs"), 0);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("hook is closed"), "{}", errors[0]);
    }

    #[tokio::test]
    async fn async_errors_go_to_the_error_logger() {
        let (client, mut hook) = hook("logs").await;
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        hook.set_error_logger(move |context, err| {
            sink.lock().unwrap().push(format!("{}: {}", context, err));
        })
        .unwrap();
        hook.enable_async_flush(AsyncOptions {
            workers: 1,
            ..AsyncOptions::default()
        })
        .unwrap();

        client.fail_transport(1);
        hook.fire(LogRecord::new(Level::INFO, "a")).await.unwrap();
        hook.fire(LogRecord::new(Level::INFO, "b")).await.unwrap();
        hook.close().await;

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("couldn't send log to elastic"));
        assert_eq!(client.search("logs", "message", &json!("b")).len(), 1);
    }
}
