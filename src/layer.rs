use crate::delivery::DeliveryMode;
use crate::error::HookError;
use crate::hook::Hook;
use crate::record::{CapturedError, FieldValue, LogRecord};
use chrono::Utc;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Targets whose events never reach the hook: this crate and the
/// transport it delivers through.
const IGNORED_TARGETS: &[&str] = &[
    "tracing_elastic_hook",
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tokio",
    "tokio_util",
    "mio",
    "want",
];

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` with events from the current thread ignored by every
/// [`HookLayer`].
pub(crate) fn suppressed<R>(f: impl FnOnce() -> R) -> R {
    let previous = IN_HOOK.with(|flag| flag.replace(true));
    let result = f();
    IN_HOOK.with(|flag| flag.set(previous));
    result
}

fn is_suppressed() -> bool {
    IN_HOOK.with(Cell::get)
}

fn is_ignored(target: &str) -> bool {
    IGNORED_TARGETS.iter().any(|prefix| {
        target
            .strip_prefix(prefix)
            .map_or(false, |rest| rest.is_empty() || rest.starts_with("::"))
    })
}

/// `tracing_subscriber` layer that turns events into [`LogRecord`]s and
/// fires them into a [`Hook`].
///
/// In sync mode the emitting thread waits for the backend, as the hook
/// promises. On a current-thread runtime that would deadlock, so the
/// delivery is spawned instead and ordering is no longer guaranteed.
pub struct HookLayer {
    hook: Arc<Hook>,
    handle: Handle,
    /// Total events seen by the layer (before filtering by level).
    pub total_events: Arc<AtomicU64>,
    /// Events handed to the hook.
    pub forwarded_events: Arc<AtomicU64>,
    /// Events skipped because they were emitted while delivering.
    pub suppressed_events: Arc<AtomicU64>,
}

impl HookLayer {
    /// Build a layer bound to the current tokio runtime.
    pub fn new(hook: Arc<Hook>) -> Result<Self, HookError> {
        let handle = Handle::try_current().map_err(|e| HookError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(hook, handle))
    }

    /// Build a layer that delivers through `handle` when events come from
    /// threads outside any runtime.
    pub fn with_handle(hook: Arc<Hook>, handle: Handle) -> Self {
        Self {
            hook,
            handle,
            total_events: Arc::new(AtomicU64::new(0)),
            forwarded_events: Arc::new(AtomicU64::new(0)),
            suppressed_events: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn hook(&self) -> &Arc<Hook> {
        &self.hook
    }

    fn dispatch(&self, record: LogRecord) {
        let hook = Arc::clone(&self.hook);
        let fire = async move {
            if let Err(e) = hook.fire(record).await {
                if !matches!(e, HookError::Closed) {
                    hook.report_error(&e);
                }
            }
        };

        match Handle::try_current() {
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
                suppressed(|| tokio::task::block_in_place(|| current.block_on(fire)));
            }
            Ok(current) => {
                if matches!(self.hook.mode(), DeliveryMode::Sync) {
                    tracing::debug!("current-thread runtime, sync delivery runs detached");
                }
                current.spawn(fire);
            }
            Err(_) => suppressed(|| self.handle.block_on(fire)),
        }
    }
}

impl<S> Layer<S> for HookLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        let meta = event.metadata();
        if !self.hook.levels().contains(meta.level()) || is_ignored(meta.target()) {
            return;
        }
        if is_suppressed() {
            self.suppressed_events.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut fields = BTreeMap::new();
        let mut message: Option<String> = None;

        let mut visitor = FieldVisitor { fields: &mut fields, message: &mut message };
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: Utc::now(),
            level: *meta.level(),
            target: meta.target().to_string(),
            message: message.unwrap_or_default(),
            fields,
        };

        self.forwarded_events.fetch_add(1, Ordering::Relaxed);
        self.dispatch(record);
    }
}

pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, FieldValue>,
    pub message: &'a mut Option<String>,
}

impl<'a> FieldVisitor<'a> {
    fn insert(&mut self, field: &Field, value: impl Into<serde_json::Value>) {
        self.fields
            .insert(field.name().to_string(), FieldValue::Json(value.into()));
    }
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            *self.message = Some(value.to_string());
        } else {
            self.insert(field, value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields.insert(
            field.name().to_string(),
            FieldValue::Error(Arc::new(CapturedError::capture(value))),
        );
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.message = Some(format!("{:?}", value));
        } else {
            self.insert(field, format!("{:?}", value));
        }
    }
}
