use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tracing::Level;

/// Reserved field key under which an event's error value is stored.
pub const ERROR_KEY: &str = "error";

/// Every level, most severe first.
pub const ALL_LEVELS: [Level; 5] = [
    Level::ERROR,
    Level::WARN,
    Level::INFO,
    Level::DEBUG,
    Level::TRACE,
];

/// Lowercase level name as it appears in shipped documents.
pub fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warning",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        Level::TRACE => "trace",
    }
}

/// Value of a single structured field attached to a [`LogRecord`].
///
/// Error values are kept as error objects until a formatter normalizes
/// them, so custom formatters can still inspect the source chain.
#[derive(Clone)]
pub enum FieldValue {
    Json(serde_json::Value),
    Error(Arc<dyn Error + Send + Sync>),
}

impl FieldValue {
    pub fn is_error(&self) -> bool {
        matches!(self, FieldValue::Error(_))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            FieldValue::Json(v) => Some(v),
            FieldValue::Error(_) => None,
        }
    }
}

impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Json(v) => write!(f, "{}", v),
            FieldValue::Error(e) => write!(f, "Error({})", e),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Json(v) => v.serialize(serializer),
            FieldValue::Error(e) => serializer.collect_str(e),
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::Json(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Json(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Json(serde_json::Value::String(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Json(value.into())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Json(value.into())
    }
}

/// Owned copy of a borrowed error and its source chain.
///
/// `tracing` only lends errors to visitors; this keeps their messages
/// around as a real error value.
#[derive(Debug, Clone)]
pub struct CapturedError {
    message: String,
    source: Option<Box<CapturedError>>,
}

impl CapturedError {
    pub fn capture(err: &(dyn Error + 'static)) -> Self {
        CapturedError {
            message: err.to_string(),
            source: err.source().map(|s| Box::new(CapturedError::capture(s))),
        }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for CapturedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_deref().map(|s| s as &(dyn Error + 'static))
    }
}

/// A single log event as handed to the hook by the logging framework.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(serialize_with = "serialize_level")]
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, FieldValue>,
}

fn serialize_level<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(level_name(*level))
}

impl LogRecord {
    /// Record stamped with the current time and no fields.
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        LogRecord {
            timestamp: Utc::now(),
            level,
            target: String::new(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Attach an error under [`ERROR_KEY`].
    pub fn with_error<E>(mut self, err: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        self.fields
            .insert(ERROR_KEY.to_string(), FieldValue::Error(Arc::new(err)));
        self
    }
}
