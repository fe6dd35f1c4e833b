use crate::record::{level_name, FieldValue, LogRecord, ERROR_KEY};
use chrono::SecondsFormat;
use serde_json::{Map, Value};
use std::sync::Arc;

/// JSON object shipped to the search backend for one record.
pub type Document = Map<String, Value>;

/// Maps a record to its document.
///
/// Formatters receive the record mutably and may normalize error fields
/// in place (the default one replaces an error under [`ERROR_KEY`] with its
/// message). They must not perform I/O or retries.
pub type Formatter = Arc<dyn Fn(&mut LogRecord) -> Document + Send + Sync>;

/// Default document shape:
///
/// ```json
/// {"@timestamp": "...", "message": "...", "level": "info", "data": {...}}
/// ```
pub fn default_formatter(record: &mut LogRecord) -> Document {
    normalize_error(record);

    let mut doc = Document::new();
    doc.insert(
        "@timestamp".to_string(),
        Value::String(record.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
    );
    doc.insert("message".to_string(), Value::String(record.message.clone()));
    doc.insert(
        "level".to_string(),
        Value::String(level_name(record.level).to_string()),
    );
    doc.insert("data".to_string(), Value::Object(fields_to_json(record)));
    doc
}

/// Replace an error-typed value under [`ERROR_KEY`] with its string form.
pub fn normalize_error(record: &mut LogRecord) {
    if let Some(FieldValue::Error(err)) = record.fields.get(ERROR_KEY) {
        let text = err.to_string();
        record
            .fields
            .insert(ERROR_KEY.to_string(), FieldValue::Json(Value::String(text)));
    }
}

/// Field mapping as a JSON object. Remaining error values become strings.
pub fn fields_to_json(record: &LogRecord) -> Map<String, Value> {
    record
        .fields
        .iter()
        .map(|(k, v)| {
            let value = match v {
                FieldValue::Json(v) => v.clone(),
                FieldValue::Error(e) => Value::String(e.to_string()),
            };
            (k.clone(), value)
        })
        .collect()
}

pub(crate) fn default() -> Formatter {
    Arc::new(default_formatter)
}
