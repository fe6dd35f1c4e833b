pub mod backoff;
pub mod bulk;
pub mod client;
pub mod delivery;
pub mod env;
pub mod error;
pub mod formatter;
pub mod hook;
pub mod init;
pub mod layer;
pub mod memory;
pub mod record;

#[cfg(feature = "elasticsearch")]
pub mod elastic;

pub use backoff::Backoff;
pub use bulk::{BulkAfterFn, BulkBeforeFn, BulkOptions, BulkStats};
pub use client::{BulkItemResponse, BulkResponse, IndexClient, IndexRequest};
pub use delivery::{AsyncOptions, DeliveryMode, OverflowPolicy};
pub use error::{ClientError, ErrorLogger, HookError};
pub use formatter::{default_formatter, Document, Formatter};
pub use hook::{Hook, HookState};
pub use layer::HookLayer;
pub use record::{FieldValue, LogRecord, ERROR_KEY};
