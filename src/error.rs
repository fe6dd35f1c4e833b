use std::sync::Arc;
use std::time::Duration;

/// Error reported by an [`IndexClient`](crate::client::IndexClient).
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode backend response: {0}")]
    Decode(String),
}

impl ClientError {
    /// HTTP-equivalent status code, when the backend produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(feature = "elasticsearch")]
impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Transport(err.to_string())
        }
    }
}

/// Errors surfaced by the hook and its delivery strategies.
#[derive(thiserror::Error, Debug)]
pub enum HookError {
    #[error("couldn't check index {index}: {source}")]
    Construction {
        index: String,
        #[source]
        source: ClientError,
    },

    #[error("index {index} does not exist")]
    IndexNotFound { index: String },

    #[error("couldn't send log to index {index}: {source}")]
    Delivery {
        index: String,
        #[source]
        source: ClientError,
    },

    #[error("bulk flush failed: {0}")]
    Flush(String),

    #[error("shutdown did not complete: {0}")]
    Shutdown(String),

    #[error("couldn't serialize document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("hook is {0} and can no longer be configured")]
    NotConfigurable(&'static str),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("async delivery queue is full ({capacity} documents)")]
    QueueFull { capacity: usize },

    #[error("hook is closed")]
    Closed,

    #[error("delivery cancelled")]
    Cancelled,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("couldn't install tracing subscriber: {0}")]
    SubscriberInit(String),
}

impl HookError {
    pub(crate) fn shutdown_timeout(what: &str, timeout: Duration) -> Self {
        HookError::Shutdown(format!("{} still running after {:?}", what, timeout))
    }
}

/// Callback receiving errors that cannot be returned to the caller.
///
/// The first argument is a short context message such as
/// `"couldn't send log to elastic"`.
pub type ErrorLogger = Arc<dyn Fn(&str, &HookError) + Send + Sync>;

/// Route an error to the logger, or to `tracing` diagnostics when none is set.
pub(crate) fn report(logger: Option<&ErrorLogger>, context: &str, err: &HookError) {
    // Loggers may log through `tracing`; keep that out of the hook.
    crate::layer::suppressed(|| match logger {
        Some(logger) => logger(context, err),
        None => tracing::warn!(error = %err, "{}", context),
    })
}
