use crate::error::ClientError;
use crate::formatter::Document;
use async_trait::async_trait;
use serde_json::json;

/// Default mapping type used when a hook does not set one.
pub const DEFAULT_DOC_TYPE: &str = "_doc";

/// A single document addressed to a collection, serialized once up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRequest {
    pub index: String,
    pub doc_type: String,
    /// JSON-encoded document.
    pub body: String,
}

impl IndexRequest {
    pub fn new(
        index: impl Into<String>,
        doc_type: impl Into<String>,
        document: &Document,
    ) -> Result<Self, serde_json::Error> {
        Ok(IndexRequest {
            index: index.into(),
            doc_type: doc_type.into(),
            body: serde_json::to_string(document)?,
        })
    }

    /// `_bulk` action line describing this request (without newline).
    pub fn action_line(&self) -> String {
        let action = if self.doc_type.is_empty() || self.doc_type == DEFAULT_DOC_TYPE {
            json!({ "index": { "_index": self.index } })
        } else {
            json!({ "index": { "_index": self.index, "_type": self.doc_type } })
        };
        action.to_string()
    }

    /// Bytes this request adds to a `_bulk` payload.
    pub fn size_in_bytes(&self) -> usize {
        self.action_line().len() + self.body.len() + 2
    }
}

/// Outcome of one item inside a bulk request, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResponse {
    pub index: String,
    pub status: u16,
    pub error: Option<String>,
}

impl BulkItemResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub took: u64,
    pub errors: bool,
    pub items: Vec<BulkItemResponse>,
}

impl BulkResponse {
    pub fn failed(&self) -> impl Iterator<Item = &BulkItemResponse> {
        self.items.iter().filter(|item| !item.is_success())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &BulkItemResponse> {
        self.items.iter().filter(|item| item.is_success())
    }
}

/// Remote document store the hook delivers to.
///
/// Implementations must tolerate concurrent use: one client instance is
/// shared by every delivery strategy and worker of a hook.
#[async_trait]
pub trait IndexClient: Send + Sync {
    /// Whether the named collection exists.
    async fn index_exists(&self, index: &str) -> Result<bool, ClientError>;

    /// Index a single document and wait for the acknowledgement.
    async fn index(&self, request: &IndexRequest) -> Result<(), ClientError>;

    /// Submit a batch. `Ok` carries one item per request, in order;
    /// item-level failures are reported there, not as `Err`.
    async fn bulk(&self, requests: &[IndexRequest]) -> Result<BulkResponse, ClientError>;
}
