use crate::client::{BulkItemResponse, BulkResponse, IndexClient, IndexRequest};
use crate::delivery::lock;
use crate::error::ClientError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-process document store implementing [`IndexClient`].
///
/// Useful for measuring the overhead of the hook itself without any
/// external I/O, and for tests that need to observe what was shipped.
/// Faults can be injected per bulk item or per call.
#[derive(Default)]
pub struct MemoryClient {
    indices: Mutex<HashMap<String, Vec<Value>>>,
    item_faults: Mutex<VecDeque<u16>>,
    transport_faults: AtomicUsize,
    exists_fails: AtomicBool,
    latency: Option<Duration>,
    index_calls: AtomicU64,
    bulk_calls: AtomicU64,
}

impl MemoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every index and bulk call by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn create_index(&self, index: &str) {
        lock(&self.indices).entry(index.to_string()).or_default();
    }

    pub fn delete_index(&self, index: &str) {
        lock(&self.indices).remove(index);
    }

    pub fn documents(&self, index: &str) -> Vec<Value> {
        lock(&self.indices).get(index).cloned().unwrap_or_default()
    }

    pub fn count(&self, index: &str) -> usize {
        lock(&self.indices).get(index).map_or(0, Vec::len)
    }

    /// Documents whose value at the dotted `path` equals `expected`.
    pub fn search(&self, index: &str, path: &str, expected: &Value) -> Vec<Value> {
        self.documents(index)
            .into_iter()
            .filter(|doc| lookup(doc, path) == Some(expected))
            .collect()
    }

    /// Make the next bulk items fail with the given statuses, one status
    /// per item, consumed in order across bulk calls.
    pub fn fail_bulk_items(&self, statuses: impl IntoIterator<Item = u16>) {
        lock(&self.item_faults).extend(statuses);
    }

    /// Make the next `times` index or bulk calls fail at the transport level.
    pub fn fail_transport(&self, times: usize) {
        self.transport_faults.store(times, Ordering::SeqCst);
    }

    /// Make `index_exists` return a transport error.
    pub fn fail_exists_check(&self, fail: bool) {
        self.exists_fails.store(fail, Ordering::SeqCst);
    }

    pub fn index_calls(&self) -> u64 {
        self.index_calls.load(Ordering::SeqCst)
    }

    pub fn bulk_calls(&self) -> u64 {
        self.bulk_calls.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) -> Result<(), ClientError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .transport_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ClientError::Transport("injected transport failure".to_string()));
        }
        Ok(())
    }

    fn store(&self, request: &IndexRequest) -> Result<(), ClientError> {
        let doc: Value = serde_json::from_str(&request.body)
            .map_err(|e| ClientError::Status { status: 400, body: e.to_string() })?;
        lock(&self.indices)
            .entry(request.index.clone())
            .or_default()
            .push(doc);
        Ok(())
    }
}

#[async_trait]
impl IndexClient for MemoryClient {
    async fn index_exists(&self, index: &str) -> Result<bool, ClientError> {
        if self.exists_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("injected exists failure".to_string()));
        }
        Ok(lock(&self.indices).contains_key(index))
    }

    async fn index(&self, request: &IndexRequest) -> Result<(), ClientError> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;
        self.store(request)
    }

    async fn bulk(&self, requests: &[IndexRequest]) -> Result<BulkResponse, ClientError> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;

        let mut items = Vec::with_capacity(requests.len());
        for request in requests {
            let fault = lock(&self.item_faults).pop_front();
            let item = match fault {
                Some(status) => BulkItemResponse {
                    index: request.index.clone(),
                    status,
                    error: Some(format!("injected failure with status {}", status)),
                },
                None => match self.store(request) {
                    Ok(()) => BulkItemResponse {
                        index: request.index.clone(),
                        status: 201,
                        error: None,
                    },
                    Err(e) => BulkItemResponse {
                        index: request.index.clone(),
                        status: e.status().unwrap_or(500),
                        error: Some(e.to_string()),
                    },
                },
            };
            items.push(item);
        }

        Ok(BulkResponse {
            took: 0,
            errors: items.iter().any(|i| !i.is_success()),
            items,
        })
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| value.get(key))
}
