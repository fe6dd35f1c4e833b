use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use tracing_elastic_hook::{
    init::init_tracing, BulkItemResponse, BulkResponse, ClientError, Hook, IndexClient,
    IndexRequest,
};

/// Example of integrating a completely custom backend by implementing
/// the `IndexClient` trait directly. Imagine this talks to some
/// proprietary store for which this crate does not provide a client.
struct StdoutClient;

#[async_trait]
impl IndexClient for StdoutClient {
    async fn index_exists(&self, _index: &str) -> Result<bool, ClientError> {
        Ok(true)
    }

    async fn index(&self, request: &IndexRequest) -> Result<(), ClientError> {
        println!("[{}] {}", request.index, request.body);
        Ok(())
    }

    async fn bulk(&self, requests: &[IndexRequest]) -> Result<BulkResponse, ClientError> {
        let mut items = Vec::with_capacity(requests.len());
        for request in requests {
            self.index(request).await?;
            items.push(BulkItemResponse {
                index: request.index.clone(),
                status: 201,
                error: None,
            });
        }
        Ok(BulkResponse { took: 0, errors: false, items })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let hook = Arc::new(Hook::new(Arc::new(StdoutClient), "stdout").await?);
    init_tracing(Arc::clone(&hook))?;

    info!("custom client example started");
    error!(db = "stdout", "simulated error sent via custom client");

    hook.close().await;
    Ok(())
}
