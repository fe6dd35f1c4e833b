use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::Level;
use tracing_elastic_hook::memory::MemoryClient;
use tracing_elastic_hook::{BulkOptions, Hook, HookLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

async fn shared_hook(client: &Arc<MemoryClient>, level: Level, bulk: bool) -> Arc<Hook> {
    client.create_index("layer");
    let mut hook = Hook::new(client.clone(), "layer").await.unwrap();
    hook.set_level(level).unwrap();
    if bulk {
        hook.enable_bulk_flush(BulkOptions::default()).unwrap();
    }
    Arc::new(hook)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_become_documents_in_sync_mode() {
    let client = Arc::new(MemoryClient::new());
    let hook = shared_hook(&client, Level::INFO, false).await;
    let layer = HookLayer::new(Arc::clone(&hook)).unwrap();
    let forwarded = Arc::clone(&layer.forwarded_events);
    let subscriber = Registry::default().with(layer);

    tracing::subscriber::with_default(subscriber, || {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "invalid password");
        tracing::error!(user_id = 42, error = &err as &dyn std::error::Error, "authentication failed");
        tracing::info!(attempt = 3u64, "retrying");
        tracing::debug!("too chatty");
    });

    // Sync delivery finished before each macro returned.
    assert_eq!(forwarded.load(Ordering::Relaxed), 2);
    let docs = client.documents("layer");
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["message"], "authentication failed");
    assert_eq!(docs[0]["level"], "error");
    assert_eq!(docs[0]["data"], json!({ "user_id": 42, "error": "invalid password" }));
    assert_eq!(docs[1]["level"], "info");
    assert_eq!(docs[1]["data"]["attempt"], 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn own_diagnostics_are_not_shipped() {
    let client = Arc::new(MemoryClient::new());
    let hook = shared_hook(&client, Level::TRACE, false).await;
    let subscriber = Registry::default().with(HookLayer::new(Arc::clone(&hook)).unwrap());

    tracing::subscriber::with_default(subscriber, || {
        tracing::warn!(target: "tracing_elastic_hook::bulk", "internal");
        tracing::trace!(target: "hyper::client", "connection pooled");
        tracing::trace!("from the app");
    });

    let docs = client.documents("layer");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["message"], "from the app");
}

#[test]
fn threads_outside_the_runtime_deliver_through_the_handle() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();
    let client = Arc::new(MemoryClient::new());
    let hook = runtime.block_on(shared_hook(&client, Level::INFO, true));
    let layer = HookLayer::with_handle(Arc::clone(&hook), runtime.handle().clone());
    let subscriber = Registry::default().with(layer);

    tracing::subscriber::with_default(subscriber, || {
        for n in 0..10 {
            tracing::info!(n, "plain thread");
        }
    });

    assert_eq!(client.count("layer"), 0);
    runtime.block_on(hook.close());
    assert_eq!(client.count("layer"), 10);
}
