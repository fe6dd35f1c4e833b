use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::error;

use tracing_elastic_hook::init::{init_tracing_with_config, LayerConfig};
use tracing_elastic_hook::memory::MemoryClient;
use tracing_elastic_hook::{AsyncOptions, Hook, OverflowPolicy};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(MemoryClient::with_latency(Duration::from_micros(50)));
    client.create_index("load");

    let mut hook = Hook::new(client.clone(), "load").await?;
    hook.enable_async_flush(AsyncOptions {
        workers: 8,
        queue_capacity: 50_000,
        overflow: OverflowPolicy::Reject,
        ..AsyncOptions::default()
    })?;
    hook.set_error_logger(|_, _| {})?;
    let hook = Arc::new(hook);

    init_tracing_with_config(
        Arc::clone(&hook),
        LayerConfig {
            enable_stdout: false,
        },
    )?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "async load test error");
    }

    let elapsed = start.elapsed();
    hook.close().await;

    println!(
        "async: sent {} events in {:?} (~{:.0} ev/s), stored {}",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64(),
        client.count("load")
    );
    Ok(())
}
