use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::error;

use tracing_elastic_hook::init::{init_tracing_with_config, LayerConfig};
use tracing_elastic_hook::memory::MemoryClient;
use tracing_elastic_hook::{BulkOptions, Hook};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(MemoryClient::new());
    client.create_index("load");

    let mut hook = Hook::new(client.clone(), "load").await?;
    hook.enable_bulk_flush(BulkOptions {
        workers: 4,
        bulk_actions: 1_000,
        flush_interval: Some(Duration::from_millis(200)),
        stats: true,
        ..BulkOptions::default()
    })?;
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
        error!(iteration = i, "bulk load test error");
    }

    let elapsed = start.elapsed();
    hook.close().await;

    println!(
        "bulk: sent {} events in {:?} (~{:.0} ev/s), stored {}",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64(),
        client.count("load")
    );
    if let Some(stats) = hook.bulk_stats() {
        println!("{:?}", stats);
    }
    Ok(())
}
