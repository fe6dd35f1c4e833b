use std::sync::Arc;

use tracing::{error, info};
use tracing_elastic_hook::{
    elastic::{ElasticClient, ElasticConfig},
    env::{env_or, ELASTIC_HOOK_INDEX_ENV},
    init::init_tracing,
    BulkOptions, Hook,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ELASTIC_HOOK_URL=http://localhost:9200 ELASTIC_HOOK_INDEX=logs
    let config = ElasticConfig::from_env();
    let index = env_or(ELASTIC_HOOK_INDEX_ENV, "logs");
    let client = Arc::new(ElasticClient::new(config)?);

    let mut hook = Hook::new(client, index).await?;
    hook.enable_bulk_flush(BulkOptions {
        workers: 2,
        flush_interval: Some(std::time::Duration::from_secs(1)),
        ..BulkOptions::default()
    })?;
    hook.set_error_logger(|context, err| eprintln!("{}: {}", context, err))?;
    let hook = Arc::new(hook);

    init_tracing(Arc::clone(&hook))?;

    info!("elastic backend example started");
    error!(user_id = 42, reason = "invalid password", "authentication failed");

    hook.close().await;
    Ok(())
}
