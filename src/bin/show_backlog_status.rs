/// Show indicator backlog per timeframe as JSON
use std::sync::Arc;

use candleflow::{
    config::load_config,
    data::{BacklogTracker, JsonlBarStore},
    time::SystemClock,
    utils::init_tracing,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path)?;
    init_tracing(&config.log_level, config.log_json);

    let store = Arc::new(JsonlBarStore::open(&config.store.path).await?);
    let tracker = BacklogTracker::new(
        config.pair.clone(),
        store,
        Arc::new(SystemClock),
        config.indicators.version,
        config.indicators.batch_size,
    );

    let status = tracker.get_status().await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
