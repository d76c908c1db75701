/// Main entry point for the aggregation pipeline
use std::sync::Arc;

use tracing::{error, info};

use candleflow::{
    config::load_config,
    data::{BarStore, Fetcher, HttpFetcher, JsonlBarStore},
    scheduler::Scheduler,
    time::{Clock, SystemClock},
    utils::init_tracing,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let config = load_config(&config_path)?;
    init_tracing(&config.log_level, config.log_json);
    info!("Configuration loaded from {} for {}", config_path, config.pair);

    let jsonl = JsonlBarStore::open(&config.store.path)
        .await?
        .with_compact_min_ops(config.store.compact_min_ops);
    if jsonl.log_len().await > 0 {
        jsonl.compact().await?;
    }
    let store: Arc<dyn BarStore> = Arc::new(jsonl);
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.fetcher)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let scheduler = Arc::new(Scheduler::new(&config, store, fetcher, clock)?);

    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Ctrl+C received - stopping after the current cycle");
                    scheduler.stop().await;
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });
    }

    let result = scheduler.start().await;

    let stats = scheduler.get_stats().await;
    info!(
        "Scheduler exited as {}: {} cycles, {:.1}% successful",
        stats.status, stats.total_cycles, stats.success_rate
    );
    let health = scheduler.health_check().await;
    if !health.reasons.is_empty() {
        info!("Final health {}: {}", health.status, health.reasons.join("; "));
    }

    result?;
    Ok(())
}
